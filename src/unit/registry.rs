// Unit registry - Static name to constructor mapping

use crate::error::{Result, SidecarError};
use crate::unit::{Plugin, SharedResources, Unit, UnitError};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Builds an initialized unit from its raw configuration
pub type Constructor =
    Box<dyn Fn(&Value, &SharedResources) -> Result<Arc<dyn Unit>> + Send + Sync>;

/// Catalog of unit constructors, each owning its configuration schema
#[derive(Default)]
pub struct Registry {
    constructors: BTreeMap<String, Constructor>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a [`Plugin`] under its `NAME`
    pub fn register<P: Plugin>(&mut self) -> &mut Self {
        self.register_fn(P::NAME, |config: P::Config, shared| {
            let mut plugin = P::create();
            plugin.init(config, shared)?;
            Ok(Arc::new(plugin) as Arc<dyn Unit>)
        })
    }

    /// Register a constructor closure with its own configuration type `C`
    ///
    /// The raw config is decoded into `C` first (a mismatch is
    /// `InvalidConfig`), then handed to `factory` (an error is `InitFailed`).
    pub fn register_fn<C, F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        C: DeserializeOwned,
        F: Fn(C, &SharedResources) -> std::result::Result<Arc<dyn Unit>, UnitError>
            + Send
            + Sync
            + 'static,
    {
        let unit_name = name.to_string();
        let constructor: Constructor = Box::new(move |raw, shared| {
            let config = decode_config::<C>(&unit_name, raw)?;
            factory(config, shared).map_err(|e| SidecarError::InitFailed {
                unit: unit_name.clone(),
                reason: e.to_string(),
            })
        });

        if self
            .constructors
            .insert(name.to_string(), constructor)
            .is_some()
        {
            tracing::warn!(unit = %name, "Replaced existing registry entry");
        }
        self
    }

    /// Look up the constructor registered for `name`
    pub fn resolve(&self, name: &str) -> Option<&Constructor> {
        self.constructors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// Resolve, decode and initialize a unit in one step
    pub fn construct(
        &self,
        name: &str,
        raw: &Value,
        shared: &SharedResources,
    ) -> Result<Arc<dyn Unit>> {
        let constructor = self
            .resolve(name)
            .ok_or_else(|| SidecarError::NotFound(name.to_string()))?;
        constructor(raw, shared)
    }
}

/// Decode a raw config into the unit's declared shape; `null` reads as `{}`
fn decode_config<C: DeserializeOwned>(unit: &str, raw: &Value) -> Result<C> {
    let raw = match raw {
        Value::Null => Value::Object(serde_json::Map::new()),
        other => other.clone(),
    };

    serde_json::from_value(raw).map_err(|e| SidecarError::InvalidConfig {
        unit: unit.to_string(),
        reason: e.to_string(),
    })
}

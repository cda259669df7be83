use crate::unit::{ErrorSink, Plugin, SharedResources, Unit, UnitError, UnitName, UnitStatus};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EchoConfig {
    /// Logged when the unit starts
    #[serde(default)]
    pub greeting: Option<String>,
}

/// Minimal unit: running between start and stop, no background work
#[derive(Debug, Default)]
pub struct Echo {
    greeting: String,
    version: String,
    running: AtomicBool,
}

impl Plugin for Echo {
    type Config = EchoConfig;
    const NAME: &'static str = "echo";

    fn create() -> Self {
        Self::default()
    }

    fn init(&mut self, config: EchoConfig, shared: &SharedResources) -> Result<(), UnitError> {
        self.greeting = config.greeting.unwrap_or_else(|| "hello".to_string());
        self.version = shared.version.clone();
        Ok(())
    }
}

#[async_trait]
impl Unit for Echo {
    fn name(&self) -> UnitName {
        UnitName::new(Self::NAME)
    }

    async fn start(&self, _ctx: CancellationToken, _errors: ErrorSink) {
        tracing::info!(unit = Self::NAME, "{}", self.greeting);
        self.running.store(true, Ordering::SeqCst);
    }

    async fn stop(&self, _ctx: CancellationToken) -> Result<(), UnitError> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn status(&self) -> Result<UnitStatus, UnitError> {
        Ok(UnitStatus::new(self.running.load(Ordering::SeqCst))
            .with_detail(json!({ "greeting": self.greeting, "version": self.version })))
    }
}

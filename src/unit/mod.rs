// Unit module - Capability set shared by every supervised unit

pub mod registry;

pub use registry::{Constructor, Registry};

use crate::error::SidecarError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Unique identifier of a unit within the active set
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitName(String);

impl UnitName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for UnitName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UnitName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for UnitName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Health snapshot reported by a unit
///
/// Snapshots are replaced wholesale on every refresh and never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitStatus {
    /// Whether the unit considers itself running
    pub running: bool,
    /// Opaque unit-reported detail
    #[serde(default)]
    pub detail: serde_json::Value,
    /// When the snapshot was taken
    pub checked_at: DateTime<Utc>,
}

impl UnitStatus {
    pub fn new(running: bool) -> Self {
        Self {
            running,
            detail: serde_json::Value::Null,
            checked_at: Utc::now(),
        }
    }

    pub fn running() -> Self {
        Self::new(true)
    }

    pub fn stopped() -> Self {
        Self::new(false)
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Lifecycle state of a unit as seen by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    Added,
    Starting,
    Running,
    Failed,
    Stopped,
    /// Being removed from the active set; never started again
    Removed,
}

impl UnitState {
    /// A unit may be launched only from these states
    pub fn can_start(&self) -> bool {
        matches!(self, UnitState::Added | UnitState::Stopped)
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnitState::Added => "added",
            UnitState::Starting => "starting",
            UnitState::Running => "running",
            UnitState::Failed => "failed",
            UnitState::Stopped => "stopped",
            UnitState::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// Failure reported by a unit's own operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct UnitError(String);

impl UnitError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<String> for UnitError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for UnitError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Resources every unit receives at initialization
#[derive(Debug, Clone)]
pub struct SharedResources {
    /// Version of the running sidecar
    pub version: String,
    /// When the sidecar process booted
    pub booted_at: DateTime<Utc>,
}

impl SharedResources {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            booted_at: Utc::now(),
        }
    }
}

impl Default for SharedResources {
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_VERSION"))
    }
}

/// Handle a unit uses to report a fatal failure
///
/// Clones share one "reported" flag: only the first report per unit reaches
/// the channel.
#[derive(Debug, Clone)]
pub struct ErrorSink {
    unit: UnitName,
    tx: mpsc::UnboundedSender<SidecarError>,
    reported: Arc<AtomicBool>,
    state: Option<Arc<watch::Sender<UnitState>>>,
}

impl ErrorSink {
    /// Create a standalone sink and the receiving end of its channel
    pub fn channel(unit: impl Into<UnitName>) -> (Self, FatalErrors) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(unit.into(), tx, None), FatalErrors::new(rx))
    }

    pub(crate) fn new(
        unit: UnitName,
        tx: mpsc::UnboundedSender<SidecarError>,
        state: Option<Arc<watch::Sender<UnitState>>>,
    ) -> Self {
        Self {
            unit,
            tx,
            reported: Arc::new(AtomicBool::new(false)),
            state,
        }
    }

    pub fn unit(&self) -> &UnitName {
        &self.unit
    }

    /// Report a fatal failure
    ///
    /// Returns `true` if this report was delivered. Later reports from the
    /// same unit, or reports after the receiver is gone, return `false`.
    pub fn report(&self, error: impl Into<UnitError>) -> bool {
        if self.reported.swap(true, Ordering::SeqCst) {
            return false;
        }

        if let Some(state) = &self.state {
            state.send_if_modified(|current| match current {
                UnitState::Starting | UnitState::Running => {
                    *current = UnitState::Failed;
                    true
                }
                _ => false,
            });
        }

        self.tx
            .send(SidecarError::UnitFatal {
                unit: self.unit.to_string(),
                source: error.into(),
            })
            .is_ok()
    }

    pub fn has_reported(&self) -> bool {
        self.reported.load(Ordering::SeqCst)
    }
}

/// Receiving end of the shared fatal-error channel
#[derive(Debug)]
pub struct FatalErrors {
    rx: mpsc::UnboundedReceiver<SidecarError>,
}

impl FatalErrors {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<SidecarError>) -> Self {
        Self { rx }
    }

    /// Wait for the next fatal error
    ///
    /// Returns `None` once every unit that could report on this channel has
    /// been stopped or removed.
    pub async fn recv(&mut self) -> Option<SidecarError> {
        self.rx.recv().await
    }

    /// Take a pending fatal error without waiting
    pub fn try_recv(&mut self) -> Result<SidecarError, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}

/// Capability set of an independently runnable unit
#[async_trait]
pub trait Unit: Send + Sync + 'static {
    /// Identity of the unit, unique within the active set
    fn name(&self) -> UnitName;

    /// Start the unit
    ///
    /// Resolves once the unit has finished starting. Long-running work belongs
    /// in tasks the unit spawns itself; those tasks keep a clone of `errors`
    /// and watch `ctx` for cancellation. All failures go through `errors`.
    async fn start(&self, ctx: CancellationToken, errors: ErrorSink);

    /// Stop the unit, honoring `ctx` cancellation
    async fn stop(&self, ctx: CancellationToken) -> Result<(), UnitError>;

    /// Query the unit's current health
    async fn status(&self) -> Result<UnitStatus, UnitError>;
}

/// A unit the registry can build from a raw configuration
pub trait Plugin: Unit + Sized {
    /// Configuration shape this unit decodes its raw config into
    type Config: DeserializeOwned;

    /// Registry name
    const NAME: &'static str;

    fn create() -> Self;

    /// Apply a decoded configuration; an error rejects the unit
    fn init(&mut self, config: Self::Config, shared: &SharedResources) -> Result<(), UnitError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_error_sink_delivers_single_report() {
        let (sink, mut errors) = ErrorSink::channel("flaky");
        let clone = sink.clone();

        assert!(sink.report("first"));
        assert!(!clone.report("second"));
        assert!(clone.has_reported());

        match errors.recv().await {
            Some(SidecarError::UnitFatal { unit, source }) => {
                assert_eq!(unit, "flaky");
                assert_eq!(source.message(), "first");
            }
            other => panic!("unexpected: {:?}", other),
        }

        drop(sink);
        drop(clone);
        assert!(errors.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_error_sink_marks_state_failed() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let state = Arc::new(watch::channel(UnitState::Running).0);
        let sink = ErrorSink::new(UnitName::new("u"), tx, Some(Arc::clone(&state)));

        sink.report("down");
        assert_eq!(*watch::Sender::borrow(&state), UnitState::Failed);
    }

    #[test]
    fn test_unit_state_can_start() {
        assert!(UnitState::Added.can_start());
        assert!(UnitState::Stopped.can_start());
        assert!(!UnitState::Starting.can_start());
        assert!(!UnitState::Running.can_start());
        assert!(!UnitState::Failed.can_start());
        assert!(!UnitState::Removed.can_start());
    }

    #[test]
    fn test_unit_name_borrows_as_str() {
        let mut map = std::collections::HashMap::new();
        map.insert(UnitName::new("echo"), 1);
        assert_eq!(map.get("echo"), Some(&1));
        assert_eq!(UnitName::from("echo").to_string(), "echo");
    }
}

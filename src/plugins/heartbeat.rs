use crate::unit::{ErrorSink, Plugin, SharedResources, Unit, UnitError, UnitName, UnitStatus};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatConfig {
    /// Time between beats (in milliseconds)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Logged on every beat
    #[serde(default = "default_message")]
    pub message: String,

    /// Report a fatal error after this many beats
    #[serde(default)]
    pub fail_after: Option<u64>,
}

/// Longest accepted beat interval (one day)
const MAX_INTERVAL_MS: u64 = 86_400_000;

fn default_interval_ms() -> u64 {
    1000
}

fn default_message() -> String {
    "beat".to_string()
}

/// Unit that logs a beat on a fixed interval in a background task
pub struct Heartbeat {
    interval: Duration,
    message: String,
    fail_after: Option<u64>,
    beats: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Plugin for Heartbeat {
    type Config = HeartbeatConfig;
    const NAME: &'static str = "heartbeat";

    fn create() -> Self {
        Self {
            interval: Duration::from_millis(default_interval_ms()),
            message: default_message(),
            fail_after: None,
            beats: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    fn init(&mut self, config: HeartbeatConfig, _shared: &SharedResources) -> Result<(), UnitError> {
        if config.interval_ms == 0 {
            return Err(UnitError::new("interval_ms must be greater than 0"));
        }
        if config.interval_ms > MAX_INTERVAL_MS {
            return Err(UnitError::new(format!(
                "interval_ms must not exceed {}",
                MAX_INTERVAL_MS
            )));
        }
        if config.fail_after == Some(0) {
            return Err(UnitError::new("fail_after must be greater than 0"));
        }

        self.interval = Duration::from_millis(config.interval_ms);
        self.message = config.message;
        self.fail_after = config.fail_after;
        Ok(())
    }
}

#[async_trait]
impl Unit for Heartbeat {
    fn name(&self) -> UnitName {
        UnitName::new(Self::NAME)
    }

    async fn start(&self, ctx: CancellationToken, errors: ErrorSink) {
        let halt = ctx.child_token();
        let interval = self.interval;
        let message = self.message.clone();
        let fail_after = self.fail_after;
        let beats = Arc::clone(&self.beats);
        let running = Arc::clone(&self.running);

        running.store(true, Ordering::SeqCst);
        let token = halt.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let count = beats.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::info!(unit = Self::NAME, beat = count, "{}", message);

                if fail_after.is_some_and(|limit| count >= limit) {
                    errors.report(format!("stopped beating after {} beats", count));
                    break;
                }
            }
            running.store(false, Ordering::SeqCst);
        });

        *self.task.lock().await = Some((halt, handle));
    }

    async fn stop(&self, ctx: CancellationToken) -> Result<(), UnitError> {
        let Some((halt, handle)) = self.task.lock().await.take() else {
            return Ok(());
        };
        halt.cancel();

        tokio::select! {
            joined = handle => joined.map_err(|e| UnitError::new(format!("beat task failed: {}", e))),
            _ = ctx.cancelled() => Err(UnitError::new("stop cancelled before beat task exited")),
        }
    }

    async fn status(&self) -> Result<UnitStatus, UnitError> {
        Ok(UnitStatus::new(self.running.load(Ordering::SeqCst))
            .with_detail(json!({ "beats": self.beats.load(Ordering::SeqCst) })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SidecarError;

    fn heartbeat(fail_after: Option<u64>) -> Heartbeat {
        let mut unit = Heartbeat::create();
        unit.init(
            HeartbeatConfig {
                interval_ms: 10,
                message: "tick".to_string(),
                fail_after,
            },
            &SharedResources::default(),
        )
        .unwrap();
        unit
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut unit = Heartbeat::create();
        let config: HeartbeatConfig = serde_json::from_value(json!({ "interval_ms": 0 })).unwrap();
        assert!(unit.init(config, &SharedResources::default()).is_err());
    }

    #[test]
    fn test_oversized_interval_rejected() {
        let mut unit = Heartbeat::create();
        let config: HeartbeatConfig =
            serde_json::from_value(json!({ "interval_ms": u64::MAX })).unwrap();
        let err = unit.init(config, &SharedResources::default()).unwrap_err();
        assert!(err.message().contains("must not exceed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_beats_until_stopped() {
        let unit = heartbeat(None);
        let (sink, _errors) = ErrorSink::channel(Heartbeat::NAME);

        unit.start(CancellationToken::new(), sink).await;
        tokio::time::sleep(Duration::from_millis(55)).await;

        let status = unit.status().await.unwrap();
        assert!(status.running);
        assert!(status.detail["beats"].as_u64().unwrap() >= 5);

        unit.stop(CancellationToken::new()).await.unwrap();
        assert!(!unit.status().await.unwrap().running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_fatal_after_limit() {
        let unit = heartbeat(Some(3));
        let (sink, mut errors) = ErrorSink::channel(Heartbeat::NAME);

        unit.start(CancellationToken::new(), sink).await;

        match errors.recv().await {
            Some(SidecarError::UnitFatal { unit: name, source }) => {
                assert_eq!(name, "heartbeat");
                assert_eq!(source.message(), "stopped beating after 3 beats");
            }
            other => panic!("unexpected: {:?}", other),
        }

        unit.stop(CancellationToken::new()).await.unwrap();
        assert!(!unit.status().await.unwrap().running);
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let unit = heartbeat(None);
        assert!(unit.stop(CancellationToken::new()).await.is_ok());
    }
}

use crate::config::SidecarConfig;
use crate::coordinator::{Coordinator, CoordinatorConfig};
use crate::error::{Result, SidecarError};
use crate::health::HealthServer;
use crate::unit::{FatalErrors, Registry};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Drives the coordinator through boot, run and bounded shutdown
///
/// Any single unit's fatal error ends the run: the supervisor stops waiting,
/// shuts every unit down and returns that error.
pub struct Supervisor {
    config: Arc<SidecarConfig>,
    coordinator: Coordinator,
}

impl Supervisor {
    /// Create a supervisor for `config`, resolving units from `registry`
    pub fn new(config: SidecarConfig, registry: Registry) -> Self {
        let config = Arc::new(config);
        let coordinator = Coordinator::new(
            Arc::new(registry),
            CoordinatorConfig::from_sidecar(Arc::clone(&config)),
        );
        Self {
            config,
            coordinator,
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn config(&self) -> &SidecarConfig {
        &self.config
    }

    /// Add every configured unit in boot order
    ///
    /// Stops at the first unit that cannot be added.
    pub async fn init_units(&self) -> Result<()> {
        for plugin in self.config.boot_plan() {
            self.coordinator
                .add_unit(&plugin.name, &plugin.config)
                .await
                .map_err(|e| {
                    error!(unit = %plugin.name, "Failed to add configured unit: {}", e);
                    e
                })?;
        }
        Ok(())
    }

    /// Boot, then run until `shutdown` resolves or a unit fails
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(version = %self.coordinator.version(), "Starting sidecar");

        self.init_units().await?;

        let ctx = CancellationToken::new();
        let mut errors = self.coordinator.start_all(&ctx).await;

        if self.config.health_check {
            match HealthServer::bind(&self.config.health_addr, self.coordinator.clone()).await {
                Ok(server) => {
                    tokio::spawn(server.run(ctx.child_token()));
                }
                Err(e) => {
                    self.shutdown(&ctx).await;
                    return Err(e);
                }
            }
        }

        info!("Sidecar started successfully");

        let outcome = tokio::select! {
            fatal = next_fatal(&mut errors) => {
                error!(unit = fatal.unit().unwrap_or("<unknown>"), "Unit failed, shutting down sidecar: {}", fatal);
                Err(fatal)
            }
            _ = shutdown => {
                info!("Received shutdown signal, stopping sidecar");
                Ok(())
            }
        };

        let stopped = self.shutdown(&ctx).await;
        outcome.and(stopped)
    }

    /// Cancel every start context, stop all units within the configured deadline
    ///
    /// A second SIGINT while units are stopping cuts the wait short.
    async fn shutdown(&self, ctx: &CancellationToken) -> Result<()> {
        ctx.cancel();

        // A second interrupt abandons units that are still stopping
        let abort = CancellationToken::new();
        let watcher = tokio::spawn({
            let abort = abort.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Received second interrupt, abandoning unit stops");
                    abort.cancel();
                }
            }
        });

        let result = self
            .coordinator
            .stop_all(&abort, self.config.stop_timeout())
            .await;
        watcher.abort();
        if let Err(e) = &result {
            error!("Error during shutdown of units: {}", e);
        }

        self.coordinator.close().await;
        info!("Sidecar shutdown complete");
        result
    }
}

/// Wait for the first fatal error
///
/// The channel closes once no launched unit remains active; from then on
/// nothing can fail and this never resolves.
async fn next_fatal(errors: &mut FatalErrors) -> SidecarError {
    match errors.recv().await {
        Some(fatal) => fatal,
        None => std::future::pending().await,
    }
}

/// Resolve on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for SIGINT: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received SIGINT");
}

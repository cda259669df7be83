// CLI module - Command-line front end for the sidecar

use crate::config::SidecarConfig;
use crate::plugins::builtin_registry;
use crate::supervisor::{shutdown_signal, Supervisor};
use crate::unit::SharedResources;
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Default configuration file path
const DEFAULT_CONFIG_PATH: &str = "kidecar.toml";

/// Kidecar - A sidecar process supervisor
#[derive(Parser, Debug)]
#[command(name = "kidecar")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log level filter (overridden by RUST_LOG)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the supervisor until a signal or a unit failure
    Run {
        /// Path to the sidecar configuration (.toml or .json)
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Serve the health endpoint regardless of the configuration
        #[arg(long)]
        health: bool,

        /// Override the health endpoint address
        #[arg(long)]
        health_addr: Option<String>,
    },

    /// Validate a configuration without starting any unit
    Check {
        /// Path to the sidecar configuration (.toml or .json)
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// List registered units
    Plugins,
}

impl Cli {
    /// Install the tracing subscriber for this invocation
    pub fn init_tracing(&self) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.log_level));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    /// Execute the parsed command
    pub async fn execute(self) -> anyhow::Result<()> {
        match self.command {
            Commands::Run {
                config,
                health,
                health_addr,
            } => {
                let mut sidecar = load_config(&config)?;
                if health {
                    sidecar.health_check = true;
                }
                if let Some(addr) = health_addr {
                    sidecar.health_addr = addr;
                }
                sidecar.validate()?;

                Supervisor::new(sidecar, builtin_registry())
                    .run(shutdown_signal())
                    .await?;
                Ok(())
            }

            Commands::Check { config } => {
                let sidecar = load_config(&config)?;
                let registry = builtin_registry();
                let shared = SharedResources::new(sidecar.version.clone());

                for plugin in sidecar.boot_plan() {
                    registry
                        .construct(&plugin.name, &plugin.config, &shared)
                        .with_context(|| format!("plugin {} is not usable", plugin.name))?;
                    let enabled = if plugin.is_enabled() { "enabled" } else { "disabled" };
                    println!("✓ {} (boot order {}, {})", plugin.name, plugin.boot_order, enabled);
                }

                println!("Configuration {} is valid", config.display());
                Ok(())
            }

            Commands::Plugins => {
                for name in builtin_registry().names() {
                    println!("{}", name);
                }
                Ok(())
            }
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<SidecarConfig> {
    SidecarConfig::from_file(path)
        .with_context(|| format!("failed to load config from {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_defaults() {
        let cli = Cli::try_parse_from(["kidecar", "run"]).unwrap();
        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Run {
                config,
                health,
                health_addr,
            } => {
                assert_eq!(config, PathBuf::from(DEFAULT_CONFIG_PATH));
                assert!(!health);
                assert!(health_addr.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_check_with_global_log_level() {
        let cli =
            Cli::try_parse_from(["kidecar", "check", "-c", "side.json", "--log-level", "debug"])
                .unwrap();
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(cli.command, Commands::Check { config } if config == PathBuf::from("side.json")));
    }

    #[tokio::test]
    async fn test_check_rejects_unknown_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sidecar.toml");
        std::fs::write(&path, "[[plugins]]\nname = \"missing-plugin\"\n").unwrap();

        let cli = Cli::try_parse_from(["kidecar", "check", "-c", path.to_str().unwrap()]).unwrap();
        let err = cli.execute().await.unwrap_err();
        assert!(format!("{:#}", err).contains("Unit not found: missing-plugin"));
    }

    #[tokio::test]
    async fn test_check_accepts_builtin_plugins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sidecar.json");
        std::fs::write(
            &path,
            r#"{ "plugins": [{ "name": "echo" }, { "name": "heartbeat", "config": { "interval_ms": 100 } }] }"#,
        )
        .unwrap();

        let cli = Cli::try_parse_from(["kidecar", "check", "-c", path.to_str().unwrap()]).unwrap();
        assert!(cli.execute().await.is_ok());
    }
}

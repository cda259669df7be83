// Library exports for the Kidecar sidecar supervisor

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod plugins;
pub mod supervisor;
pub mod unit;

pub use coordinator::{Coordinator, CoordinatorConfig, UnitReport};
pub use error::{Result, SidecarError};
pub use supervisor::Supervisor;
pub use unit::{ErrorSink, FatalErrors, Plugin, Registry, Unit, UnitError, UnitName, UnitStatus};

// Built-in units shipped with the sidecar

pub mod echo;
pub mod heartbeat;

pub use echo::Echo;
pub use heartbeat::Heartbeat;

use crate::unit::Registry;

/// Registry holding every built-in unit
pub fn builtin_registry() -> Registry {
    let mut registry = Registry::new();
    registry.register::<Echo>().register::<Heartbeat>();
    registry
}

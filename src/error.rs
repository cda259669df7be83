use crate::unit::UnitError;
use thiserror::Error;

/// Main error type for the kidecar supervisor
#[derive(Debug, Error)]
pub enum SidecarError {
    // Registry / active-set errors
    #[error("Unit not found: {0}")]
    NotFound(String),

    #[error("Unit already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid config for unit {unit}: {reason}")]
    InvalidConfig { unit: String, reason: String },

    #[error("Failed to initialize unit {unit}: {reason}")]
    InitFailed { unit: String, reason: String },

    // Lifecycle errors
    #[error("Failed to stop unit {unit}: {reason}")]
    StopFailed { unit: String, reason: String },

    #[error("Units did not confirm stop before deadline: {}", .units.join(", "))]
    StopTimeout { units: Vec<String> },

    #[error("Status query failed for unit {unit}: {reason}")]
    StatusQueryFailed { unit: String, reason: String },

    // Carried on the shared error channel while units run
    #[error("Unit {unit} failed: {source}")]
    UnitFatal {
        unit: String,
        #[source]
        source: UnitError,
    },

    // Sidecar configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Health server error: {0}")]
    HealthServer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SidecarError {
    /// Name of the unit this error is about, if any
    pub fn unit(&self) -> Option<&str> {
        match self {
            SidecarError::NotFound(unit)
            | SidecarError::AlreadyExists(unit)
            | SidecarError::InvalidConfig { unit, .. }
            | SidecarError::InitFailed { unit, .. }
            | SidecarError::StopFailed { unit, .. }
            | SidecarError::StatusQueryFailed { unit, .. }
            | SidecarError::UnitFatal { unit, .. } => Some(unit.as_str()),
            _ => None,
        }
    }
}

/// Result type alias for kidecar operations
pub type Result<T> = std::result::Result<T, SidecarError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_timeout_lists_units() {
        let err = SidecarError::StopTimeout {
            units: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Units did not confirm stop before deadline: a, b"
        );
        assert_eq!(err.unit(), None);
    }

    #[test]
    fn test_unit_fatal_keeps_source() {
        let err = SidecarError::UnitFatal {
            unit: "echo".to_string(),
            source: UnitError::new("boom"),
        };
        assert_eq!(err.unit(), Some("echo"));
        assert_eq!(err.to_string(), "Unit echo failed: boom");
    }
}

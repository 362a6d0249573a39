use crate::error::OffloadError;

/// Environment variable carrying a process worker's ordinal.
pub const WORKER_ID_ENV: &str = "OFFLOAD_WORKER_ID";

/// Comma-separated source names the master expects a process worker to load.
pub const SOURCES_ENV: &str = "OFFLOAD_SOURCES";

/// Which side of the offload boundary the current execution context is on.
///
/// Resolved once at startup; registration and dispatch consult this value
/// instead of inspecting the environment themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Worker { id: usize },
}

impl Role {
    /// Detect the role of the current process.
    pub fn detect() -> Result<Self, OffloadError> {
        Self::from_env_value(std::env::var(WORKER_ID_ENV).ok().as_deref())
    }

    pub(crate) fn from_env_value(value: Option<&str>) -> Result<Self, OffloadError> {
        match value {
            None => Ok(Self::Master),
            Some(raw) => raw
                .trim()
                .parse()
                .map(|id| Self::Worker { id })
                .map_err(|_| {
                    OffloadError::Configuration(format!(
                        "{WORKER_ID_ENV} must be a worker index, got '{raw}'"
                    ))
                }),
        }
    }

    pub fn is_master(&self) -> bool {
        matches!(self, Self::Master)
    }

    pub fn worker_id(&self) -> Option<usize> {
        match self {
            Self::Master => None,
            Self::Worker { id } => Some(*id),
        }
    }
}

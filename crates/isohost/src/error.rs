use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Console capture and exit status of a bootstrap process, attached to creation failures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl Diagnostics {
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty() && self.exit_code.is_none()
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        write!(f, "\n\nConsole Output:\n{}", self.stdout)?;
        if self.stdout_truncated {
            f.write_str("\n[truncated]")?;
        }
        write!(f, "\n\nConsole Error:\n{}", self.stderr)?;
        if self.stderr_truncated {
            f.write_str("\n[truncated]")?;
        }
        match self.exit_code {
            Some(code) => write!(f, "\n\nExit Code: {code}"),
            None => f.write_str("\n\nExit Code: (still running)"),
        }
    }
}

/// Error reported by a host service. Serializable so it can cross the call channel.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ServiceError {
    #[error("unknown callback {0:?}")]
    UnknownCallback(String),

    #[error("unknown type {type_name:?} in module {module:?}")]
    UnknownType { module: String, type_name: String },

    #[error("unknown object reference {0}")]
    UnknownObject(u64),

    #[error("workload runtime is already initialized")]
    RuntimeAlreadyInitialized,

    #[error("workload runtime is not initialized")]
    RuntimeNotInitialized,

    #[error("workload panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Failed(String),

    #[error("host service has been disposed")]
    Disposed,

    /// Transport failure. Produced only by the supervisor side of a channel.
    #[error("channel failure: {0}")]
    Channel(String),
}

impl ServiceError {
    pub(crate) fn channel(op: &str, err: impl fmt::Display) -> Self {
        ServiceError::Channel(format!("{op}: {err}"))
    }
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("invalid host configuration: {0}")]
    Validation(String),

    #[error("{message}{diagnostics}")]
    Creation {
        message: String,
        diagnostics: Diagnostics,
        #[source]
        source: Option<BoxError>,
    },

    #[error("host did not become ready within {timeout:?}{diagnostics}")]
    StartupTimeout {
        timeout: Duration,
        diagnostics: Diagnostics,
    },

    #[error("host channel failure")]
    Channel {
        #[source]
        source: ServiceError,
    },

    #[error("host has been disposed")]
    Disposed,

    #[error("workload call failed")]
    Workload(#[source] ServiceError),
}

impl HostError {
    pub(crate) fn creation(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        HostError::Creation {
            message: message.into(),
            diagnostics: Diagnostics::default(),
            source: Some(source.into()),
        }
    }

    pub fn diagnostics(&self) -> Option<&Diagnostics> {
        match self {
            HostError::Creation { diagnostics, .. } | HostError::StartupTimeout { diagnostics, .. } => {
                Some(diagnostics)
            }
            _ => None,
        }
    }

    /// The service-level error behind a `Channel` or `Workload` failure.
    pub fn service_error(&self) -> Option<&ServiceError> {
        match self {
            HostError::Channel { source } | HostError::Workload(source) => Some(source),
            _ => None,
        }
    }
}

impl From<ServiceError> for HostError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Channel(_) | ServiceError::Disposed => HostError::Channel { source: err },
            other => HostError::Workload(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostics_render_console_sections_and_exit_code() {
        let d = Diagnostics {
            stdout: "booting".to_string(),
            stderr: "boom".to_string(),
            exit_code: Some(7),
            stdout_truncated: false,
            stderr_truncated: true,
        };
        let text = d.to_string();
        assert!(text.contains("Console Output:\nbooting"));
        assert!(text.contains("Console Error:\nboom\n[truncated]"));
        assert!(text.ends_with("Exit Code: 7"));
        assert_eq!(Diagnostics::default().to_string(), "");
    }

    #[test]
    fn channel_level_service_errors_map_to_channel_kind() {
        let err = HostError::from(ServiceError::Channel("connect: refused".to_string()));
        assert!(matches!(err, HostError::Channel { .. }));
        let err = HostError::from(ServiceError::Disposed);
        assert!(matches!(err, HostError::Channel { .. }));
        let err = HostError::from(ServiceError::UnknownCallback("nope".to_string()));
        assert!(matches!(err, HostError::Workload(ServiceError::UnknownCallback(_))));
    }

    #[test]
    fn service_error_survives_json_roundtrip() {
        let err = ServiceError::UnknownType {
            module: "m".to_string(),
            type_name: "T".to_string(),
        };
        let bytes = serde_json::to_vec(&err).unwrap();
        let back: ServiceError = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, err);
    }
}

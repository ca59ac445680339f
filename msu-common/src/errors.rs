//! Fatal preflight conditions and their process exit codes.
//!
//! | Code | Status             | Raised by                                   |
//! |------|--------------------|---------------------------------------------|
//! | 0    | Success            | completed run                               |
//! | 1    | AuthFailure        | credential exchange                         |
//! | 2    | WwanActive         | cellular uplink, not overridden by server   |
//! | 3    | AndroidWapActive   | tethered WAP, not overridden by server      |
//! | 4    | ConfigSetup        | scratch directory or record persistence     |
//! | 64   | Usage              | invalid preflight configuration or logging  |

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::converge::ConvergeError;
use crate::logging::LoggingError;
use crate::records::RecordError;
use serde::Serialize;
use thiserror::Error;

/// Process exit status of a preflight run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Success,
    AuthFailure,
    WwanActive,
    AndroidWapActive,
    ConfigSetup,
    Usage,
}

impl ExitStatus {
    /// Numeric exit code handed back to the update client.
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::AuthFailure => 1,
            Self::WwanActive => 2,
            Self::AndroidWapActive => 3,
            Self::ConfigSetup => 4,
            Self::Usage => 64,
        }
    }
}

/// A condition that ends the preflight run.
#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("cellular (WWAN) uplink is active")]
    WwanActive,

    #[error("tethered Android access point is active")]
    AndroidWapActive,

    #[error("scratch directory setup failed: {0}")]
    Converge(#[from] ConvergeError),

    #[error("configuration record error: {0}")]
    Record(#[from] RecordError),

    #[error("invalid preflight configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid logging setup: {0}")]
    Logging(#[from] LoggingError),
}

impl PreflightError {
    pub fn status(&self) -> ExitStatus {
        match self {
            Self::Auth(_) => ExitStatus::AuthFailure,
            Self::WwanActive => ExitStatus::WwanActive,
            Self::AndroidWapActive => ExitStatus::AndroidWapActive,
            Self::Converge(_) | Self::Record(_) => ExitStatus::ConfigSetup,
            Self::Config(_) | Self::Logging(_) => ExitStatus::Usage,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.status().code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_exit_codes_match_update_client_contract() {
        assert_eq!(ExitStatus::Success.code(), 0);
        assert_eq!(ExitStatus::AuthFailure.code(), 1);
        assert_eq!(ExitStatus::WwanActive.code(), 2);
        assert_eq!(ExitStatus::AndroidWapActive.code(), 3);
        assert_eq!(ExitStatus::ConfigSetup.code(), 4);
    }

    #[test]
    fn test_error_maps_to_status() {
        let err = PreflightError::Auth(AuthError::EmptyToken);
        assert_eq!(err.exit_code(), 1);

        assert_eq!(PreflightError::WwanActive.exit_code(), 2);
        assert_eq!(PreflightError::AndroidWapActive.exit_code(), 3);

        let err = PreflightError::Converge(ConvergeError::Exhausted {
            path: PathBuf::from("/tmp/ca"),
            attempts: 4,
            last_error: "already exists".to_string(),
        });
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_logging_setup_error_is_usage() {
        let err = PreflightError::from(LoggingError::AlreadyInitialized);
        assert_eq!(err.status(), ExitStatus::Usage);
        assert_eq!(err.exit_code(), 64);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&ExitStatus::AndroidWapActive).unwrap();
        assert_eq!(json, "\"android_wap_active\"");
        assert_eq!(PreflightError::WwanActive.status(), ExitStatus::WwanActive);
    }

    #[test]
    fn test_display_includes_source() {
        let err = PreflightError::Auth(AuthError::ExchangeFailed {
            exit_code: Some(1),
            stderr: "bad credentials".to_string(),
        });
        let msg = err.to_string();
        assert!(msg.contains("authentication failed"));
        assert!(msg.contains("bad credentials"));
    }
}

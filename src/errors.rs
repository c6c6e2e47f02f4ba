use std::fmt;
use std::process::ExitCode;

use thiserror::Error;

/// External system a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Database,
    Filesystem,
    DiskSnapshot,
    GroupSnapshot,
    Metadata,
    SecretManager,
    Monitoring,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Service::Database => "database",
            Service::Filesystem => "filesystem",
            Service::DiskSnapshot => "disk snapshot",
            Service::GroupSnapshot => "group snapshot",
            Service::Metadata => "instance metadata",
            Service::SecretManager => "secret manager",
            Service::Monitoring => "monitoring",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("{service} error: {message}")]
    ExternalService {
        service: Service,
        message: String,
        retryable: bool,
    },

    #[error("Cleanup failed: {0}")]
    Cleanup(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl BackupError {
    pub fn external(service: Service, message: impl Into<String>) -> Self {
        BackupError::ExternalService {
            service,
            message: message.into(),
            retryable: false,
        }
    }

    /// Transient failure that the per-call retry budget may absorb.
    pub fn transient(service: Service, message: impl Into<String>) -> Self {
        BackupError::ExternalService {
            service,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, BackupError::ExternalService { retryable: true, .. })
    }

    pub fn is_usage(&self) -> bool {
        matches!(self, BackupError::Usage(_))
    }

    pub fn is_precondition(&self) -> bool {
        matches!(self, BackupError::Precondition(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BackupError::Cancelled(_))
    }

    /// Process exit status: usage and precondition failures are told apart
    /// from execution failures.
    pub fn exit_code(&self) -> ExitCode {
        if self.is_usage() {
            ExitCode::from(2)
        } else if self.is_precondition() {
            ExitCode::from(3)
        } else {
            ExitCode::FAILURE
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

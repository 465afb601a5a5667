//! Crate-level errors and their operator-facing classification

use crate::certs::CertificateError;
use crate::compose::ComposeError;
use crate::config::ConfigError;
use crate::labs::LabError;
use crate::ports::PortExhausted;
use crate::reload::ReloadError;
use crate::route::MetadataError;
use crate::store::StoreError;
use thiserror::Error;

/// Broad error classes reported to operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad configuration, unknown lab or unknown certificate provider
    Configuration,
    /// Not enough free ports in the configured range
    PortExhaustion,
    /// A route could not be decoded or built
    InvalidRoute,
    /// Compose or the proxy reload command failed
    ExternalProcess,
    /// Reading or writing local files failed
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "CONFIGURATION_ERROR",
            ErrorKind::PortExhaustion => "PORT_EXHAUSTION_ERROR",
            ErrorKind::InvalidRoute => "INVALID_ROUTE",
            ErrorKind::ExternalProcess => "EXTERNAL_PROCESS_ERROR",
            ErrorKind::Io => "IO_ERROR",
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lab(#[from] LabError),

    #[error(transparent)]
    Ports(#[from] PortExhausted),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Compose(#[from] ComposeError),

    #[error(transparent)]
    Reload(#[from] ReloadError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) | Error::Lab(_) => ErrorKind::Configuration,
            Error::Ports(_) => ErrorKind::PortExhaustion,
            Error::Metadata(_) => ErrorKind::InvalidRoute,
            Error::Certificate(e) => certificate_kind(e),
            Error::Store(e) => match e {
                StoreError::Read { .. } | StoreError::Write { .. } => ErrorKind::Io,
                StoreError::InvalidRoute(_)
                | StoreError::NameTaken { .. }
                | StoreError::PortConflict { .. } => ErrorKind::InvalidRoute,
                StoreError::Certificate(e) => certificate_kind(e),
            },
            Error::Compose(e) => match e {
                ComposeError::InvalidCommand { .. } | ComposeError::TemplateMissing(_) => {
                    ErrorKind::Configuration
                }
                ComposeError::Write { .. } => ErrorKind::Io,
                ComposeError::Spawn { .. } | ComposeError::Failed { .. } => {
                    ErrorKind::ExternalProcess
                }
            },
            Error::Reload(e) => match e {
                ReloadError::InvalidCommand { .. } => ErrorKind::Configuration,
                _ => ErrorKind::ExternalProcess,
            },
        }
    }
}

fn certificate_kind(error: &CertificateError) -> ErrorKind {
    match error {
        CertificateError::UnknownProvider(_) | CertificateError::InvalidLabId(_) => {
            ErrorKind::Configuration
        }
        CertificateError::Write { .. } => ErrorKind::Io,
        _ => ErrorKind::ExternalProcess,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err: Error = PortExhausted {
            requested: 3,
            found: 1,
            start: 8000,
            end: 8001,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::PortExhaustion);

        let err: Error = LabError::NotFound("xss".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let err: Error = ReloadError::Failed {
            command: "nginx -s reload".to_string(),
            code: Some(1),
            stderr: String::new(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::ExternalProcess);

        let err: Error = StoreError::PortConflict {
            port: 8000,
            existing: "alice.xss101.example.com".to_string(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::InvalidRoute);

        let err: Error = StoreError::NameTaken {
            name: "alice.api.xss101.example.com".to_string(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::InvalidRoute);
    }

    #[test]
    fn test_kind_strings() {
        assert_eq!(ErrorKind::PortExhaustion.as_str(), "PORT_EXHAUSTION_ERROR");
        assert_eq!(ErrorKind::ExternalProcess.as_str(), "EXTERNAL_PROCESS_ERROR");
    }
}

//! Error types for the OVF datasource

use crate::imc::status::StatusCode;
use thiserror::Error;

/// Main error type for datasource operations
#[derive(Error, Debug)]
pub enum DatasourceError {
    #[error("Malformed OVF environment: {0}")]
    MalformedDocument(String),

    #[error("File not found: {0}")]
    MissingFile(String),

    #[error("Parse failure: {0}")]
    ParseFailure(String),

    #[error("Custom script is disabled by VM Administrator")]
    ScriptDisabled,

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Seed from {0} is not supported")]
    UnsupportedSeedScheme(String),

    #[error("{step}: {source}")]
    Customization {
        step: String,
        code: StatusCode,
        #[source]
        source: Box<DatasourceError>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Command execution failed: {0}")]
    Command(String),
}

impl DatasourceError {
    /// Create a customization step failure
    pub fn customization(
        step: impl Into<String>,
        code: StatusCode,
        source: DatasourceError,
    ) -> Self {
        Self::Customization {
            step: step.into(),
            code,
            source: Box::new(source),
        }
    }

    /// Whether this error aborts the whole acquisition run.
    ///
    /// Anything else only means the transport that produced it had nothing
    /// to offer, and the resolver moves on to the next one.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Customization { .. } | Self::UnsupportedSeedScheme(_)
        )
    }

    /// Status code carried by a customization failure, if any
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Self::Customization { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imc::status::GuestCustEvent;

    #[test]
    fn test_fatal_classification() {
        assert!(!DatasourceError::MalformedDocument("x".into()).is_fatal());
        assert!(!DatasourceError::TransportUnavailable("rpctool".into()).is_fatal());
        assert!(DatasourceError::UnsupportedSeedScheme("ftp://x".into()).is_fatal());

        let err = DatasourceError::customization(
            "Error creating marker files",
            StatusCode::Event(GuestCustEvent::CustomizeFailed),
            DatasourceError::MissingFile("/tmp/x".into()),
        );
        assert!(err.is_fatal());
        assert_eq!(
            err.status_code(),
            Some(StatusCode::Event(GuestCustEvent::CustomizeFailed))
        );
        assert_eq!(err.to_string(), "Error creating marker files: File not found: /tmp/x");
    }
}

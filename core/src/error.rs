//! Error taxonomy for the request engine.
//!
//! # Design
//! Errors are split by the pipeline stage that produces them so callers can
//! tell "never left the process" apart from "the service said no":
//!
//! - `InvalidConfiguration` and `Encoding` are raised before any network
//!   activity and are never retried.
//! - `Transport` covers the HTTP exchange itself. The engine performs no
//!   automatic retry; imports and deletes are not idempotent.
//! - `Domain` is the service reporting an error in-band. The classifier
//!   returns it as data; the facade converts it into this error only at the
//!   outermost boundary.
//!
//! Every variant produced by the facade carries the operation it belongs to
//! (e.g. `record/export`) so it can be logged verbatim.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::ReturnFormat;

/// An option value outside its legal domain, or an illegal combination of
/// options. Raised before anything is encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidConfiguration {
    pub option: String,
    pub value: String,
    pub legal: Vec<String>,
    /// The operation the value was rejected for, when the rejection depends
    /// on it (e.g. a format that is legal elsewhere).
    pub scope: Option<String>,
}

impl fmt::Display for InvalidConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid value '{}' for '{}'", self.value, self.option)?;
        if let Some(scope) = &self.scope {
            write!(f, " for {scope}")?;
        }
        write!(f, "; legal values: {}", self.legal.join(", "))
    }
}

impl std::error::Error for InvalidConfiguration {}

impl InvalidConfiguration {
    pub fn new<I>(option: impl Into<String>, value: impl Into<String>, legal: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            option: option.into(),
            value: value.into(),
            legal: legal.into_iter().map(Into::into).collect(),
            scope: None,
        }
    }

    pub fn in_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }
}

/// The request could not be turned into bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("required field '{0}' is missing")]
    MissingField(&'static str),

    #[error("payload cannot be serialized as {format}: {reason}")]
    Unserializable { format: ReturnFormat, reason: String },

    #[error("operation requires a {0} payload")]
    MissingPayload(&'static str),

    #[error("operation does not accept a {0} payload")]
    UnexpectedPayload(&'static str),
}

/// Failure of the HTTP exchange. No partial data survives any of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled by caller")]
    Cancelled,

    /// A status the service never uses for in-band errors (redirects, or a
    /// failure status with an empty body).
    #[error("unexpected HTTP status {0}")]
    UnexpectedStatus(u16),
}

/// The service answered, but with an error document instead of a result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    /// The error envelope was recognized; the message is extracted.
    #[error("service error: {0}")]
    RecognizedServiceError(String),

    /// The body did not match any known error envelope. The bytes are kept
    /// exactly as received.
    #[error("unrecognized error response: {}", String::from_utf8_lossy(.0))]
    UnrecognizedError(Vec<u8>),
}

/// Failure of the durable-storage collaborator.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{} already exists", .0.display())]
    AlreadyExists(PathBuf),

    #[error("i/o failure on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level error returned by `RedcapClient`.
#[derive(Debug, Error)]
pub enum RedcapError {
    #[error(transparent)]
    InvalidConfiguration(#[from] InvalidConfiguration),

    #[error("{operation}: encoding failed: {source}")]
    Encoding {
        operation: String,
        #[source]
        source: EncodingError,
    },

    #[error("{operation}: transport failed: {source}")]
    Transport {
        operation: String,
        #[source]
        source: TransportError,
    },

    #[error("{operation}: HTTP {status}: {source}")]
    Domain {
        operation: String,
        status: u16,
        #[source]
        source: DomainError,
    },

    #[error("{operation}: storing the download failed: {source}")]
    Storage {
        operation: String,
        #[source]
        source: StorageError,
    },
}

impl RedcapError {
    /// The transport failure, if this error came from the exchange itself.
    pub fn transport(&self) -> Option<&TransportError> {
        match self {
            RedcapError::Transport { source, .. } => Some(source),
            _ => None,
        }
    }

    /// The in-band service error, if the service answered with one.
    pub fn domain(&self) -> Option<&DomainError> {
        match self {
            RedcapError::Domain { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_configuration_names_option_scope_and_legal_values() {
        let err = InvalidConfiguration::new("format", "odm", ["json", "csv", "xml"])
            .in_scope("record/export");
        assert_eq!(
            err.to_string(),
            "invalid value 'odm' for 'format' for record/export; legal values: json, csv, xml"
        );
    }

    #[test]
    fn redcap_error_carries_operation_context() {
        let err = RedcapError::Transport {
            operation: "file/import".to_string(),
            source: TransportError::Timeout(Duration::from_millis(250)),
        };
        assert_eq!(err.to_string(), "file/import: transport failed: timed out after 250ms");
        assert_eq!(err.transport(), Some(&TransportError::Timeout(Duration::from_millis(250))));
        assert!(err.domain().is_none());
    }

    #[test]
    fn domain_error_display_includes_status() {
        let err = RedcapError::Domain {
            operation: "arm/delete".to_string(),
            status: 400,
            source: DomainError::RecognizedServiceError("arms missing".to_string()),
        };
        assert_eq!(err.to_string(), "arm/delete: HTTP 400: service error: arms missing");
    }
}

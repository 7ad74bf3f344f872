#![forbid(unsafe_code)]

//! Error taxonomy and the crate-wide result alias.
//!
//! Every public operation returns [`Result`]. The error type is `Clone` so a
//! single failed metadata fetch can be handed to every task that was waiting
//! on it.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result type for odata-query operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while turning a command into request parameters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompilationError {
    /// Custom query option expressions only accept `and` / `eq` trees.
    #[error("invalid custom query option: operator '{operator}' is not allowed")]
    InvalidQueryOptionOperator {
        /// Keyword of the rejected operator.
        operator: &'static str,
    },
    /// Construct not expressible in the target protocol version.
    #[error("{feature} is not supported by OData {version}")]
    Unsupported {
        /// Name of the unsupported construct.
        feature: &'static str,
        /// Protocol version the adapter targets.
        version: String,
    },
    /// Command does not name a collection, function or action.
    #[error("command has no target collection")]
    MissingCollection,
    /// Command inputs are inconsistent.
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

/// Errors raised while resolving names against the metadata fact base.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    /// Entity collection is absent from the metadata.
    #[error("unknown entity collection '{name}'")]
    UnknownEntity {
        /// Requested collection name.
        name: String,
    },
    /// Navigation property is absent or its partner cannot be resolved.
    #[error("unknown navigation property '{property}' on '{entity}'")]
    UnknownNavigation {
        /// Collection the lookup started from.
        entity: String,
        /// Requested navigation property.
        property: String,
    },
    /// Filter fragment references several collection-valued navigations.
    #[error("filter targets more than one entity: {}", entities.join(", "))]
    AmbiguousFilterTarget {
        /// Entity paths the fragment resolved to.
        entities: Vec<String>,
    },
}

/// Errors raised while detecting the protocol version or reading metadata.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// None of the advertised versions has an adapter.
    #[error("OData protocols {} are not supported", seen.join(","))]
    UnsupportedVersion {
        /// Every version token that was observed.
        seen: Vec<String>,
    },
    /// Neither headers nor the document declared a version.
    #[error("unable to identify OData protocol version")]
    UndetectableVersion,
    /// Metadata document could not be interpreted.
    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),
}

/// Top-level error type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Query compilation failure.
    #[error(transparent)]
    Compilation(#[from] CompilationError),
    /// Metadata name resolution failure.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    /// Protocol detection or metadata failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// Request exceeded the configured timeout.
    #[error("request timed out after {after:?}")]
    Timeout {
        /// Timeout that elapsed.
        after: Duration,
    },
    /// Caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,
    /// Transport reported a failure.
    #[error("transport: {0}")]
    Transport(String),
    /// Settings are invalid or could not be loaded.
    #[error("configuration: {0}")]
    Config(String),
    /// Invalid argument.
    #[error("invalid argument: {0}")]
    Invalid(String),
}

impl Error {
    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Compilation(CompilationError::InvalidQueryOptionOperator { .. }) => {
                "InvalidQueryOption"
            }
            Error::Compilation(CompilationError::Unsupported { .. }) => "Unsupported",
            Error::Compilation(CompilationError::MissingCollection) => "MissingCollection",
            Error::Compilation(CompilationError::InvalidCommand(_)) => "InvalidCommand",
            Error::Resolution(ResolutionError::UnknownEntity { .. }) => "UnknownEntity",
            Error::Resolution(ResolutionError::UnknownNavigation { .. }) => "UnknownNavigation",
            Error::Resolution(ResolutionError::AmbiguousFilterTarget { .. }) => "AmbiguousTarget",
            Error::Protocol(ProtocolError::UnsupportedVersion { .. }) => "UnsupportedVersion",
            Error::Protocol(ProtocolError::UndetectableVersion) => "UndetectableVersion",
            Error::Protocol(ProtocolError::MalformedMetadata(_)) => "MalformedMetadata",
            Error::Timeout { .. } => "Timeout",
            Error::Cancelled => "Cancelled",
            Error::Transport(_) => "Transport",
            Error::Config(_) => "Config",
            Error::Invalid(_) => "Invalid",
        }
    }

    /// True for [`Error::Timeout`]; cancellation is reported separately.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Shorthand for [`ResolutionError::UnknownEntity`].
    pub fn unknown_entity(name: impl Into<String>) -> Self {
        ResolutionError::UnknownEntity { name: name.into() }.into()
    }

    /// Shorthand for [`ResolutionError::UnknownNavigation`].
    pub fn unknown_navigation(entity: impl Into<String>, property: impl Into<String>) -> Self {
        ResolutionError::UnknownNavigation {
            entity: entity.into(),
            property: property.into(),
        }
        .into()
    }

    /// Shorthand for [`CompilationError::Unsupported`].
    pub fn unsupported(feature: &'static str, version: impl fmt::Display) -> Self {
        CompilationError::Unsupported {
            feature,
            version: version.to_string(),
        }
        .into()
    }
}

/// Formats an error together with its code, e.g. `[Timeout] request timed out`.
pub struct ErrorWithCode<'a>(pub &'a Error);

impl fmt::Display for ErrorWithCode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.0.code(), self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_version_lists_every_token() {
        let err: Error = ProtocolError::UnsupportedVersion {
            seen: vec!["5.0".into(), "6.0".into()],
        }
        .into();
        assert_eq!(err.to_string(), "OData protocols 5.0,6.0 are not supported");
        assert_eq!(err.code(), "UnsupportedVersion");
    }

    #[test]
    fn timeout_and_cancel_are_distinct() {
        let timeout = Error::Timeout {
            after: Duration::from_millis(5),
        };
        assert!(timeout.is_timeout());
        assert!(!Error::Cancelled.is_timeout());
        assert_ne!(timeout.code(), Error::Cancelled.code());
    }

    #[test]
    fn code_prefix_formatting() {
        let err = Error::unknown_entity("Widgets");
        assert_eq!(
            ErrorWithCode(&err).to_string(),
            "[UnknownEntity] unknown entity collection 'Widgets'"
        );
    }
}

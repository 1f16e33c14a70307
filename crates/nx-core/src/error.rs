//! Unified error type for netsix.
//!
//! All crates funnel their failures into [`Error`], which carries enough
//! context for the orchestrator to surface a single user-visible event with a
//! [`Severity`] via [`Error::severity`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// User-visible category of a surfaced condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// Unified error type covering all failure modes in netsix.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "file", "request").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// Request data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// An external tool could not be located or spawned.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        /// Name of the tool that failed.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// Media probing failed (tool exit or unparsable output).
    #[error("Probe error: {0}")]
    Probe(String),

    /// The playback environment could not answer a codec query.
    #[error("Capability query error: {0}")]
    CapabilityQuery(String),

    /// The remux/fragmentation tool failed.
    #[error("Fragmentation error: {0}")]
    Fragmentation(String),

    /// The encoder exited with a failure status.
    #[error("Transcode error [{stage}]: {message}")]
    Transcode {
        /// The encode stage that failed ("normalization" or "transcode").
        stage: String,
        /// Human-readable error description.
        message: String,
    },

    /// The operation was cancelled by the user or superseded by a new request.
    #[error("Cancelled")]
    Cancelled,

    /// Reading the file or sending to the consumer failed mid-stream.
    #[error("Stream IO error: {0}")]
    StreamIo(String),

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map this error to the category shown to the user.
    pub fn severity(&self) -> Severity {
        match self {
            Error::Cancelled => Severity::Info,
            Error::NotFound { .. } | Error::Validation(_) => Severity::Warning,
            _ => Severity::Error,
        }
    }

    /// Whether this error represents cancellation rather than failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::Transcode`].
    pub fn transcode(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Transcode {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display() {
        let err = Error::not_found("file", "/media/movie.mkv");
        assert_eq!(err.to_string(), "file not found: /media/movie.mkv");
        assert_eq!(err.severity(), Severity::Warning);
    }

    #[test]
    fn validation_display() {
        let err = Error::Validation("no file ready".into());
        assert_eq!(err.to_string(), "Validation error: no file ready");
    }

    #[test]
    fn io_from_std() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io { .. }));
        assert_eq!(err.severity(), Severity::Error);
    }

    #[test]
    fn tool_display() {
        let err = Error::tool("ffmpeg", "exit code 1");
        assert_eq!(err.to_string(), "Tool error [ffmpeg]: exit code 1");
    }

    #[test]
    fn probe_display() {
        let err = Error::Probe("unexpected end of JSON".into());
        assert_eq!(err.to_string(), "Probe error: unexpected end of JSON");
        assert_eq!(err.severity(), Severity::Error);
    }

    #[test]
    fn transcode_display() {
        let err = Error::transcode("transcode", "ffmpeg exited with status 1");
        assert_eq!(
            err.to_string(),
            "Transcode error [transcode]: ffmpeg exited with status 1"
        );
    }

    #[test]
    fn cancelled_is_info() {
        let err = Error::Cancelled;
        assert!(err.is_cancelled());
        assert_eq!(err.severity(), Severity::Info);
        assert!(!Error::StreamIo("broken pipe".into()).is_cancelled());
    }

    #[test]
    fn severity_serializes_lowercase() {
        let json = serde_json::to_string(&Severity::Warning).unwrap();
        assert_eq!(json, "\"warning\"");
        assert_eq!(Severity::Error.to_string(), "error");
    }

    #[test]
    fn result_alias() {
        fn ok_fn() -> Result<i32> {
            Ok(42)
        }
        assert_eq!(ok_fn().unwrap(), 42);

        fn err_fn() -> Result<i32> {
            Err(Error::Internal("boom".into()))
        }
        assert!(err_fn().is_err());
    }
}

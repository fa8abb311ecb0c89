//! Error Types
//!
//! This module defines the error taxonomy used by the loading pipeline.
//!
//! # Overview
//!
//! The main error type [`Error`] covers every way a load can end without a
//! model:
//! - Stream resolution and I/O failures
//! - Malformed low-level structure (XML / glTF JSON / GLB chunks)
//! - Structurally valid documents that lack a required section
//! - Joint graph integrity violations
//! - Cooperative cancellation
//!
//! Errors raised on the worker are carried back to the originating context
//! unchanged and reported through [`crate::assets::LoadListener::on_fail`]
//! as an [`ErrorKind`] plus the rendered message.
//!
//! ```rust,ignore
//! use armature::errors::{Error, Result};
//!
//! fn require_root(found: bool) -> Result<()> {
//!     if found { Ok(()) } else { Err(Error::malformed("COLLADA")) }
//! }
//! ```

use thiserror::Error;

/// The main error type of the asset pipeline.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Stream Errors
    // ========================================================================
    /// The identifier could not be turned into bytes, or reading them failed.
    ///
    /// This is the only retryable kind: re-issue the load to try again.
    #[error("Stream error for `{uri}`: {source}")]
    Stream {
        /// The identifier that was being resolved
        uri: String,
        /// Underlying I/O failure
        #[source]
        source: std::io::Error,
    },

    // ========================================================================
    // Format Errors
    // ========================================================================
    /// Malformed low-level structure. Positions are 1-based.
    #[error("Parse error at line {line}, column {column}: {message}")]
    Parse {
        line: u64,
        column: u64,
        message: String,
    },

    /// The document parsed, but a section the model needs is missing or broken.
    #[error("Malformed asset: missing or invalid section `{section}`")]
    MalformedAsset {
        /// Name of the offending section
        section: String,
    },

    // ========================================================================
    // Joint Graph Errors
    // ========================================================================
    /// A joint name could not be attached to the hierarchy.
    #[error("Unresolved joint `{joint}`: {reason}")]
    UnresolvedJoint { joint: String, reason: String },

    /// An animation clip references a joint the skeleton does not declare.
    #[error("Animation clip `{clip}` references unknown joint `{joint}`")]
    UnknownJointReference { clip: String, joint: String },

    // ========================================================================
    // Task Errors
    // ========================================================================
    /// The load was cancelled. Not a failure: a terminal state of its own.
    #[error("Load cancelled")]
    Cancelled,
}

/// Fieldless mirror of [`Error`], handed to failure callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Stream,
    Parse,
    MalformedAsset,
    UnresolvedJoint,
    UnknownJointReference,
    Cancelled,
}

impl Error {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Stream { .. } => ErrorKind::Stream,
            Error::Parse { .. } => ErrorKind::Parse,
            Error::MalformedAsset { .. } => ErrorKind::MalformedAsset,
            Error::UnresolvedJoint { .. } => ErrorKind::UnresolvedJoint,
            Error::UnknownJointReference { .. } => ErrorKind::UnknownJointReference,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Only stream failures may succeed when the same load is issued again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Stream { .. })
    }

    pub fn stream(uri: impl Into<String>, source: std::io::Error) -> Self {
        Error::Stream {
            uri: uri.into(),
            source,
        }
    }

    pub fn malformed(section: impl Into<String>) -> Self {
        Error::MalformedAsset {
            section: section.into(),
        }
    }

    pub fn unresolved_joint(joint: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::UnresolvedJoint {
            joint: joint.into(),
            reason: reason.into(),
        }
    }

    /// Parse error without a meaningful source position.
    pub fn parse_at_start(message: impl Into<String>) -> Self {
        Error::Parse {
            line: 1,
            column: 1,
            message: message.into(),
        }
    }
}

// ============================================================================
// Convenient conversion implementations
// ============================================================================

impl From<xml::reader::Error> for Error {
    fn from(err: xml::reader::Error) -> Self {
        use xml::common::Position;

        let pos = err.position();
        Error::Parse {
            line: pos.row + 1,
            column: pos.column + 1,
            message: err.to_string(),
        }
    }
}

impl From<gltf::Error> for Error {
    fn from(err: gltf::Error) -> Self {
        match err {
            gltf::Error::Deserialize(json) => Error::Parse {
                line: json.line() as u64,
                column: json.column() as u64,
                message: json.to_string(),
            },
            other => Error::parse_at_start(other.to_string()),
        }
    }
}

/// Alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_stream_errors_are_retryable() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(Error::stream("file://a.dae", io).is_retryable());
        assert!(!Error::malformed("library_geometries").is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn kind_mirrors_variant() {
        let err = Error::unresolved_joint("pelvis", "not declared by the skeleton");
        assert_eq!(err.kind(), ErrorKind::UnresolvedJoint);
        assert!(err.to_string().contains("pelvis"));
    }
}

//! Changelog parse errors.

use serde::Serialize;
use thiserror::Error;

use super::ChangeSetId;

/// Problem found while reading a changelog.
///
/// In strict mode the first problem aborts parsing. In collecting mode every
/// problem is returned and validation reports them all.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParseError {
    /// The root changelog could not be read.
    #[error("cannot read changelog {path}: {message}")]
    Unreadable {
        /// Logical path.
        path: String,
        /// Underlying I/O message.
        message: String,
    },

    /// An include points at a file that cannot be read.
    #[error("unresolvable include {path} (from {included_from}): {message}")]
    UnresolvedInclude {
        /// Target path.
        path: String,
        /// Including file.
        included_from: String,
        /// Underlying I/O message.
        message: String,
    },

    /// Includes form a cycle.
    #[error("circular include: {}", chain.join(" -> "))]
    CircularInclude {
        /// Files on the cycle, starting and ending with the same path.
        chain: Vec<String>,
    },

    /// Two change sets share an identity.
    #[error("duplicate change set {id}")]
    DuplicateChangeSet {
        /// The repeated identity.
        id: ChangeSetId,
    },

    /// The document is malformed.
    #[error("{path}{}: {message}", line.map(|l| format!(":{}", l)).unwrap_or_default())]
    Syntax {
        /// File the problem is in.
        path: String,
        /// One-based line, when known.
        line: Option<usize>,
        /// What is wrong.
        message: String,
    },

    /// The file extension maps to no known format.
    #[error("unsupported changelog format: {path}")]
    UnsupportedFormat {
        /// Offending path.
        path: String,
    },
}

impl ParseError {
    /// Create a syntax error.
    pub fn syntax(path: impl Into<String>, line: Option<usize>, message: impl Into<String>) -> Self {
        ParseError::Syntax {
            path: path.into(),
            line,
            message: message.into(),
        }
    }
}

//! Custom error types for the token-passing decoder.
//!
//! This module provides a centralized error handling system using the `thiserror` crate
//! to define structured, typed errors with clear messages and proper error conversion.

use std::io;
use thiserror::Error;

/// Primary error type for the decoder, covering all recoverable failure cases.
///
/// Beam and histogram pruning discard hypotheses as ordinary control flow and
/// never surface here.
#[derive(Debug, Error)]
pub enum DecoderError {
    /// Errors from invalid configuration values or combinations.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A configured boundary word is missing from the vocabulary.
    #[error("Unknown {role} word: {word:?}")]
    UnknownWord {
        /// Which configuration slot named the word.
        role: &'static str,
        /// The word as configured.
        word: String,
    },

    /// Lattice or word-history output was requested while lattice generation is off.
    #[error("Word graph was not generated; enable generate_lattice before decoding")]
    LatticeNotGenerated,

    /// The search was wired up with inconsistent collaborators.
    #[error("Invalid search setup: {0}")]
    InvalidSetup(String),

    /// A result was requested but no token is active.
    #[error("No active tokens in the search")]
    EmptySearch,

    /// A lattice document could not be parsed.
    #[error("Lattice parse error at line {line}: {message}")]
    LatticeParse {
        /// 1-based line number of the offending line.
        line: usize,
        /// What was wrong with it.
        message: String,
    },

    /// Errors from the underlying IO system.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration serialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Convenience type alias for Results with DecoderError.
pub type Result<T> = std::result::Result<T, DecoderError>;

/// Extension trait for adding context to IO errors.
pub trait ErrorContext<T> {
    /// Add context to the error.
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;

    /// Add static context to the error.
    fn with_static_context(self, context: &'static str) -> Result<T>;
}

impl<T> ErrorContext<T> for std::result::Result<T, io::Error> {
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| DecoderError::Io(io::Error::new(e.kind(), format!("{}: {}", f(), e))))
    }

    fn with_static_context(self, context: &'static str) -> Result<T> {
        self.map_err(|e| DecoderError::Io(io::Error::new(e.kind(), format!("{}: {}", context, e))))
    }
}

//! Error types for building the repeat core.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors that prevent the repeat core from starting.
///
/// Missing or malformed teach records are not in this list: they are logged
/// and leave the corresponding sequence empty.
#[derive(Debug, Error)]
pub enum RepeatError {
    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No registration backend was provided.
    #[error("no cloud matcher configured")]
    MissingMatcher,
}

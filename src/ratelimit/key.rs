//! Deriving rate limit keys from request sources.

use std::sync::Arc;

use thiserror::Error;

/// The identifier could not be derived from a request source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct KeyError(pub String);

impl KeyError {
    /// Create an error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        KeyError(message.into())
    }
}

/// Maps a request source to the key its budget is counted under.
///
/// Implemented for any `Fn(&R) -> Result<String, KeyError>`, so closures can
/// be passed directly.
pub trait KeyGenerator<R: ?Sized>: Send + Sync {
    /// Derive the key for `source`.
    fn key(&self, source: &R) -> Result<String, KeyError>;
}

impl<R: ?Sized, F> KeyGenerator<R> for F
where
    F: Fn(&R) -> Result<String, KeyError> + Send + Sync,
{
    fn key(&self, source: &R) -> Result<String, KeyError> {
        self(source)
    }
}

/// Uses the source string itself as the key. Empty strings are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityKey;

impl KeyGenerator<str> for IdentityKey {
    fn key(&self, source: &str) -> Result<String, KeyError> {
        if source.is_empty() {
            return Err(KeyError::new("identifier is empty"));
        }
        Ok(source.to_owned())
    }
}

/// Predicate deciding that a source bypasses rate limiting entirely.
pub type SkipPredicate<R> = Arc<dyn Fn(&R) -> bool + Send + Sync>;

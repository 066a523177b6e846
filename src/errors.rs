//! Crate-wide error taxonomy (spec §7).
//!
//! Components return `thiserror`-derived enums so callers can match on
//! `ErrorKind`; pipeline/handler glue wraps these in `anyhow::Error` for
//! context propagation, keeping `anyhow` at the edges and typed errors at
//! the seams.

use thiserror::Error;

/// The five-way taxonomy from spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ErrorKind {
    InputInvalid,
    ExternalTransient,
    ExternalPermanent,
    Logic,
    Capacity,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InputInvalid(String),

    #[error("external service transient failure: {0}")]
    ExternalTransient(String),

    #[error("external service permanent failure: {0}")]
    ExternalPermanent(String),

    #[error("internal logic error: {0}")]
    Logic(String),

    #[error("capacity exceeded: {0}")]
    Capacity(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::InputInvalid(_) => ErrorKind::InputInvalid,
            CoreError::ExternalTransient(_) => ErrorKind::ExternalTransient,
            CoreError::ExternalPermanent(_) => ErrorKind::ExternalPermanent,
            CoreError::Logic(_) => ErrorKind::Logic,
            CoreError::Capacity(_) => ErrorKind::Capacity,
        }
    }

    /// Whether a caller should retry this error with backoff (§7b).
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::ExternalTransient(_))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("graph store error: {0}")]
    Graph(String),
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("malformed structured output: {0}")]
    MalformedOutput(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_retryable() {
        let e = CoreError::ExternalTransient("timeout".into());
        assert!(e.is_retryable());
        assert_eq!(e.kind(), ErrorKind::ExternalTransient);
    }

    #[test]
    fn permanent_is_not_retryable() {
        let e = CoreError::ExternalPermanent("401".into());
        assert!(!e.is_retryable());
    }
}

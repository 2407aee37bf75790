use thiserror::Error;

/// Errors surfaced by the sampling core.
#[derive(Debug, Error)]
pub enum GenerateError {
    /// A sampling parameter is outside of its valid domain. Raised before any oracle call.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The score oracle failed or produced a malformed score vector.
    #[error(transparent)]
    Oracle(#[from] OracleError),

    /// Every candidate was suppressed; nothing is left to sample from.
    #[error("degenerate distribution: no candidate token left after filtering")]
    DegenerateDistribution,

    /// Text could not be converted to or from token ids.
    #[error("tokenizer failed: {0}")]
    Tokenizer(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("score oracle failed: {0}")]
    Failed(#[source] anyhow::Error),

    #[error("score vector has {found} entries, expected {expected}")]
    VocabMismatch { expected: usize, found: usize },

    #[error("score vector contains NaN or no finite value")]
    NonFinite,
}

pub type Result<T, E = GenerateError> = std::result::Result<T, E>;

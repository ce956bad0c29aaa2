//! Stage error taxonomy.
//!
//! A missing credential is deliberately absent from this module: being logged
//! out is a normal state, represented by `Option::None`.

use thiserror::Error;

/// History provider failures. Either way the cycle has no recents to work with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Request could not be sent, or the body could not be read or parsed.
    #[error("history transport error: {0}")]
    Transport(String),

    /// Provider answered with a non-success status.
    #[error("history provider returned status {0}")]
    ProviderStatus(u16),
}

/// Failures of either generative model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    /// Text model output held no bracketed list of exactly six strings.
    #[error("malformed model output: {0}")]
    MalformedOutput(String),

    /// Request failed or the service answered with a non-success status.
    #[error("generation transport error: {0}")]
    Transport(String),

    /// Response body was not what the contract promises (JSON shape, image bytes).
    #[error("generation decode error: {0}")]
    Decode(String),
}

impl FetchError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::ProviderStatus(status.as_u16()),
            None => Self::Transport(err.to_string()),
        }
    }
}

impl GenerationError {
    /// Short machine-readable kind, used in slot failure reasons.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedOutput(_) => "malformed-output",
            Self::Transport(_) => "transport",
            Self::Decode(_) => "decode",
        }
    }
}

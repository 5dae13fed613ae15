use thiserror::Error;

/// Reasons a task or broadcast payload is rejected.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("challenge is empty")]
    EmptyChallenge,
    #[error("invalid nonce range [{from}, {to}]")]
    InvalidRange { from: u64, to: u64 },
    #[error("unexpected event `{0}`")]
    UnexpectedEvent(String),
}

pub type DecodeResult<T> = Result<T, DecodeError>;

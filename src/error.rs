use thiserror::Error;

/// Failures surfaced by the aggregation protocol and its building blocks.
///
/// Every round-step entry point returns one of these instead of retrying
/// internally. A `ThresholdNotMet` aborts the whole round; the other kinds
/// are fatal only for the party that observed them.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("authentication failure: {0}")]
    AuthenticationFailure(String),

    #[error("{step}: got {got} qualifying peers, need at least {need}")]
    ThresholdNotMet {
        step: &'static str,
        got: usize,
        need: usize,
    },

    #[error("protocol misuse: {0}")]
    ProtocolMisuse(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ProtocolError::InvalidArgument(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        ProtocolError::AuthenticationFailure(msg.into())
    }

    pub fn misuse(msg: impl Into<String>) -> Self {
        ProtocolError::ProtocolMisuse(msg.into())
    }
}

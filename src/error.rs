use thiserror::Error;

/// Why a signed response was rejected. Logged server-side, never sent to
/// the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("public key not registered")]
    UnregisteredKey,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("signed message is malformed")]
    MalformedMessage,
    #[error("invalid or expired nonce")]
    InvalidOrExpiredNonce,
    #[error("timestamp out of range")]
    TimestampOutOfRange,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("registration mode not enabled")]
    RegistrationModeDisabled,
    #[error("unlock actuation failed: {0}")]
    UnlockActuationFailed(String),
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

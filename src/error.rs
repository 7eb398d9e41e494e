// intercom-signaling-service/src/error.rs
use thiserror::Error;

/// Failures that stop the service itself.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(#[from] anyhow::Error),
    #[error("call record store unavailable: {0}")]
    Records(#[from] RecordError),
    #[error("HTTP server error: {0}")]
    Http(#[from] hyper::Error),
    #[error("signaling listener failed: {0}")]
    Listener(String),
}

/// Access-token codec failures. All of them are terminal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("illegal AppKey")]
    IllegalAppKey,
    #[error("illegal Service")]
    IllegalService,
    #[error("illegal {0}")]
    IllegalField(&'static str),
    #[error("generate sign failed")]
    GenerateSignFailed,
    #[error("sign failed")]
    SignFailed,
    #[error("token compress failed")]
    CompressFailed,
    #[error("illegal appToken length")]
    IllegalLength,
    #[error("token decode failed: {0}")]
    DecodeFailed(String),
    #[error("token decompress failed: {0}")]
    DecompressFailed(String),
    #[error("parse {0} failed")]
    ParseFailed(&'static str),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,
    #[error("session already exists")]
    AlreadyExists,
    #[error("invalid state transition to {0}")]
    InvalidTransition(&'static str),
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("bus not connected")]
    NotConnected,
    #[error("publish failed: {0}")]
    PublishFailed(String),
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),
}

#[derive(Error, Debug)]
pub enum RtcError {
    #[error("credential issue failed: {0}")]
    Credential(#[from] TokenError),
    #[error("room creation failed: {0}")]
    Room(String),
}

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("record encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Failures surfaced by the call orchestrator.
#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("invalid call request: {0}")]
    InvalidRequest(String),
    #[error("unsupported action: {0}")]
    UnsupportedAction(String),
    #[error("participant mismatch for call {0}")]
    ParticipantMismatch(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Rtc(#[from] RtcError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("message encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

//! The user-facing error type for transport operations.

/// Errors reported to callers of connect/accept/send/recv and friends.
///
/// Wire-level protocol errors received from a peer are mapped onto these
/// before they reach the caller; parse errors and other internal detail
/// stay at the module that produced them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("address already in use")]
    AddrInUse,
    #[error("invalid address: {0}")]
    AddrInvalid(String),
    #[error("object is closed")]
    Closed,
    #[error("connection refused by peer")]
    ConnRefused,
    #[error("connection attempt timed out")]
    TimedOut,
    #[error("protocol violation")]
    Proto,
    #[error("message too large")]
    MsgSize,
    #[error("not connected")]
    NotConn,
    #[error("operation canceled")]
    Canceled,
    #[error("an operation of this kind is already in flight")]
    Busy,
    #[error("internal transport failure")]
    Internal,
    #[error("transport error from peer: {0}")]
    Transport(String),
}

impl From<crate::url::ParseError> for Error {
    fn from(value: crate::url::ParseError) -> Self {
        Error::AddrInvalid(value.to_string())
    }
}

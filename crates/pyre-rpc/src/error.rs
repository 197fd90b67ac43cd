//! Error taxonomy for the RPC engine and its mapping to wire error objects.

use pyre_protocol::{
    ErrorObject, CODE_INTERNAL_ERROR, CODE_INVALID_PARAMS, CODE_INVALID_REQUEST,
    CODE_METHOD_NOT_FOUND, CODE_NOTIFICATIONS_UNSUPPORTED, CODE_PARSE_ERROR, CODE_SERVER_ERROR,
    CODE_TIMEOUT,
};

pub type RpcResult<T> = Result<T, RpcError>;

/// Everything that can go wrong inside the RPC engine.
///
/// Protocol-level variants map onto the standard JSON-RPC error codes;
/// connection-lifecycle variants (`ConnectionLost`, `ClientQuit`, ...) are
/// delivered to local callers and subscriptions when a connection dies and
/// use the implementation-defined server error code if they ever need to be
/// written to the wire.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("the method {0} does not exist/is not available")]
    MethodNotFound(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("request timed out")]
    Timeout,
    #[error("notifications not supported")]
    NotificationsUnsupported,
    #[error("subscription not found")]
    SubscriptionNotFound,
    #[error("subscription queue overflow")]
    Overflow,
    #[error("connection lost")]
    ConnectionLost,
    #[error("client is closed")]
    ClientQuit,
    #[error("client reconnected")]
    ClientReconnected,
    #[error("server is shutting down")]
    Shutdown,
    #[error("subscription contract violated: {0}")]
    SubscriptionContract(&'static str),
    #[error("bad result in response: {0}")]
    BadResult(String),
    /// An error received from the remote peer.
    #[error("{0}")]
    Server(ErrorObject),
}

impl RpcError {
    /// The wire error code for this error.
    pub fn code(&self) -> i32 {
        match self {
            RpcError::Parse(_) => CODE_PARSE_ERROR,
            RpcError::InvalidRequest(_) => CODE_INVALID_REQUEST,
            RpcError::MethodNotFound(_) => CODE_METHOD_NOT_FOUND,
            RpcError::InvalidParams(_) => CODE_INVALID_PARAMS,
            RpcError::Internal(_) | RpcError::SubscriptionContract(_) => CODE_INTERNAL_ERROR,
            RpcError::Timeout => CODE_TIMEOUT,
            RpcError::NotificationsUnsupported => CODE_NOTIFICATIONS_UNSUPPORTED,
            RpcError::Server(e) => e.code,
            _ => CODE_SERVER_ERROR,
        }
    }

    /// Convert into the wire representation.
    pub fn to_object(&self) -> ErrorObject {
        match self {
            RpcError::Server(e) => e.clone(),
            other => ErrorObject::new(other.code(), other.to_string()),
        }
    }
}

impl From<ErrorObject> for RpcError {
    fn from(obj: ErrorObject) -> Self {
        RpcError::Server(obj)
    }
}

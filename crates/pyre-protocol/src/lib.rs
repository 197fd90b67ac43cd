//! Wire-level JSON-RPC 2.0 types shared by the pyre client and server.
//!
//! This crate is pure data: the message model, its validity predicates,
//! the standard error codes, and a handful of tagged quantity types used
//! by pyre APIs. Transport and dispatch live in `pyre-rpc`.

mod error;
mod message;
mod types;

pub use error::{
    ErrorObject, CODE_INTERNAL_ERROR, CODE_INVALID_PARAMS, CODE_INVALID_REQUEST,
    CODE_METHOD_NOT_FOUND, CODE_NOTIFICATIONS_UNSUPPORTED, CODE_PARSE_ERROR, CODE_SERVER_ERROR,
    CODE_TIMEOUT,
};
pub use message::{
    Message, SubscriptionPayload, DEFAULT_WRITE_TIMEOUT, MAX_CLIENT_SUBSCRIPTION_BUFFER,
    METHOD_SEPARATOR, NOTIFICATION_METHOD_SUFFIX, SUBSCRIBE_METHOD_SUFFIX, SUBSCRIBE_TIMEOUT,
    UNSUBSCRIBE_METHOD_SUFFIX, VERSION,
};
pub use types::{decode_quantity, encode_quantity, BlockNumber, QuantityError};

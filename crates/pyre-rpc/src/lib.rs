//! Bidirectional JSON-RPC 2.0 runtime with subscriptions.
//!
//! Both peers of a connection may issue calls, send notifications and serve
//! methods; the wire protocol is symmetric. On top of plain calls the crate
//! implements server-push subscriptions: a client calls `<ns>_subscribe`,
//! receives a subscription id, and the server streams `<ns>_subscription`
//! notifications until either side unsubscribes or the connection ends.
//!
//! The pieces:
//!
//! - [`Codec`] abstracts the transport: anything that can read and write
//!   batches of wire messages. [`StreamCodec`] covers line-delimited JSON
//!   over any `AsyncRead + AsyncWrite` pair (TCP, Unix sockets, pipes).
//! - [`Server`] holds the method [`Registry`] and serves codecs handed to
//!   [`Server::serve_codec`]; listeners stay outside the crate.
//! - [`Client`] multiplexes calls, batches and subscriptions over one
//!   connection, optionally reconnecting when it drops.
//!
//! Ordering guarantees worth knowing: a subscription's first event is never
//! written before the subscribe response carrying its id, and events of one
//! subscription are delivered in publish order. A slow subscriber buffers up
//! to 20,000 events client-side before the subscription is dropped with an
//! overflow error.

mod client;
mod codec;
mod error;
mod handler;
mod registry;
mod server;
mod subscription;

pub use client::{BatchRequest, Client, ClientBuilder, ReconnectFn};
pub use codec::{Codec, PeerInfo, StreamCodec, WirePayload};
pub use error::{RpcError, RpcResult};
pub use registry::{CallContext, Module, Params, RegisterError, Registry, SubscriptionContext};
pub use server::{Server, ServerConfig};
pub use subscription::{
    ClientSubscription, IdGenerator, Notifier, Subscription, SubscriptionId,
};

pub use pyre_protocol as protocol;
pub use pyre_protocol::{ErrorObject, Message, SubscriptionPayload};

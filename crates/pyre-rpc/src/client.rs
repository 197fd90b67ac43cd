//! Duplex RPC client.
//!
//! A [`Client`] owns one connection at a time and multiplexes calls, batch
//! calls and subscriptions over it. Because the wire is symmetric, a client
//! may also expose its own methods through the builder's registry; the peer
//! can call back over the same connection.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock, Weak};

use futures::future::BoxFuture;
use pyre_protocol::{Message, SUBSCRIBE_TIMEOUT, SUBSCRIBE_METHOD_SUFFIX, UNSUBSCRIBE_METHOD_SUFFIX};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::value::RawValue;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::codec::{Codec, WirePayload};
use crate::error::{RpcError, RpcResult};
use crate::handler::{Handler, PendingSub};
use crate::registry::{Module, RegisterError, Registry};
use crate::subscription::{
    active_sub, spawn_forwarder, ClientSubscription, IdGenerator, SubscriptionId, UnsubscribeFn,
};

/// Produces a fresh codec when the connection is lost.
pub type ReconnectFn =
    Arc<dyn Fn() -> BoxFuture<'static, RpcResult<Arc<dyn Codec>>> + Send + Sync>;

/// One request inside a [`Client::batch_call`].
pub struct BatchRequest {
    method: String,
    params: Option<Box<RawValue>>,
}

impl BatchRequest {
    pub fn new(method: impl Into<String>, params: impl Serialize) -> RpcResult<Self> {
        Ok(Self {
            method: method.into(),
            params: encode_params(params)?,
        })
    }
}

/// Configures and connects a [`Client`].
pub struct ClientBuilder {
    registry: Arc<Registry>,
    reconnect: Option<ReconnectFn>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            reconnect: None,
        }
    }

    /// Expose methods the peer may call back over this connection.
    pub fn register_name(self, namespace: &str, module: Module) -> Result<Self, RegisterError> {
        self.registry.register_name(namespace, module)?;
        Ok(self)
    }

    /// Reconnect automatically when the connection drops. In-flight calls
    /// and subscriptions still fail; new ones use the fresh connection.
    pub fn reconnect_with<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<Arc<dyn Codec>>> + Send + 'static,
    {
        self.reconnect = Some(Arc::new(move || Box::pin(f())));
        self
    }

    pub fn connect(self, codec: Arc<dyn Codec>) -> Client {
        Client::start(self.registry, self.reconnect, codec)
    }
}

struct Conn {
    codec: Arc<dyn Codec>,
    handler: Arc<Handler>,
}

struct ClientInner {
    registry: Arc<Registry>,
    idgen: Arc<IdGenerator>,
    id_counter: AtomicU64,
    conn: StdRwLock<Conn>,
    reconnect: Option<ReconnectFn>,
    closed: tokio_util::sync::CancellationToken,
}

/// Handle to a duplex RPC connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    fn start(registry: Arc<Registry>, reconnect: Option<ReconnectFn>, codec: Arc<dyn Codec>) -> Self {
        let idgen = Arc::new(IdGenerator::new());
        let handler = Handler::new(registry.clone(), codec.clone(), idgen.clone(), true, None);
        let inner = Arc::new(ClientInner {
            registry,
            idgen,
            id_counter: AtomicU64::new(1),
            conn: StdRwLock::new(Conn {
                codec: codec.clone(),
                handler: handler.clone(),
            }),
            reconnect,
            closed: tokio_util::sync::CancellationToken::new(),
        });
        tokio::spawn(dispatch(inner.clone(), codec, handler));
        Self { inner }
    }

    /// Perform a call and decode its result. `params` serializing to `null`
    /// sends no params field at all.
    pub async fn call<T, P>(&self, method: &str, params: P) -> RpcResult<T>
    where
        T: DeserializeOwned,
        P: Serialize,
    {
        let resp = self.inner.raw_call(method, encode_params(params)?).await?;
        decode_response(resp)
    }

    /// Send a notification; no response will ever arrive.
    pub async fn notify(&self, method: &str, params: impl Serialize) -> RpcResult<()> {
        let msg = Message::notification(method, encode_params(params)?);
        let (codec, _) = self.inner.conn_parts();
        codec.write(WirePayload::Single(&msg), false).await
    }

    /// Send several calls as one wire batch and collect each outcome. Result
    /// order matches request order regardless of completion order.
    pub async fn batch_call(&self, reqs: &[BatchRequest]) -> RpcResult<Vec<RpcResult<Value>>> {
        if reqs.is_empty() {
            return Ok(Vec::new());
        }
        let (codec, handler) = self.inner.conn_parts();
        let mut msgs = Vec::with_capacity(reqs.len());
        let mut ids = Vec::with_capacity(reqs.len());
        for req in reqs {
            let id = self.inner.next_id()?;
            ids.push(id.get().to_string());
            msgs.push(Message::call(id, req.method.clone(), req.params.clone()));
        }
        let (op, mut rx) = handler.register_op(ids.clone(), None)?;
        if let Err(e) = codec.write(WirePayload::Batch(&msgs), false).await {
            handler.cancel_op(&op);
            return Err(e);
        }

        let mut results: Vec<RpcResult<Value>> =
            (0..reqs.len()).map(|_| Err(RpcError::ConnectionLost)).collect();
        let mut filled = vec![false; reqs.len()];
        let mut remaining = reqs.len();
        while remaining > 0 {
            match rx.recv().await {
                Some(Ok(resp)) => {
                    let idx = resp
                        .id_text()
                        .and_then(|id| ids.iter().position(|known| known == id));
                    match idx {
                        Some(idx) if !filled[idx] => {
                            results[idx] = decode_response(resp);
                            filled[idx] = true;
                            remaining -= 1;
                        }
                        _ => debug!("dropping duplicate batch response"),
                    }
                }
                Some(Err(e)) => {
                    for (idx, done) in filled.iter().enumerate() {
                        if !done {
                            results[idx] = Err(e.clone());
                        }
                    }
                    break;
                }
                None => break,
            }
        }
        Ok(results)
    }

    /// Establish a subscription. `params` must be the full positional list,
    /// subscription name first. Events are decoded into `T` and pushed into
    /// `sink`; dropping the receiving half unsubscribes cleanly. Bounded by
    /// a five second ceiling on the server's answer.
    pub async fn subscribe<T, P>(
        &self,
        namespace: &str,
        params: P,
        sink: mpsc::Sender<T>,
    ) -> RpcResult<ClientSubscription>
    where
        T: DeserializeOwned + Send + 'static,
        P: Serialize,
    {
        let (codec, handler) = self.inner.conn_parts();
        let method = format!("{namespace}{SUBSCRIBE_METHOD_SUFFIX}");
        let id = self.inner.next_id()?;
        let msg = Message::call(id.clone(), method, encode_params(params)?);

        let (active, channels) = active_sub();
        let core = active.core.clone();
        let weak = Arc::downgrade(&self.inner);
        let ns = namespace.to_string();
        let start: Box<dyn FnOnce(SubscriptionId) -> crate::subscription::ActiveSub + Send> =
            Box::new(move |sub_id| {
                let unsub: UnsubscribeFn = Box::new(move || {
                    Box::pin(async move {
                        request_unsubscribe(weak, ns, sub_id).await;
                    })
                });
                spawn_forwarder(active.core.clone(), channels, sink, Some(unsub));
                active
            });

        let (op, mut rx) = handler.register_op(
            vec![id.get().to_string()],
            Some(PendingSub { start }),
        )?;
        if let Err(e) = codec.write(WirePayload::Single(&msg), false).await {
            handler.cancel_op(&op);
            return Err(e);
        }

        match tokio::time::timeout(SUBSCRIBE_TIMEOUT, rx.recv()).await {
            Err(_) => {
                handler.cancel_op(&op);
                Err(RpcError::Timeout)
            }
            Ok(None) => Err(RpcError::ConnectionLost),
            Ok(Some(Err(e))) => Err(e),
            Ok(Some(Ok(resp))) => {
                if let Some(err) = resp.error {
                    return Err(err.into());
                }
                let raw = resp
                    .result
                    .ok_or_else(|| RpcError::BadResult("response without result".into()))?;
                let sub_id: SubscriptionId = serde_json::from_str(raw.get())
                    .map_err(|e| RpcError::BadResult(e.to_string()))?;
                Ok(ClientSubscription::new(
                    sub_id,
                    namespace.to_string(),
                    core,
                ))
            }
        }
    }

    /// Shut the client down: fail in-flight calls, end subscriptions, close
    /// the connection.
    pub async fn close(&self) {
        self.inner.closed.cancel();
        let (codec, handler) = self.inner.conn_parts();
        codec.close();
        handler.close(RpcError::ClientQuit).await;
    }
}

impl ClientInner {
    fn conn_parts(&self) -> (Arc<dyn Codec>, Arc<Handler>) {
        let conn = self.conn.read().expect("connection lock poisoned");
        (conn.codec.clone(), conn.handler.clone())
    }

    fn next_id(&self) -> RpcResult<Box<RawValue>> {
        let n = self.id_counter.fetch_add(1, Ordering::Relaxed);
        serde_json::value::to_raw_value(&n).map_err(|e| RpcError::Internal(e.to_string()))
    }

    async fn raw_call(&self, method: &str, params: Option<Box<RawValue>>) -> RpcResult<Message> {
        let (codec, handler) = self.conn_parts();
        let id = self.next_id()?;
        let msg = Message::call(id.clone(), method, params);
        let (op, mut rx) = handler.register_op(vec![id.get().to_string()], None)?;
        if let Err(e) = codec.write(WirePayload::Single(&msg), false).await {
            handler.cancel_op(&op);
            return Err(e);
        }
        match rx.recv().await {
            Some(Ok(resp)) => Ok(resp),
            Some(Err(e)) => Err(e),
            None => Err(RpcError::ConnectionLost),
        }
    }
}

/// Best-effort server-side teardown after a local unsubscribe.
async fn request_unsubscribe(weak: Weak<ClientInner>, namespace: String, id: SubscriptionId) {
    let Some(inner) = weak.upgrade() else { return };
    let (_, handler) = inner.conn_parts();
    handler.remove_client_sub(&id);
    let method = format!("{namespace}{UNSUBSCRIBE_METHOD_SUFFIX}");
    let params = match encode_params((id.0.as_str(),)) {
        Ok(params) => params,
        Err(_) => return,
    };
    if let Err(e) = inner.raw_call(&method, params).await {
        debug!(error = %e, "unsubscribe request failed");
    }
}

/// Read loop for one connection; reconnects in place when configured.
async fn dispatch(inner: Arc<ClientInner>, codec: Arc<dyn Codec>, handler: Arc<Handler>) {
    let mut codec = codec;
    let mut handler = handler;
    loop {
        loop {
            tokio::select! {
                _ = inner.closed.cancelled() => {
                    codec.close();
                    handler.close(RpcError::ClientQuit).await;
                    return;
                }
                res = codec.read_batch() => match res {
                    Ok((msgs, is_batch)) => handler.handle_messages(msgs, is_batch).await,
                    Err(_) => break,
                },
            }
        }
        if inner.closed.is_cancelled() {
            handler.close(RpcError::ClientQuit).await;
            return;
        }
        let Some(reconnect) = inner.reconnect.clone() else {
            handler.close(RpcError::ConnectionLost).await;
            return;
        };
        handler.close(RpcError::ClientReconnected).await;
        match reconnect().await {
            Ok(new_codec) => {
                let new_handler = Handler::new(
                    inner.registry.clone(),
                    new_codec.clone(),
                    inner.idgen.clone(),
                    true,
                    None,
                );
                {
                    let mut conn = inner.conn.write().expect("connection lock poisoned");
                    conn.codec = new_codec.clone();
                    conn.handler = new_handler.clone();
                }
                codec = new_codec;
                handler = new_handler;
            }
            Err(e) => {
                warn!(error = %e, "reconnect failed, giving up");
                return;
            }
        }
    }
}

fn encode_params(params: impl Serialize) -> RpcResult<Option<Box<RawValue>>> {
    let raw = serde_json::value::to_raw_value(&params)
        .map_err(|e| RpcError::InvalidParams(e.to_string()))?;
    Ok(if raw.get() == "null" { None } else { Some(raw) })
}

fn decode_response<T: DeserializeOwned>(resp: Message) -> RpcResult<T> {
    if let Some(err) = resp.error {
        return Err(err.into());
    }
    let raw = resp
        .result
        .ok_or_else(|| RpcError::BadResult("response without result".into()))?;
    serde_json::from_str(raw.get()).map_err(|e| RpcError::BadResult(e.to_string()))
}

//! Per-connection message handling.
//!
//! A [`Handler`] owns everything scoped to one connection: in-flight outgoing
//! requests, server-side subscriptions feeding the peer, and client-side
//! subscriptions fed by the peer. Both [`Server`](crate::Server) and
//! [`Client`](crate::Client) drive one handler per connection; the wire
//! protocol is symmetric, so either side may issue calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::FutureExt;
use pyre_protocol::{Message, SubscriptionPayload};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::codec::{Codec, PeerInfo, WirePayload};
use crate::error::{RpcError, RpcResult};
use crate::registry::{CallContext, CallFn, Params, Registry, SubscribeFn, SubscriptionContext};
use crate::subscription::{ActiveSub, IdGenerator, Notifier, Subscription, SubscriptionId};

/// An in-flight outgoing request (or batch of requests) awaiting responses.
pub(crate) struct RequestOp {
    ids: Vec<String>,
    resp_tx: mpsc::Sender<Result<Message, RpcError>>,
    sub: StdMutex<Option<PendingSub>>,
}

/// Deferred start of a client subscription: runs once the subscribe response
/// delivers the server-assigned id, registering the delivery handle before
/// the caller is woken. Events arriving right behind the response therefore
/// always find their queue.
pub(crate) struct PendingSub {
    pub(crate) start: Box<dyn FnOnce(SubscriptionId) -> ActiveSub + Send>,
}

pub(crate) struct Handler {
    registry: Arc<Registry>,
    codec: Arc<dyn Codec>,
    idgen: Arc<IdGenerator>,
    peer: PeerInfo,
    allow_subscribe: bool,
    batch_timeout: Option<Duration>,
    root: CancellationToken,
    tracker: TaskTracker,
    pending: StdMutex<HashMap<String, Arc<RequestOp>>>,
    client_subs: StdMutex<HashMap<SubscriptionId, ActiveSub>>,
    server_subs: StdMutex<HashMap<SubscriptionId, Arc<Subscription>>>,
    closed: AtomicBool,
}

impl Handler {
    pub(crate) fn new(
        registry: Arc<Registry>,
        codec: Arc<dyn Codec>,
        idgen: Arc<IdGenerator>,
        allow_subscribe: bool,
        batch_timeout: Option<Duration>,
    ) -> Arc<Self> {
        let peer = codec.peer_info();
        Arc::new(Self {
            registry,
            codec,
            idgen,
            peer,
            allow_subscribe,
            batch_timeout,
            root: CancellationToken::new(),
            tracker: TaskTracker::new(),
            pending: StdMutex::new(HashMap::new()),
            client_subs: StdMutex::new(HashMap::new()),
            server_subs: StdMutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Dispatch one wire read. Batches run concurrently in a tracked task;
    /// single messages are handled inline where possible.
    pub(crate) async fn handle_messages(self: &Arc<Self>, msgs: Vec<Message>, is_batch: bool) {
        if is_batch {
            let this = self.clone();
            self.tracker.spawn(async move {
                this.process_batch(msgs).await;
            });
            return;
        }
        for msg in msgs {
            self.handle_msg(msg).await;
        }
    }

    async fn handle_msg(self: &Arc<Self>, msg: Message) {
        if msg.is_response() {
            self.handle_response(msg);
        } else if msg.is_notification() && msg.is_subscription_notification() {
            self.deliver_event(msg).await;
        } else {
            let this = self.clone();
            let cancel = self.root.child_token();
            self.tracker.spawn(async move {
                let guard = cancel.clone();
                // Cancellation wins: a handler that only completed because
                // teardown woke it must not get its response out.
                tokio::select! {
                    biased;
                    _ = guard.cancelled() => {}
                    _ = this.process_call(msg, cancel) => {}
                }
            });
        }
    }

    /// Run one call to completion: write its response, then activate any
    /// subscription it installed. Activation after the write keeps the
    /// subscription id ahead of its first event on the wire.
    async fn process_call(self: &Arc<Self>, msg: Message, cancel: CancellationToken) {
        let (resp, notifier) = self.handle_call(&msg, cancel).await;
        if let Some(resp) = resp {
            let is_error = resp.error.is_some();
            if let Err(e) = self.codec.write(WirePayload::Single(&resp), is_error).await {
                warn!(remote = %self.peer.remote_addr, error = %e, "response write failed");
                self.codec.close();
                return;
            }
        }
        if let Some(notifier) = notifier {
            if let Err(e) = notifier.activate().await {
                warn!(remote = %self.peer.remote_addr, error = %e, "subscription activation failed");
                self.codec.close();
            }
        }
    }

    /// Classify and execute a single incoming call or notification.
    async fn handle_call(
        self: &Arc<Self>,
        msg: &Message,
        cancel: CancellationToken,
    ) -> (Option<Message>, Option<Arc<Notifier>>) {
        if msg.is_notification() {
            self.handle_notification(msg, cancel).await;
            return (None, None);
        }
        if !msg.is_call() {
            let err = RpcError::InvalidRequest("not a valid request".into()).to_object();
            let resp = if msg.has_valid_id() {
                msg.error_response(err)
            } else {
                Message::null_id_error(err)
            };
            return (Some(resp), None);
        }

        if msg.is_unsubscribe() {
            return (Some(self.handle_unsubscribe(msg)), None);
        }
        if msg.is_subscribe() {
            return self.handle_subscribe(msg, cancel).await;
        }

        let method = msg.method.as_deref().unwrap_or_default();
        let Some(cb) = self.registry.call_callback(method) else {
            let err = RpcError::MethodNotFound(method.to_string());
            return (Some(msg.error_response(err.to_object())), None);
        };
        let cx = CallContext {
            cancel,
            peer: self.peer.clone(),
        };
        let resp = match invoke_call(cb, cx, Params::new(msg.params.clone())).await {
            Ok(value) => msg.response(&value),
            Err(e) => msg.error_response(e.to_object()),
        };
        (Some(resp), None)
    }

    async fn handle_notification(self: &Arc<Self>, msg: &Message, cancel: CancellationToken) {
        if msg.is_subscribe() || msg.is_unsubscribe() {
            debug!(remote = %self.peer.remote_addr, "dropping subscribe notification");
            return;
        }
        let method = msg.method.as_deref().unwrap_or_default();
        let Some(cb) = self.registry.call_callback(method) else {
            debug!(method, "notification for unknown method");
            return;
        };
        let cx = CallContext {
            cancel,
            peer: self.peer.clone(),
        };
        let _ = invoke_call(cb, cx, Params::new(msg.params.clone())).await;
    }

    fn handle_unsubscribe(&self, msg: &Message) -> Message {
        let id = Params::new(msg.params.clone())
            .split_first()
            .map(|(id, _)| SubscriptionId(id));
        let id = match id {
            Ok(id) => id,
            Err(e) => return msg.error_response(e.to_object()),
        };
        let sub = self
            .server_subs
            .lock()
            .expect("subscription table lock poisoned")
            .remove(&id);
        match sub {
            Some(sub) => {
                sub.terminate(None);
                msg.response(&Value::Bool(true))
            }
            None => msg.error_response(RpcError::SubscriptionNotFound.to_object()),
        }
    }

    async fn handle_subscribe(
        self: &Arc<Self>,
        msg: &Message,
        cancel: CancellationToken,
    ) -> (Option<Message>, Option<Arc<Notifier>>) {
        if !self.allow_subscribe {
            let err = RpcError::NotificationsUnsupported;
            return (Some(msg.error_response(err.to_object())), None);
        }
        let namespace = msg.namespace().to_string();
        let (name, params) = match Params::new(msg.params.clone()).split_first() {
            Ok(split) => split,
            Err(e) => return (Some(msg.error_response(e.to_object())), None),
        };
        let Some(cb) = self.registry.subscription_callback(&namespace, &name) else {
            let err = RpcError::MethodNotFound(format!("{namespace}_{name}"));
            return (Some(msg.error_response(err.to_object())), None);
        };

        let notifier = Arc::new(Notifier::new(
            self.codec.clone(),
            namespace,
            self.idgen.clone(),
        ));
        let cx = SubscriptionContext {
            cancel,
            peer: self.peer.clone(),
            notifier: notifier.clone(),
        };
        // The handler must return the subscription it created through this
        // notifier; anything else violates the contract.
        let sub = match invoke_subscribe(cb, cx, params).await {
            Ok(returned) => match notifier.take_subscription().await {
                Ok(created) if Arc::ptr_eq(&created, &returned) => created,
                Ok(_) => {
                    let err =
                        RpcError::SubscriptionContract("handler returned a foreign subscription");
                    return (Some(msg.error_response(err.to_object())), None);
                }
                Err(e) => return (Some(msg.error_response(e.to_object())), None),
            },
            Err(e) => return (Some(msg.error_response(e.to_object())), None),
        };

        self.server_subs
            .lock()
            .expect("subscription table lock poisoned")
            .insert(sub.id().clone(), sub.clone());
        let resp = msg.response(&Value::String(sub.id().0.clone()));
        (Some(resp), Some(notifier))
    }

    /// Route a `*_subscription` event to its client-side queue.
    async fn deliver_event(&self, msg: Message) {
        let payload: SubscriptionPayload = match msg
            .params
            .as_deref()
            .map(|p| serde_json::from_str(p.get()))
        {
            Some(Ok(payload)) => payload,
            _ => {
                debug!(remote = %self.peer.remote_addr, "malformed subscription event");
                return;
            }
        };
        let id = SubscriptionId(payload.subscription);
        let active = self
            .client_subs
            .lock()
            .expect("subscription table lock poisoned")
            .get(&id)
            .cloned();
        match (active, payload.result) {
            (Some(active), Some(result)) => active.deliver(result).await,
            (Some(_), None) => debug!(%id, "subscription event without a result"),
            (None, _) => debug!(%id, "event for unknown subscription"),
        }
    }

    /// Correlate an incoming response with its pending request.
    fn handle_response(&self, msg: Message) {
        let Some(id) = msg.id_text() else { return };
        let op = self
            .pending
            .lock()
            .expect("pending table lock poisoned")
            .remove(id);
        let Some(op) = op else {
            debug!(id, "dropping unmatched response");
            return;
        };
        if msg.error.is_none() {
            let pending_sub = op.sub.lock().expect("pending sub lock poisoned").take();
            if let Some(ps) = pending_sub {
                let sub_id = msg
                    .result
                    .as_deref()
                    .and_then(|r| serde_json::from_str::<SubscriptionId>(r.get()).ok());
                if let Some(sub_id) = sub_id {
                    let active = (ps.start)(sub_id.clone());
                    self.client_subs
                        .lock()
                        .expect("subscription table lock poisoned")
                        .insert(sub_id, active);
                }
            }
        }
        let _ = op.resp_tx.try_send(Ok(msg));
    }

    /// Handle a batch: dispatch entries concurrently, collect responses in
    /// completion order, and write them all in one wire payload.
    async fn process_batch(self: &Arc<Self>, msgs: Vec<Message>) {
        if msgs.is_empty() {
            let resp =
                Message::null_id_error(RpcError::InvalidRequest("empty batch".into()).to_object());
            if self.codec.write(WirePayload::Single(&resp), true).await.is_err() {
                self.codec.close();
            }
            return;
        }

        let batch_token = self.root.child_token();
        let (done_tx, mut done_rx) = mpsc::channel::<(usize, Message, Option<Arc<Notifier>>)>(msgs.len());
        let mut expected: Vec<(usize, Message)> = Vec::new();

        for (idx, msg) in msgs.into_iter().enumerate() {
            if msg.is_response() {
                self.handle_response(msg);
            } else if msg.is_notification() && msg.is_subscription_notification() {
                self.deliver_event(msg).await;
            } else if msg.is_notification() {
                let this = self.clone();
                let cancel = batch_token.child_token();
                self.tracker.spawn(async move {
                    let guard = cancel.clone();
                    tokio::select! {
                        _ = guard.cancelled() => {}
                        _ = this.handle_notification(&msg, cancel) => {}
                    }
                });
            } else {
                expected.push((idx, msg.clone()));
                let this = self.clone();
                let cancel = batch_token.child_token();
                let done = done_tx.clone();
                self.tracker.spawn(async move {
                    let guard = cancel.clone();
                    tokio::select! {
                        _ = guard.cancelled() => {}
                        out = this.handle_call(&msg, cancel) => {
                            if let (Some(resp), notifier) = out {
                                let _ = done.try_send((idx, resp, notifier));
                            }
                        }
                    }
                });
            }
        }
        drop(done_tx);

        let mut responses: Vec<Message> = Vec::with_capacity(expected.len());
        let mut notifiers: Vec<Arc<Notifier>> = Vec::new();
        let mut answered: Vec<usize> = Vec::new();
        let batch_timeout = self.batch_timeout;
        let deadline = async move {
            match batch_timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        while answered.len() < expected.len() {
            tokio::select! {
                unit = done_rx.recv() => match unit {
                    Some((idx, resp, notifier)) => {
                        answered.push(idx);
                        responses.push(resp);
                        notifiers.extend(notifier);
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    batch_token.cancel();
                    for (idx, msg) in &expected {
                        if !answered.contains(idx) {
                            responses.push(msg.error_response(RpcError::Timeout.to_object()));
                        }
                    }
                    break;
                }
            }
        }

        // Notification-only batches produce no reply at all.
        if !responses.is_empty() {
            let is_error = responses.iter().any(|r| r.error.is_some());
            if let Err(e) = self
                .codec
                .write(WirePayload::Batch(&responses), is_error)
                .await
            {
                warn!(remote = %self.peer.remote_addr, error = %e, "batch write failed");
                self.codec.close();
                return;
            }
        }
        for notifier in notifiers {
            if let Err(e) = notifier.activate().await {
                warn!(remote = %self.peer.remote_addr, error = %e, "subscription activation failed");
                self.codec.close();
                return;
            }
        }
    }

    /// Register an outgoing request before it is written. `sub` defers the
    /// start of a client subscription to response time.
    pub(crate) fn register_op(
        &self,
        ids: Vec<String>,
        sub: Option<PendingSub>,
    ) -> RpcResult<(Arc<RequestOp>, mpsc::Receiver<Result<Message, RpcError>>)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::ConnectionLost);
        }
        let (resp_tx, resp_rx) = mpsc::channel(ids.len().max(1));
        let op = Arc::new(RequestOp {
            ids,
            resp_tx,
            sub: StdMutex::new(sub),
        });
        let mut pending = self.pending.lock().expect("pending table lock poisoned");
        for id in &op.ids {
            pending.insert(id.clone(), op.clone());
        }
        Ok((op, resp_rx))
    }

    /// Forget a registered request, e.g. after a failed write.
    pub(crate) fn cancel_op(&self, op: &Arc<RequestOp>) {
        let mut pending = self.pending.lock().expect("pending table lock poisoned");
        for id in &op.ids {
            if pending.get(id).is_some_and(|existing| Arc::ptr_eq(existing, op)) {
                pending.remove(id);
            }
        }
    }

    pub(crate) fn remove_client_sub(&self, id: &SubscriptionId) {
        self.client_subs
            .lock()
            .expect("subscription table lock poisoned")
            .remove(id);
    }

    /// Tear the connection state down, in dependency order: fail callers
    /// first, stop client subscriptions, wait for in-flight handlers, then
    /// release server-side producers.
    pub(crate) async fn close(&self, reason: RpcError) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let pending: Vec<Arc<RequestOp>> = {
            let mut map = self.pending.lock().expect("pending table lock poisoned");
            map.drain().map(|(_, op)| op).collect()
        };
        for op in pending {
            let _ = op.resp_tx.try_send(Err(reason.clone()));
        }

        let client_subs: Vec<ActiveSub> = {
            let mut map = self
                .client_subs
                .lock()
                .expect("subscription table lock poisoned");
            map.drain().map(|(_, sub)| sub).collect()
        };
        for sub in &client_subs {
            sub.close(reason.clone());
        }
        for sub in &client_subs {
            sub.done().await;
        }

        self.root.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        let server_subs: Vec<Arc<Subscription>> = {
            let mut map = self
                .server_subs
                .lock()
                .expect("subscription table lock poisoned");
            map.drain().map(|(_, sub)| sub).collect()
        };
        for sub in server_subs {
            sub.terminate(Some(reason.clone()));
        }
    }
}

async fn invoke_call(cb: CallFn, cx: CallContext, params: Params) -> RpcResult<Value> {
    match AssertUnwindSafe(cb(cx, params)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(RpcError::Internal("method handler crashed".into())),
    }
}

async fn invoke_subscribe(
    cb: SubscribeFn,
    cx: SubscriptionContext,
    params: Params,
) -> RpcResult<Arc<Subscription>> {
    match AssertUnwindSafe(cb(cx, params)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(RpcError::Internal("subscription handler crashed".into())),
    }
}

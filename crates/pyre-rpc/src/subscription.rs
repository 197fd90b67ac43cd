//! Subscription plumbing for both sides of a connection.
//!
//! Server side: a [`Notifier`] is handed to each subscription handler. It
//! creates the subscription, buffers events until the subscribe response has
//! been written, and pushes events over the wire afterwards.
//!
//! Client side: each active subscription owns a forwarding task that decodes
//! incoming events and hands them to the caller's channel, buffering up to
//! [`MAX_CLIENT_SUBSCRIPTION_BUFFER`] events when the caller is slow.

use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use pyre_protocol::{
    Message, SubscriptionPayload, MAX_CLIENT_SUBSCRIPTION_BUFFER, NOTIFICATION_METHOD_SUFFIX,
};
use rand::RngExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::{Codec, WirePayload};
use crate::error::{RpcError, RpcResult};
use crate::registry::BoxFuture;

/// Identifier of an active subscription, e.g. `0x9f1a4c`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub String);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SubscriptionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Generates subscription identifiers: 16 random bytes, hex encoded with
/// leading zero digits stripped, `0x` prefixed.
#[derive(Default)]
pub struct IdGenerator;

impl IdGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn next_id(&self) -> SubscriptionId {
        let bytes: [u8; 16] = rand::rng().random();
        let mut hex = String::with_capacity(32);
        for b in bytes {
            let _ = write!(hex, "{b:02x}");
        }
        let digits = hex.trim_start_matches('0');
        let digits = if digits.is_empty() { "0" } else { digits };
        SubscriptionId(format!("0x{digits}"))
    }
}

/// One-shot terminal-error slot. The first close wins; later closes are
/// ignored. Waiters observe the stored error once closed.
pub(crate) struct ErrorSlot {
    closed: AtomicBool,
    err: StdMutex<Option<RpcError>>,
    done: CancellationToken,
}

impl ErrorSlot {
    pub(crate) fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            err: StdMutex::new(None),
            done: CancellationToken::new(),
        }
    }

    /// Returns true if this call performed the close.
    pub(crate) fn close(&self, err: Option<RpcError>) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.err.lock().expect("error slot lock poisoned") = err;
        self.done.cancel();
        true
    }

    pub(crate) async fn recv(&self) -> Option<RpcError> {
        self.done.cancelled().await;
        self.err.lock().expect("error slot lock poisoned").clone()
    }
}

/// A server-side subscription, as returned by a subscription handler.
pub struct Subscription {
    id: SubscriptionId,
    namespace: String,
    slot: ErrorSlot,
}

impl Subscription {
    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Resolves when the subscription ends: `None` for a clean unsubscribe,
    /// `Some` when the connection failed or the server shut down. Producer
    /// tasks select on this to know when to stop.
    pub async fn closed(&self) -> Option<RpcError> {
        self.slot.recv().await
    }

    /// End the subscription. Idempotent.
    pub fn terminate(&self, err: Option<RpcError>) {
        self.slot.close(err);
    }
}

struct NotifierState {
    sub: Option<Arc<Subscription>>,
    buffer: Vec<Box<RawValue>>,
    taken: bool,
    activated: bool,
}

/// Creates subscriptions and delivers their events.
///
/// Events published before [`activate`](Notifier::activate) are buffered and
/// flushed in publish order once the subscribe response is on the wire, so a
/// client never sees an event before it knows the subscription id.
pub struct Notifier {
    codec: Arc<dyn Codec>,
    namespace: String,
    idgen: Arc<IdGenerator>,
    state: Mutex<NotifierState>,
}

impl Notifier {
    pub(crate) fn new(codec: Arc<dyn Codec>, namespace: String, idgen: Arc<IdGenerator>) -> Self {
        Self {
            codec,
            namespace,
            idgen,
            state: Mutex::new(NotifierState {
                sub: None,
                buffer: Vec::new(),
                taken: false,
                activated: false,
            }),
        }
    }

    /// Create the subscription this handler will serve. Must be called
    /// exactly once, before the handler returns.
    pub async fn create_subscription(&self) -> RpcResult<Arc<Subscription>> {
        let mut state = self.state.lock().await;
        if state.taken {
            return Err(RpcError::SubscriptionContract(
                "subscription created after handler returned",
            ));
        }
        if state.sub.is_some() {
            return Err(RpcError::SubscriptionContract(
                "handler created more than one subscription",
            ));
        }
        let sub = Arc::new(Subscription {
            id: self.idgen.next_id(),
            namespace: self.namespace.clone(),
            slot: ErrorSlot::new(),
        });
        state.sub = Some(sub.clone());
        Ok(sub)
    }

    /// Publish an event on the subscription. Buffered until activation,
    /// written to the wire afterwards.
    pub async fn notify(&self, id: &SubscriptionId, event: &(impl Serialize + ?Sized)) -> RpcResult<()> {
        let raw = serde_json::value::to_raw_value(event)
            .map_err(|e| RpcError::Internal(e.to_string()))?;
        let mut state = self.state.lock().await;
        match &state.sub {
            Some(sub) if sub.id == *id => {}
            Some(_) => {
                return Err(RpcError::SubscriptionContract(
                    "notify called with a foreign subscription id",
                ))
            }
            None => {
                return Err(RpcError::SubscriptionContract(
                    "notify called before the subscription was created",
                ))
            }
        }
        if !state.activated {
            state.buffer.push(raw);
            return Ok(());
        }
        // Lock held across the write: activation drains the buffer under the
        // same lock, so wire order always matches publish order.
        self.send(id, raw).await
    }

    /// Hand the created subscription to the connection for registration.
    pub(crate) async fn take_subscription(&self) -> RpcResult<Arc<Subscription>> {
        let mut state = self.state.lock().await;
        state.taken = true;
        state.sub.clone().ok_or(RpcError::SubscriptionContract(
            "handler returned without creating a subscription",
        ))
    }

    /// Flush buffered events and start writing directly. Called once the
    /// subscribe response has been written.
    pub(crate) async fn activate(&self) -> RpcResult<()> {
        let mut state = self.state.lock().await;
        let id = match &state.sub {
            Some(sub) => sub.id.clone(),
            None => return Ok(()),
        };
        for raw in std::mem::take(&mut state.buffer) {
            self.send(&id, raw).await?;
        }
        state.activated = true;
        Ok(())
    }

    async fn send(&self, id: &SubscriptionId, result: Box<RawValue>) -> RpcResult<()> {
        let payload = SubscriptionPayload {
            subscription: id.0.clone(),
            result: Some(result),
        };
        let params = serde_json::value::to_raw_value(&payload)
            .map_err(|e| RpcError::Internal(e.to_string()))?;
        let msg = Message::notification(
            format!("{}{}", self.namespace, NOTIFICATION_METHOD_SUFFIX),
            Some(params),
        );
        self.codec.write(WirePayload::Single(&msg), false).await
    }
}

/// Why the client forward loop is being told to stop.
pub(crate) enum QuitReason {
    /// Local unsubscribe; the server should be told.
    Unsubscribed,
    /// The connection died or the client was closed.
    Conn(RpcError),
}

/// State shared between a [`ClientSubscription`] handle, its [`ActiveSub`]
/// delivery side, and the forwarding task.
pub(crate) struct SubCore {
    quit_tx: mpsc::Sender<QuitReason>,
    /// Cancelled when the forward loop exits; delivery stops blocking.
    forward_done: CancellationToken,
    /// Cancelled once teardown (including any server unsubscribe) finished.
    unsub_done: CancellationToken,
    slot: ErrorSlot,
    unsubscribed: AtomicBool,
}

/// Delivery handle kept by the connection for an established client
/// subscription.
#[derive(Clone)]
pub(crate) struct ActiveSub {
    in_tx: mpsc::Sender<Box<RawValue>>,
    pub(crate) core: Arc<SubCore>,
}

impl ActiveSub {
    /// Hand a raw event to the forwarding task. Drops the event if the task
    /// has already exited.
    pub(crate) async fn deliver(&self, raw: Box<RawValue>) {
        tokio::select! {
            biased;
            _ = self.core.forward_done.cancelled() => {}
            res = self.in_tx.send(raw) => { let _ = res; }
        }
    }

    /// Tear the subscription down because the connection is going away.
    pub(crate) fn close(&self, err: RpcError) {
        let _ = self.core.quit_tx.try_send(QuitReason::Conn(err));
    }

    /// Resolves once the forwarding task has fully torn down.
    pub(crate) async fn done(&self) {
        self.core.unsub_done.cancelled().await;
    }
}

/// Receiving halves of the forwarder channels, consumed by
/// [`spawn_forwarder`].
pub(crate) struct ForwarderChannels {
    in_rx: mpsc::Receiver<Box<RawValue>>,
    quit_rx: mpsc::Receiver<QuitReason>,
}

/// Build the delivery handle and channel set for a new client subscription.
pub(crate) fn active_sub() -> (ActiveSub, ForwarderChannels) {
    let (in_tx, in_rx) = mpsc::channel(1);
    let (quit_tx, quit_rx) = mpsc::channel(1);
    let core = Arc::new(SubCore {
        quit_tx,
        forward_done: CancellationToken::new(),
        unsub_done: CancellationToken::new(),
        slot: ErrorSlot::new(),
        unsubscribed: AtomicBool::new(false),
    });
    (ActiveSub { in_tx, core }, ForwarderChannels { in_rx, quit_rx })
}

/// Asks the server to drop the subscription; best effort.
pub(crate) type UnsubscribeFn = Box<dyn FnOnce() -> BoxFuture<()> + Send>;

/// A subscription established by [`Client::subscribe`](crate::Client::subscribe).
///
/// Events arrive on the channel passed to `subscribe`. Dropping the receiving
/// end of that channel unsubscribes cleanly.
pub struct ClientSubscription {
    id: SubscriptionId,
    namespace: String,
    core: Arc<SubCore>,
}

impl std::fmt::Debug for ClientSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSubscription")
            .field("id", &self.id)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl ClientSubscription {
    pub(crate) fn new(id: SubscriptionId, namespace: String, core: Arc<SubCore>) -> Self {
        Self { id, namespace, core }
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Resolves when the subscription ends: `None` after a local
    /// unsubscribe, `Some` for queue overflow, decode failures or a lost
    /// connection.
    pub async fn closed(&self) -> Option<RpcError> {
        self.core.slot.recv().await
    }

    /// Stop the subscription and tell the server. Safe to call multiple
    /// times, including concurrently; every caller returns once teardown is
    /// complete.
    pub async fn unsubscribe(&self) {
        if self.core.unsubscribed.swap(true, Ordering::AcqRel) {
            self.core.unsub_done.cancelled().await;
            return;
        }
        tokio::select! {
            res = self.core.quit_tx.send(QuitReason::Unsubscribed) => { let _ = res; }
            _ = self.core.forward_done.cancelled() => {}
        }
        self.core.unsub_done.cancelled().await;
    }
}

/// Spawn the forwarding task for an established subscription. `unsub` runs
/// during teardown when the server should be told (local unsubscribe,
/// overflow, dropped sink), never after a lost connection.
pub(crate) fn spawn_forwarder<T>(
    core: Arc<SubCore>,
    channels: ForwarderChannels,
    sink: mpsc::Sender<T>,
    unsub: Option<UnsubscribeFn>,
) -> JoinHandle<()>
where
    T: DeserializeOwned + Send + 'static,
{
    tokio::spawn(async move {
        let (tell_server, err) = forward_loop(channels, sink).await;
        core.forward_done.cancel();
        if tell_server {
            if let Some(unsub) = unsub {
                unsub().await;
            }
        }
        let err = match err {
            Some(RpcError::ClientQuit) => None,
            other => other,
        };
        core.slot.close(err);
        core.unsub_done.cancel();
    })
}

/// Core loop: buffer incoming events and feed the caller's sink. Returns
/// whether the server should be unsubscribed and the terminal error, if any.
async fn forward_loop<T>(
    mut channels: ForwarderChannels,
    sink: mpsc::Sender<T>,
) -> (bool, Option<RpcError>)
where
    T: DeserializeOwned + Send + 'static,
{
    let mut buffer: std::collections::VecDeque<T> = std::collections::VecDeque::new();

    let intake = |raw: Box<RawValue>, buffer: &mut std::collections::VecDeque<T>| {
        if buffer.len() == MAX_CLIENT_SUBSCRIPTION_BUFFER {
            return Some((true, Some(RpcError::Overflow)));
        }
        match serde_json::from_str::<T>(raw.get()) {
            Ok(value) => {
                buffer.push_back(value);
                None
            }
            Err(e) => Some((true, Some(RpcError::Parse(e.to_string())))),
        }
    };

    loop {
        if buffer.is_empty() {
            tokio::select! {
                reason = channels.quit_rx.recv() => match reason {
                    Some(QuitReason::Unsubscribed) => return (true, None),
                    Some(QuitReason::Conn(e)) => return (false, Some(e)),
                    None => return (false, None),
                },
                raw = channels.in_rx.recv() => match raw {
                    Some(raw) => {
                        if let Some(out) = intake(raw, &mut buffer) {
                            return out;
                        }
                    }
                    None => return (false, None),
                },
            }
        } else {
            // Deliberately unbiased: delivery to the sink and intake of new
            // events must both stay live when the other is always ready.
            tokio::select! {
                reason = channels.quit_rx.recv() => match reason {
                    Some(QuitReason::Unsubscribed) => return (true, None),
                    Some(QuitReason::Conn(e)) => return (false, Some(e)),
                    None => return (false, None),
                },
                permit = sink.reserve() => match permit {
                    Ok(permit) => {
                        if let Some(value) = buffer.pop_front() {
                            permit.send(value);
                        }
                    }
                    // Receiver dropped: treat as a clean unsubscribe.
                    Err(_) => return (true, None),
                },
                raw = channels.in_rx.recv() => match raw {
                    Some(raw) => {
                        if let Some(out) = intake(raw, &mut buffer) {
                            return out;
                        }
                    }
                    None => return (false, None),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PeerInfo;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct RecordingCodec {
        writes: StdMutex<Vec<String>>,
        closed: CancellationToken,
    }

    impl RecordingCodec {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                writes: StdMutex::new(Vec::new()),
                closed: CancellationToken::new(),
            })
        }

        fn written(&self) -> Vec<String> {
            self.writes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Codec for RecordingCodec {
        async fn read_batch(&self) -> RpcResult<(Vec<Message>, bool)> {
            self.closed.cancelled().await;
            Err(RpcError::ConnectionLost)
        }

        async fn write(&self, payload: WirePayload<'_>, _is_error: bool) -> RpcResult<()> {
            let text = match payload {
                WirePayload::Single(msg) => serde_json::to_string(msg).unwrap(),
                WirePayload::Batch(msgs) => serde_json::to_string(msgs).unwrap(),
            };
            self.writes.lock().unwrap().push(text);
            Ok(())
        }

        fn close(&self) {
            self.closed.cancel();
        }

        fn closed(&self) -> CancellationToken {
            self.closed.clone()
        }

        fn peer_info(&self) -> PeerInfo {
            PeerInfo {
                transport: "test".into(),
                remote_addr: String::new(),
            }
        }
    }

    #[test]
    fn ids_are_short_hex_quantities() {
        let idgen = IdGenerator::new();
        for _ in 0..64 {
            let id = idgen.next_id();
            let digits = id.0.strip_prefix("0x").expect("missing 0x prefix");
            assert!(!digits.is_empty());
            assert!(digits == "0" || !digits.starts_with('0'));
            assert!(digits.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[tokio::test]
    async fn error_slot_first_close_wins() {
        let slot = ErrorSlot::new();
        assert!(slot.close(Some(RpcError::ConnectionLost)));
        assert!(!slot.close(None));
        assert!(matches!(slot.recv().await, Some(RpcError::ConnectionLost)));
    }

    #[tokio::test]
    async fn notifier_buffers_until_activation() {
        let codec = RecordingCodec::new();
        let notifier = Notifier::new(codec.clone(), "svc".into(), Arc::new(IdGenerator::new()));
        let sub = notifier.create_subscription().await.unwrap();

        notifier.notify(sub.id(), &1u64).await.unwrap();
        notifier.notify(sub.id(), &2u64).await.unwrap();
        assert!(codec.written().is_empty());

        notifier.activate().await.unwrap();
        notifier.notify(sub.id(), &3u64).await.unwrap();

        let writes = codec.written();
        assert_eq!(writes.len(), 3);
        for (i, line) in writes.iter().enumerate() {
            let msg: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(msg["method"], "svc_subscription");
            assert_eq!(msg["params"]["subscription"], sub.id().0);
            assert_eq!(msg["params"]["result"], i as u64 + 1);
        }
    }

    #[tokio::test]
    async fn notifier_enforces_single_subscription() {
        let codec = RecordingCodec::new();
        let notifier = Notifier::new(codec.clone(), "svc".into(), Arc::new(IdGenerator::new()));

        let sub = notifier.create_subscription().await.unwrap();
        assert!(matches!(
            notifier.create_subscription().await,
            Err(RpcError::SubscriptionContract(_))
        ));

        let foreign = SubscriptionId("0xdead".into());
        assert!(matches!(
            notifier.notify(&foreign, &0u64).await,
            Err(RpcError::SubscriptionContract(_))
        ));
        drop(sub);

        let empty = Notifier::new(codec, "svc".into(), Arc::new(IdGenerator::new()));
        assert!(matches!(
            empty.take_subscription().await,
            Err(RpcError::SubscriptionContract(_))
        ));
        assert!(matches!(
            empty.create_subscription().await,
            Err(RpcError::SubscriptionContract(_))
        ));
    }

    fn raw(n: u64) -> Box<RawValue> {
        serde_json::value::to_raw_value(&n).unwrap()
    }

    #[tokio::test]
    async fn forwarder_preserves_order() {
        let (active, channels) = active_sub();
        let (sink_tx, mut sink_rx) = mpsc::channel::<u64>(4);
        spawn_forwarder(active.core.clone(), channels, sink_tx, None);

        for n in 0..100u64 {
            active.deliver(raw(n)).await;
        }
        for n in 0..100u64 {
            assert_eq!(sink_rx.recv().await, Some(n));
        }
    }

    #[tokio::test]
    async fn forwarder_overflows_when_caller_stalls() {
        let (active, channels) = active_sub();
        let (sink_tx, sink_rx) = mpsc::channel::<u64>(1);
        let unsub_calls = Arc::new(AtomicUsize::new(0));
        let counter = unsub_calls.clone();
        let unsub: UnsubscribeFn = Box::new(move || {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });
        spawn_forwarder(active.core.clone(), channels, sink_tx, Some(unsub));

        // One event parks in the sink, the buffer fills, the next overflows.
        let sub = ClientSubscription::new(SubscriptionId("0x1".into()), "svc".into(), active.core.clone());
        for n in 0..(MAX_CLIENT_SUBSCRIPTION_BUFFER as u64 + 3) {
            active.deliver(raw(n)).await;
        }
        assert!(matches!(sub.closed().await, Some(RpcError::Overflow)));
        active.done().await;
        assert_eq!(unsub_calls.load(Ordering::SeqCst), 1);
        drop(sink_rx);
    }

    #[tokio::test]
    async fn dropped_sink_unsubscribes_cleanly() {
        let (active, channels) = active_sub();
        let (sink_tx, sink_rx) = mpsc::channel::<u64>(1);
        let unsub_calls = Arc::new(AtomicUsize::new(0));
        let counter = unsub_calls.clone();
        let unsub: UnsubscribeFn = Box::new(move || {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });
        spawn_forwarder(active.core.clone(), channels, sink_tx, Some(unsub));

        drop(sink_rx);
        active.deliver(raw(1)).await;
        active.deliver(raw(2)).await;

        let sub = ClientSubscription::new(SubscriptionId("0x1".into()), "svc".into(), active.core);
        assert!(sub.closed().await.is_none());
        sub.unsubscribe().await;
        assert_eq!(unsub_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_under_races() {
        let (active, channels) = active_sub();
        let (sink_tx, _sink_rx) = mpsc::channel::<u64>(1);
        let unsub_calls = Arc::new(AtomicUsize::new(0));
        let counter = unsub_calls.clone();
        let unsub: UnsubscribeFn = Box::new(move || {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });
        spawn_forwarder(active.core.clone(), channels, sink_tx, Some(unsub));

        let sub = Arc::new(ClientSubscription::new(
            SubscriptionId("0x1".into()),
            "svc".into(),
            active.core,
        ));
        let a = sub.clone();
        let b = sub.clone();
        tokio::join!(a.unsubscribe(), b.unsubscribe());
        sub.unsubscribe().await;

        assert_eq!(unsub_calls.load(Ordering::SeqCst), 1);
        assert!(sub.closed().await.is_none());
    }

    #[tokio::test]
    async fn connection_loss_surfaces_as_error() {
        let (active, channels) = active_sub();
        let (sink_tx, _sink_rx) = mpsc::channel::<u64>(1);
        let unsub_calls = Arc::new(AtomicUsize::new(0));
        let counter = unsub_calls.clone();
        let unsub: UnsubscribeFn = Box::new(move || {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });
        spawn_forwarder(active.core.clone(), channels, sink_tx, Some(unsub));

        active.close(RpcError::ConnectionLost);
        let sub = ClientSubscription::new(SubscriptionId("0x1".into()), "svc".into(), active.core);
        assert!(matches!(sub.closed().await, Some(RpcError::ConnectionLost)));
        sub.unsubscribe().await;
        // No point telling the server over a dead connection.
        assert_eq!(unsub_calls.load(Ordering::SeqCst), 0);
    }
}

//! Method and subscription registry.
//!
//! Handlers are registered explicitly per namespace through a [`Module`]
//! builder: each entry is a typed async closure, so only the two legal
//! handler shapes (plain call, subscription) are expressible. Exposed names
//! get their first letter lowercased; the wire name is
//! `namespace_method` with a single `_` separator.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use pyre_protocol::METHOD_SEPARATOR;
use serde::de::DeserializeOwned;
use serde_json::value::RawValue;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::codec::PeerInfo;
use crate::error::{RpcError, RpcResult};
use crate::subscription::{Notifier, Subscription};

pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Handler for a plain call: params in, JSON value (or error) out.
pub(crate) type CallFn =
    Arc<dyn Fn(CallContext, Params) -> BoxFuture<RpcResult<Value>> + Send + Sync>;

/// Handler for a subscription: must create exactly one [`Subscription`]
/// through the notifier in its context and return it.
pub(crate) type SubscribeFn =
    Arc<dyn Fn(SubscriptionContext, Params) -> BoxFuture<RpcResult<Arc<Subscription>>> + Send + Sync>;

/// Cancellable execution context handed to every call handler.
#[derive(Clone)]
pub struct CallContext {
    /// Cancelled when the call's own deadline fires or the connection closes.
    pub cancel: CancellationToken,
    /// Peer metadata, for diagnostics.
    pub peer: PeerInfo,
}

/// Execution context for subscription handlers.
#[derive(Clone)]
pub struct SubscriptionContext {
    pub cancel: CancellationToken,
    pub peer: PeerInfo,
    /// Creates the subscription and pushes events into it.
    pub notifier: Arc<Notifier>,
}

/// Raw call parameters with typed decoding.
#[derive(Debug, Clone, Default)]
pub struct Params(Option<Box<RawValue>>);

impl Params {
    pub(crate) fn new(raw: Option<Box<RawValue>>) -> Self {
        Self(raw)
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    /// Decode the params into `T`. Absent params decode as JSON `null`, so
    /// handlers taking `Option<T>` accept both. Decode failures surface as
    /// invalid-params errors.
    pub fn parse<T: DeserializeOwned>(&self) -> RpcResult<T> {
        let raw = self.0.as_deref().map(RawValue::get).unwrap_or("null");
        serde_json::from_str(raw).map_err(|e| RpcError::InvalidParams(e.to_string()))
    }

    /// Split positional params into the leading string element and the rest.
    /// Subscribe calls carry the subscription name first, handler arguments
    /// after.
    pub(crate) fn split_first(&self) -> RpcResult<(String, Params)> {
        let elements: Vec<Box<RawValue>> = self.parse()?;
        let Some((first, rest)) = elements.split_first() else {
            return Err(RpcError::InvalidParams(
                "expected subscription name as first argument".into(),
            ));
        };
        let name: String = serde_json::from_str(first.get())
            .map_err(|_| RpcError::InvalidParams("subscription name must be a string".into()))?;
        let rest = if rest.is_empty() {
            Params::new(None)
        } else {
            let raw = serde_json::value::to_raw_value(&rest)
                .map_err(|e| RpcError::Internal(e.to_string()))?;
            Params::new(Some(raw))
        };
        Ok((name, rest))
    }
}

/// Registration failures.
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("no namespace given")]
    EmptyNamespace,
    #[error("namespace {0} has no methods or subscriptions to expose")]
    NoMethods(String),
}

/// A set of handlers destined for one namespace.
#[derive(Default)]
pub struct Module {
    calls: HashMap<String, CallFn>,
    subscriptions: HashMap<String, SubscribeFn>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plain call handler. The exposed name is `name` with its first
    /// letter lowercased.
    pub fn call<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(CallContext, Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<Value>> + Send + 'static,
    {
        let f: CallFn = Arc::new(move |cx, params| Box::pin(f(cx, params)));
        self.calls.insert(expose_name(name), f);
        self
    }

    /// Add a subscription handler.
    pub fn subscription<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(SubscriptionContext, Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<Arc<Subscription>>> + Send + 'static,
    {
        let f: SubscribeFn = Arc::new(move |cx, params| Box::pin(f(cx, params)));
        self.subscriptions.insert(expose_name(name), f);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty() && self.subscriptions.is_empty()
    }
}

#[derive(Default)]
struct Service {
    calls: HashMap<String, CallFn>,
    subscriptions: HashMap<String, SubscribeFn>,
}

/// Maps `namespace_method` wire names to handlers. Shared by every
/// connection of a server or client; guarded by a mutex, mutated only
/// through registration.
#[derive(Default)]
pub struct Registry {
    services: Mutex<HashMap<String, Service>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module under a namespace. Re-registering merges into the
    /// existing sets: methods are added or replaced individually, never
    /// dropped wholesale.
    pub fn register_name(&self, namespace: &str, module: Module) -> Result<(), RegisterError> {
        if namespace.is_empty() {
            return Err(RegisterError::EmptyNamespace);
        }
        if module.is_empty() {
            return Err(RegisterError::NoMethods(namespace.to_string()));
        }
        let mut services = self.services.lock().expect("registry lock poisoned");
        let svc = services.entry(namespace.to_string()).or_default();
        svc.calls.extend(module.calls);
        svc.subscriptions.extend(module.subscriptions);
        Ok(())
    }

    /// Resolve a wire method name (`namespace_method`) to its call handler.
    pub(crate) fn call_callback(&self, method: &str) -> Option<CallFn> {
        let (namespace, name) = method.split_once(METHOD_SEPARATOR)?;
        let services = self.services.lock().expect("registry lock poisoned");
        services.get(namespace)?.calls.get(name).cloned()
    }

    /// Resolve a subscription handler within a namespace.
    pub(crate) fn subscription_callback(&self, namespace: &str, name: &str) -> Option<SubscribeFn> {
        let services = self.services.lock().expect("registry lock poisoned");
        services.get(namespace)?.subscriptions.get(name).cloned()
    }

    /// Active namespaces, sorted.
    pub fn namespaces(&self) -> Vec<String> {
        let services = self.services.lock().expect("registry lock poisoned");
        let mut names: Vec<String> = services.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Lowercase the first letter of an identifier for its exposed name.
fn expose_name(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_with_ping() -> Module {
        Module::new().call("Ping", |_cx, _params| async { Ok(Value::from("pong")) })
    }

    #[test]
    fn register_requires_namespace_and_methods() {
        let reg = Registry::new();
        assert!(matches!(
            reg.register_name("", module_with_ping()),
            Err(RegisterError::EmptyNamespace)
        ));
        assert!(matches!(
            reg.register_name("svc", Module::new()),
            Err(RegisterError::NoMethods(_))
        ));
        reg.register_name("svc", module_with_ping()).unwrap();
    }

    #[test]
    fn exposed_names_are_first_letter_lowercased() {
        let reg = Registry::new();
        reg.register_name("svc", module_with_ping()).unwrap();
        assert!(reg.call_callback("svc_ping").is_some());
        assert!(reg.call_callback("svc_Ping").is_none());
    }

    #[test]
    fn lookup_splits_on_first_separator_only() {
        let reg = Registry::new();
        let module = Module::new().call("get_block", |_cx, _p| async { Ok(Value::Null) });
        reg.register_name("chain", module).unwrap();
        assert!(reg.call_callback("chain_get_block").is_some());
        assert!(reg.call_callback("chain").is_none());
        assert!(reg.call_callback("other_get_block").is_none());
    }

    #[test]
    fn reregistration_merges() {
        let reg = Registry::new();
        reg.register_name("svc", module_with_ping()).unwrap();
        let more = Module::new().call("Echo", |_cx, p: Params| async move {
            p.parse::<Value>()
        });
        reg.register_name("svc", more).unwrap();
        assert!(reg.call_callback("svc_ping").is_some());
        assert!(reg.call_callback("svc_echo").is_some());
        assert_eq!(reg.namespaces(), vec!["svc".to_string()]);
    }

    #[test]
    fn params_parse_reports_invalid_params() {
        let raw = serde_json::value::to_raw_value(&serde_json::json!([1, "two"])).unwrap();
        let params = Params::new(Some(raw));
        let ok: (u64, String) = params.parse().unwrap();
        assert_eq!(ok, (1, "two".to_string()));
        let err = params.parse::<(String, String)>().unwrap_err();
        assert!(matches!(err, RpcError::InvalidParams(_)));
    }

    #[test]
    fn params_split_first_extracts_subscription_name() {
        let raw =
            serde_json::value::to_raw_value(&serde_json::json!(["newHeads", {"depth": 3}])).unwrap();
        let (name, rest) = Params::new(Some(raw)).split_first().unwrap();
        assert_eq!(name, "newHeads");
        let rest: Vec<Value> = rest.parse().unwrap();
        assert_eq!(rest[0]["depth"], 3);

        let raw = serde_json::value::to_raw_value(&serde_json::json!(["newHeads"])).unwrap();
        let (_, rest) = Params::new(Some(raw)).split_first().unwrap();
        assert!(rest.is_none());

        let raw = serde_json::value::to_raw_value(&serde_json::json!([])).unwrap();
        assert!(Params::new(Some(raw)).split_first().is_err());
    }

    #[test]
    fn absent_params_decode_as_null() {
        let params = Params::new(None);
        assert!(params.is_none());
        let v: Option<Vec<u64>> = params.parse().unwrap();
        assert!(v.is_none());
    }
}

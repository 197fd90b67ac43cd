//! RPC server: shared registry plus per-connection serving.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use crate::codec::Codec;
use crate::error::{RpcError, RpcResult};
use crate::handler::Handler;
use crate::registry::{Module, RegisterError, Registry};
use crate::subscription::IdGenerator;

/// Deadline for all calls of one batch; entries still running when it fires
/// answer with a timeout error.
const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub batch_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            batch_timeout: Some(DEFAULT_BATCH_TIMEOUT),
        }
    }
}

/// Accepts codecs and serves them against a shared method registry.
///
/// The server is transport-agnostic: whoever owns the listener hands each
/// accepted connection in as a [`Codec`] via [`serve_codec`](Server::serve_codec).
pub struct Server {
    registry: Arc<Registry>,
    idgen: Arc<IdGenerator>,
    config: ServerConfig,
    running: AtomicBool,
    codecs: StdMutex<HashMap<u64, Arc<dyn Codec>>>,
    codec_seq: AtomicU64,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        let registry = Arc::new(Registry::new());
        // Built-in metadata namespace: rpc_modules lists what is served.
        let meta = registry.clone();
        let module = Module::new().call("modules", move |_cx, _params| {
            let meta = meta.clone();
            async move {
                let modules: serde_json::Map<String, Value> = meta
                    .namespaces()
                    .into_iter()
                    .map(|ns| (ns, Value::String("1.0".into())))
                    .collect();
                Ok(Value::Object(modules))
            }
        });
        registry
            .register_name("rpc", module)
            .expect("builtin namespace registration cannot fail");
        Self {
            registry,
            idgen: Arc::new(IdGenerator::new()),
            config,
            running: AtomicBool::new(true),
            codecs: StdMutex::new(HashMap::new()),
            codec_seq: AtomicU64::new(0),
        }
    }

    /// Expose a module under a namespace.
    pub fn register_name(&self, namespace: &str, module: Module) -> Result<(), RegisterError> {
        self.registry.register_name(namespace, module)
    }

    /// Serve one connection until it ends or the server stops. Set
    /// `allow_subscriptions` to false for transports that cannot carry
    /// server pushes, e.g. one-shot request/response bridges.
    pub async fn serve_codec(&self, codec: Arc<dyn Codec>, allow_subscriptions: bool) -> RpcResult<()> {
        if !self.running.load(Ordering::Acquire) {
            codec.close();
            return Err(RpcError::Shutdown);
        }
        let key = self.codec_seq.fetch_add(1, Ordering::Relaxed);
        self.codecs
            .lock()
            .expect("codec table lock poisoned")
            .insert(key, codec.clone());
        let peer = codec.peer_info();
        debug!(transport = %peer.transport, remote = %peer.remote_addr, "serving connection");

        let handler = Handler::new(
            self.registry.clone(),
            codec.clone(),
            self.idgen.clone(),
            allow_subscriptions,
            self.config.batch_timeout,
        );
        loop {
            match codec.read_batch().await {
                Ok((msgs, is_batch)) => handler.handle_messages(msgs, is_batch).await,
                Err(_) => break,
            }
        }

        let reason = if self.running.load(Ordering::Acquire) {
            RpcError::ConnectionLost
        } else {
            RpcError::Shutdown
        };
        handler.close(reason).await;
        self.codecs
            .lock()
            .expect("codec table lock poisoned")
            .remove(&key);
        codec.close();
        debug!(remote = %peer.remote_addr, "connection closed");
        Ok(())
    }

    /// Stop accepting work and close every open connection. Idempotent.
    /// In-flight calls observe the closed connection; server-side
    /// subscriptions end with a shutdown error.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("rpc server shutting down");
            let codecs: Vec<Arc<dyn Codec>> = {
                let mut map = self.codecs.lock().expect("codec table lock poisoned");
                map.drain().map(|(_, codec)| codec).collect()
            };
            for codec in codecs {
                codec.close();
            }
        }
    }
}

//! The transport contract every connection must satisfy, plus a
//! line-delimited JSON implementation over any duplex byte stream.
//!
//! The engine never touches sockets directly: it reads decoded message
//! batches from a [`Codec`], writes messages back through it, and observes
//! connection death through its closed token. HTTP framing, TLS and friends
//! live behind this trait in other crates.

use std::time::Duration;

use async_trait::async_trait;
use pyre_protocol::{Message, DEFAULT_WRITE_TIMEOUT};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{RpcError, RpcResult};

/// Best-effort description of the remote end, for diagnostics only.
#[derive(Debug, Clone, Default)]
pub struct PeerInfo {
    /// Transport kind, e.g. `"stream"`, `"ws"`, `"http"`.
    pub transport: String,
    /// Remote address if the transport knows one.
    pub remote_addr: String,
}

/// What to write: a single message or a batch serialized as a JSON array.
#[derive(Debug, Clone, Copy)]
pub enum WirePayload<'a> {
    Single(&'a Message),
    Batch(&'a [Message]),
}

/// Abstract duplex message transport.
///
/// Implementations must be safe to use from several tasks at once: reads are
/// serialized against each other, writes are serialized against each other,
/// and reads and writes may overlap.
#[async_trait]
pub trait Codec: Send + Sync + 'static {
    /// Read the next message, or an ordered batch if the wire carried a JSON
    /// array. Returns `ConnectionLost` on clean close, `Parse` on garbage.
    async fn read_batch(&self) -> RpcResult<(Vec<Message>, bool)>;

    /// Serialize and send. `is_error` marks error responses, which only
    /// affects write-deadline policy, never content.
    async fn write(&self, payload: WirePayload<'_>, is_error: bool) -> RpcResult<()>;

    /// Close the connection. Idempotent; unblocks pending reads and writes.
    fn close(&self);

    /// Token fired exactly once when the connection is no longer usable.
    fn closed(&self) -> CancellationToken;

    /// Descriptive metadata about the peer.
    fn peer_info(&self) -> PeerInfo;
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Line-delimited JSON codec over any `AsyncRead + AsyncWrite` pair.
///
/// One message (or batch array) per line, matching the framing the daemon
/// protocol uses over local sockets. Tests drive it with `tokio::io::duplex`.
pub struct StreamCodec {
    reader: Mutex<BufReader<BoxedReader>>,
    writer: Mutex<BoxedWriter>,
    closed: CancellationToken,
    remote: String,
    write_timeout: Duration,
}

impl StreamCodec {
    /// Wrap a duplex stream.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_remote(stream, String::new())
    }

    /// Wrap a duplex stream, recording the peer address for diagnostics.
    pub fn with_remote<S>(stream: S, remote: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(BufReader::new(Box::new(r) as BoxedReader)),
            writer: Mutex::new(Box::new(w) as BoxedWriter),
            closed: CancellationToken::new(),
            remote: remote.into(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Override the default 10s write deadline.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    async fn write_line(&self, mut line: String, _is_error: bool) -> RpcResult<()> {
        line.push('\n');
        let mut w = self.writer.lock().await;
        // A write racing close() must lose, even when the stream itself is
        // still writable: re-check under the writer lock and keep the closed
        // arm ahead of the io future.
        if self.closed.is_cancelled() {
            return Err(RpcError::ConnectionLost);
        }
        let io = async {
            w.write_all(line.as_bytes()).await?;
            w.flush().await
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(RpcError::ConnectionLost),
            res = tokio::time::timeout(self.write_timeout, io) => match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    self.close();
                    Err(RpcError::Internal(format!("write failed: {e}")))
                }
                Err(_) => {
                    self.close();
                    Err(RpcError::Timeout)
                }
            },
        }
    }
}

#[async_trait]
impl Codec for StreamCodec {
    async fn read_batch(&self) -> RpcResult<(Vec<Message>, bool)> {
        let mut reader = self.reader.lock().await;
        loop {
            let mut line = String::new();
            let n = tokio::select! {
                _ = self.closed.cancelled() => return Err(RpcError::ConnectionLost),
                res = reader.read_line(&mut line) => match res {
                    Ok(n) => n,
                    Err(e) => {
                        trace!(remote = %self.remote, error = %e, "read failed");
                        self.close();
                        return Err(RpcError::ConnectionLost);
                    }
                },
            };
            if n == 0 {
                self.close();
                return Err(RpcError::ConnectionLost);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            trace!(remote = %self.remote, len = trimmed.len(), "read frame");
            if trimmed.starts_with('[') {
                let msgs: Vec<Message> = serde_json::from_str(trimmed)
                    .map_err(|e| RpcError::Parse(e.to_string()))?;
                return Ok((msgs, true));
            }
            let msg: Message =
                serde_json::from_str(trimmed).map_err(|e| RpcError::Parse(e.to_string()))?;
            return Ok((vec![msg], false));
        }
    }

    async fn write(&self, payload: WirePayload<'_>, is_error: bool) -> RpcResult<()> {
        let line = match payload {
            WirePayload::Single(msg) => serde_json::to_string(msg),
            WirePayload::Batch(msgs) => serde_json::to_string(msgs),
        }
        .map_err(|e| RpcError::Internal(format!("message serialization failed: {e}")))?;
        self.write_line(line, is_error).await
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            transport: "stream".to_string(),
            remote_addr: self.remote.clone(),
        }
    }
}

//! Child-process backend transport.
//!
//! Spawns the configured executable and speaks newline-delimited JSON-RPC
//! over its standard streams. Writes are serialized through a framed sink;
//! a background reader task demultiplexes responses to waiting callers by
//! request id. Responses with no matching request are logged and dropped.

use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex as TokioMutex, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, trace, warn};
use waygate_protocol::jsonrpc::{JsonRpcRequest, JsonRpcResponse, RequestId};

use crate::error::{GatewayError, GatewayResult};

/// Upper bound on a single JSON-RPC line, matching the front-end body limit
const MAX_LINE_LENGTH: usize = 10 * 1024 * 1024;

type BoxedReader = Pin<Box<dyn AsyncRead + Send + 'static>>;
type BoxedWriter = Pin<Box<dyn AsyncWrite + Send + 'static>>;
type PendingMap = DashMap<i64, oneshot::Sender<JsonRpcResponse>>;

/// Child-process transport for one backend connection.
///
/// Owns the writer half of the pipe pair and the reader task; the spawned
/// process itself is kept for teardown. `from_raw` allows tests to drive the
/// framing over in-memory duplex streams instead of a real process.
pub struct ChildProcessTransport {
    writer: TokioMutex<FramedWrite<BoxedWriter, LinesCodec>>,
    pending: Arc<PendingMap>,
    reader_task: tokio::task::JoinHandle<()>,
    child: TokioMutex<Option<Child>>,
}

impl std::fmt::Debug for ChildProcessTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildProcessTransport")
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl ChildProcessTransport {
    /// Spawn the configured executable with piped standard streams.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::BackendConnection` when the process cannot be
    /// spawned or its pipes were not created.
    pub fn spawn(command: &str, args: &[String]) -> GatewayResult<Self> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GatewayError::backend_connection(format!("failed to spawn '{command}': {e}"))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            GatewayError::backend_connection("child process stdin was not piped")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            GatewayError::backend_connection("child process stdout was not piped")
        })?;

        debug!(command, "child process backend spawned");
        Ok(Self::build(Box::pin(stdout), Box::pin(stdin), Some(child)))
    }

    /// Build a transport from raw async streams.
    ///
    /// `reader` is what the gateway reads responses from (the child's
    /// stdout) and `writer` is where requests go (the child's stdin).
    pub fn from_raw<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        Self::build(Box::pin(reader), Box::pin(writer), None)
    }

    fn build(reader: BoxedReader, writer: BoxedWriter, child: Option<Child>) -> Self {
        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let framed_reader = FramedRead::new(
            reader,
            LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        );
        let reader_task = tokio::spawn(Self::read_loop(framed_reader, Arc::clone(&pending)));

        Self {
            writer: TokioMutex::new(FramedWrite::new(
                writer,
                LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
            )),
            pending,
            reader_task,
            child: TokioMutex::new(child),
        }
    }

    /// Background reader: dispatch responses to waiting callers by id.
    async fn read_loop(
        mut reader: FramedRead<BoxedReader, LinesCodec>,
        pending: Arc<PendingMap>,
    ) {
        while let Some(next) = reader.next().await {
            let line = match next {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "failed to read line from child process");
                    break;
                }
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            trace!(len = line.len(), "line from child process");

            match serde_json::from_str::<JsonRpcResponse>(line) {
                Ok(response) => {
                    let Some(RequestId::Number(id)) = response.id.as_request_id().cloned()
                    else {
                        warn!("response without a numeric request id dropped");
                        continue;
                    };
                    match pending.remove(&id) {
                        Some((_, sender)) => {
                            if sender.send(response).is_err() {
                                debug!(id, "caller gone before response arrived");
                            }
                        }
                        None => {
                            warn!(id, "response without matching request dropped");
                        }
                    }
                }
                Err(_) => {
                    // Server-initiated requests and notifications are not
                    // forwarded by the gateway.
                    debug!("non-response frame from child process dropped");
                }
            }
        }

        debug!(outstanding = pending.len(), "child process reader finished");
        // Dropping the senders wakes every outstanding caller with an error.
        pending.clear();
    }

    /// Send one request and wait for its response.
    ///
    /// Dropping the returned future abandons the pending slot; the reader
    /// discards the orphaned response when it arrives.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Backend` when the process pipe is closed or
    /// the process exits before responding.
    pub async fn send_request(&self, request: &JsonRpcRequest) -> GatewayResult<JsonRpcResponse> {
        let RequestId::Number(id) = request.id else {
            return Err(GatewayError::backend(
                "child transport requires numeric request ids",
            ));
        };

        let (tx, rx) = oneshot::channel();
        // Register before writing so a fast response cannot beat the slot.
        self.pending.insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        let line = serde_json::to_string(request)?;
        {
            let mut writer = self.writer.lock().await;
            writer.send(line).await.map_err(|e| {
                GatewayError::backend_with_operation(
                    format!("failed to write to child process: {e}"),
                    request.method.clone(),
                )
            })?;
        }

        rx.await.map_err(|_| {
            GatewayError::backend_with_operation(
                "child process exited before responding",
                request.method.clone(),
            )
        })
    }

    /// Send a notification (no response expected).
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Backend` when the pipe is closed.
    pub async fn send_notification(
        &self,
        notification: &waygate_protocol::jsonrpc::JsonRpcNotification,
    ) -> GatewayResult<()> {
        let line = serde_json::to_string(notification)?;
        let mut writer = self.writer.lock().await;
        writer.send(line).await.map_err(|e| {
            GatewayError::backend(format!("failed to write to child process: {e}"))
        })
    }

    /// Terminate the child process and the reader task.
    pub async fn shutdown(&self) {
        self.reader_task.abort();
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "child process already gone");
            }
        }
        self.pending.clear();
    }
}

/// Removes the pending slot when a caller gives up (cancellation or write
/// failure). Removal after a delivered response is a no-op.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

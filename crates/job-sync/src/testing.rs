/// Scriptable transport and command API for exercising a `SyncClient`
/// without a backend.
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::{
    Credentials, EventStream, JobApi, JobId, Result, SyncError, Transport, WireEnvelope,
};

enum Scripted {
    Refuse(SyncError),
    Accept(ChannelStream),
}

/// Transport that hands out pre-scripted connections in order.
///
/// Once the script runs out every `open` is refused.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    opens: AtomicUsize,
    last_credentials: Mutex<Option<Credentials>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a refused connection attempt
    pub fn refuse(&self, error: SyncError) {
        self.script.lock().push_back(Scripted::Refuse(error));
    }

    /// Queue an accepted connection and return the server end of it
    pub fn accept(&self) -> ServerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        self.script.lock().push_back(Scripted::Accept(ChannelStream {
            rx,
            closed: closed.clone(),
        }));
        ServerHandle { tx, closed }
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn last_credentials(&self) -> Option<Credentials> {
        self.last_credentials.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, credentials: &Credentials) -> Result<Box<dyn EventStream>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        *self.last_credentials.lock() = Some(credentials.clone());

        let next = self.script.lock().pop_front();
        match next {
            Some(Scripted::Accept(stream)) => Ok(Box::new(stream)),
            Some(Scripted::Refuse(error)) => Err(error),
            None => Err(SyncError::Transport("connection refused".to_string())),
        }
    }
}

/// Server side of a scripted connection
pub struct ServerHandle {
    tx: mpsc::UnboundedSender<Result<String>>,
    closed: Arc<AtomicBool>,
}

impl ServerHandle {
    pub fn send_frame(&self, frame: impl Into<String>) {
        let _ = self.tx.send(Ok(frame.into()));
    }

    pub fn send_event(&self, event: &str, data: serde_json::Value) {
        let frame = serde_json::to_string(&WireEnvelope::new(event, data))
            .unwrap_or_default();
        self.send_frame(frame);
    }

    /// Break the connection with a transport error
    pub fn fail(&self, error: SyncError) {
        let _ = self.tx.send(Err(error));
    }

    /// End the connection cleanly from the server side
    pub fn hang_up(self) {
        drop(self.tx);
    }

    /// Whether the client closed its end
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct ChannelStream {
    rx: mpsc::UnboundedReceiver<Result<String>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl EventStream for ChannelStream {
    async fn next_frame(&mut self) -> Option<Result<String>> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.rx.recv().await
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.rx.close();
    }
}

/// Command API that accepts everything unless told otherwise
#[derive(Default)]
pub struct ScriptedApi {
    rejections: Mutex<VecDeque<SyncError>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next command fail with `error`
    pub fn reject_next(&self, error: SyncError) {
        self.rejections.lock().push_back(error);
    }

    /// Commands seen so far, e.g. `retry J1`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn answer(&self, call: String) -> Result<()> {
        self.calls.lock().push(call);
        match self.rejections.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl JobApi for ScriptedApi {
    async fn retry_job(&self, job_id: &JobId) -> Result<()> {
        self.answer(format!("retry {job_id}"))
    }

    async fn cancel_job(&self, job_id: &JobId) -> Result<()> {
        self.answer(format!("cancel {job_id}"))
    }
}

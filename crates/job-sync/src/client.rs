/// Per-session client: wires connection, dispatch, cache sync and commands
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info_span, Instrument};

use crate::{
    intake_channel, Cache, CacheSynchronizer, CommandLayer, ConnectionManager, ConnectionState,
    Credentials, EventDispatcher, GenerationGate, HttpJobApi, JobApi, JobId, NotificationSink,
    Outcome, ReconnectPolicy, Result, SessionId, SyncConfig, Transport, WebSocketTransport,
};

/// One synchronization session.
///
/// Everything that would otherwise be process-wide (connection state,
/// notification sink, cache writer) lives here, so several independent
/// sessions can coexist, e.g. in tests.
pub struct SyncClient {
    session_id: SessionId,
    connection: ConnectionManager,
    commands: CommandLayer,
    dispatch_shutdown: watch::Sender<bool>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncClient {
    /// Build a client and start its dispatcher. Requires a tokio runtime.
    pub fn new(
        cache: Arc<dyn Cache>,
        notifier: Arc<dyn NotificationSink>,
        transport: Arc<dyn Transport>,
        api: Arc<dyn JobApi>,
        policy: ReconnectPolicy,
    ) -> Self {
        let session_id = SessionId::new();
        let synchronizer = Arc::new(CacheSynchronizer::new(cache));
        let (intake_tx, intake_rx) = intake_channel();
        let gate = GenerationGate::new();

        let connection =
            ConnectionManager::new(transport, policy, session_id, intake_tx, gate.clone());
        let commands = CommandLayer::new(api, synchronizer.clone(), notifier.clone());

        let dispatcher = EventDispatcher::new(synchronizer, notifier);
        let (dispatch_shutdown, shutdown_rx) = watch::channel(false);
        let span = info_span!("dispatch", session = %session_id);
        let dispatch_task =
            tokio::spawn(dispatcher.run(intake_rx, gate, shutdown_rx).instrument(span));

        Self {
            session_id,
            connection,
            commands,
            dispatch_shutdown,
            dispatch_task: Mutex::new(Some(dispatch_task)),
        }
    }

    /// Client talking WebSocket for events and HTTP for commands
    pub fn from_config(
        config: &SyncConfig,
        cache: Arc<dyn Cache>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        config.validate()?;
        let transport = Arc::new(WebSocketTransport::new(config.ws_url.clone()));
        let api = Arc::new(HttpJobApi::new(
            config.api_base_url.clone(),
            config.credentials(),
        ));
        Ok(Self::new(cache, notifier, transport, api, config.reconnect))
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn connect(&self, credentials: Credentials) {
        self.connection.connect(credentials);
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    pub async fn retry(&self, job_id: &JobId) -> Result<Outcome> {
        self.commands.retry(job_id).await
    }

    pub async fn cancel(&self, job_id: &JobId) -> Result<Outcome> {
        self.commands.cancel(job_id).await
    }

    /// Disconnect and stop dispatching; no handler runs afterwards
    pub async fn shutdown(self) {
        self.connection.disconnect().await;

        let _ = self.dispatch_shutdown.send(true);
        let task = self.dispatch_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        debug!(session = %self.session_id, "sync client shut down");
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        let _ = self.dispatch_shutdown.send(true);
        if let Some(task) = self.dispatch_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Connection lifecycle: connect, authenticate, detect loss, reconnect
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    Credentials, EventStream, GenerationGate, Inbound, IntakeMessage, IntakeSender,
    ReconnectPolicy, SessionId, SyncError, Transport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Process-wide view of the event-stream connection for one client session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Consecutive failed or in-progress reconnect attempts; 0 once connected
    pub attempt: u32,
    pub last_error: Option<String>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            attempt: 0,
            last_error: None,
        }
    }
}

struct RunningConnection {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns the single transport connection of a client session.
///
/// Only this type opens or closes the transport. Everything it receives goes
/// onto the intake queue tagged with the current connection generation.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    session_id: SessionId,
    intake: IntakeSender,
    gate: GenerationGate,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    running: Mutex<Option<RunningConnection>>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        policy: ReconnectPolicy,
        session_id: SessionId,
        intake: IntakeSender,
        gate: GenerationGate,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::default());
        Self {
            transport,
            policy,
            session_id,
            intake,
            gate,
            state_tx: Arc::new(state_tx),
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Start connecting. A no-op while already connecting or connected.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self, credentials: Credentials) {
        let mut running = self.running.lock();
        if let Some(current) = running.as_ref() {
            if !current.task.is_finished() {
                debug!(session = %self.session_id, "connect ignored; connection already active");
                return;
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.state_tx.send_replace(ConnectionState {
            status: ConnectionStatus::Connecting,
            attempt: 0,
            last_error: None,
        });

        let task = ConnectionTask {
            transport: self.transport.clone(),
            credentials,
            policy: self.policy,
            generation: self.gate.current(),
            intake: self.intake.clone(),
            state_tx: self.state_tx.clone(),
            shutdown: shutdown_rx,
        };
        let span = info_span!("connection", session = %self.session_id);
        let task = tokio::spawn(task.run().instrument(span));

        *running = Some(RunningConnection {
            shutdown: shutdown_tx,
            task,
        });
    }

    /// Close the transport and wait until the connection task has exited.
    ///
    /// Messages already queued for this connection are never handled.
    pub async fn disconnect(&self) {
        self.gate.advance();
        let running = self.running.lock().take();

        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            if let Err(e) = running.task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "connection task ended abnormally");
                }
            }
        }

        self.state_tx.send_replace(ConnectionState::default());
        info!(session = %self.session_id, "disconnected");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.gate.advance();
        if let Some(running) = self.running.get_mut().take() {
            let _ = running.shutdown.send(true);
            // Dropping the task's stream closes the socket
            running.task.abort();
        }
    }
}

enum PumpExit {
    Shutdown,
    Lost(String),
}

struct ConnectionTask {
    transport: Arc<dyn Transport>,
    credentials: Credentials,
    policy: ReconnectPolicy,
    generation: u64,
    intake: IntakeSender,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionTask {
    async fn run(mut self) {
        let mut attempt: u32 = 0;
        let mut last_error: Option<String> = None;

        loop {
            self.publish(ConnectionStatus::Connecting, attempt, last_error.clone());

            let opened = tokio::select! {
                biased;
                _ = self.shutdown.changed() => return,
                opened = self.transport.open(&self.credentials) => opened,
            };

            match opened {
                Ok(mut stream) => {
                    attempt = 0;
                    self.publish(ConnectionStatus::Connected, 0, None);
                    info!("event stream connected");
                    if !self.forward(Inbound::Connected) {
                        stream.close().await;
                        return;
                    }

                    let exit = self.pump(stream.as_mut()).await;
                    stream.close().await;
                    let reason = match exit {
                        PumpExit::Shutdown => return,
                        PumpExit::Lost(reason) => reason,
                    };

                    let will_retry = self.policy.max_attempts > 0;
                    warn!(%reason, will_retry, "event stream lost");
                    self.forward(Inbound::Disconnected {
                        reason: reason.clone(),
                        will_retry,
                    });
                    last_error = Some(reason);

                    if !will_retry {
                        self.publish(ConnectionStatus::Disconnected, 0, last_error);
                        return;
                    }
                }
                Err(e) => {
                    if matches!(e, SyncError::Auth(_)) {
                        warn!(attempt, error = %e, "event stream authentication rejected");
                    } else {
                        warn!(attempt, error = %e, "event stream connection attempt failed");
                    }
                    let reason = e.to_string();
                    last_error = Some(reason.clone());

                    if attempt >= self.policy.max_attempts {
                        error!(attempts = attempt, "giving up on event stream; call connect to resume");
                        self.publish(ConnectionStatus::Disconnected, attempt, last_error);
                        self.forward(Inbound::Disconnected {
                            reason,
                            will_retry: false,
                        });
                        return;
                    }
                }
            }

            attempt += 1;
            let delay = self.policy.delay_for(attempt);
            self.publish(ConnectionStatus::Connecting, attempt, last_error.clone());
            debug!(attempt, ?delay, "reconnecting after delay");

            tokio::select! {
                biased;
                _ = self.shutdown.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Forward frames until the stream ends or shutdown is requested
    async fn pump(&mut self, stream: &mut dyn EventStream) -> PumpExit {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.shutdown.changed() => return PumpExit::Shutdown,
                frame = stream.next_frame() => frame,
            };

            match frame {
                Some(Ok(text)) => {
                    if !self.forward(Inbound::Frame(text)) {
                        return PumpExit::Shutdown;
                    }
                }
                Some(Err(SyncError::Protocol(message))) => {
                    warn!(error = %message, "dropping undecodable frame");
                }
                Some(Err(e)) => return PumpExit::Lost(e.to_string()),
                None => return PumpExit::Lost("connection closed by server".to_string()),
            }
        }
    }

    /// Returns false once the dispatcher is gone
    fn forward(&self, inbound: Inbound) -> bool {
        self.intake
            .send(IntakeMessage {
                generation: self.generation,
                inbound,
            })
            .is_ok()
    }

    fn publish(&self, status: ConnectionStatus, attempt: u32, last_error: Option<String>) {
        self.state_tx.send_replace(ConnectionState {
            status,
            attempt,
            last_error,
        });
    }
}

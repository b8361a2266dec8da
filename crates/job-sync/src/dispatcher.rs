/// Ordered intake queue and typed event dispatch.
///
/// The connection manager is the only producer; one dispatcher task consumes
/// messages strictly in arrival order, so no two handlers ever run at once.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::{
    decode_frame, deliver, notification_for, CacheSynchronizer, IgnoreReason, NotificationSink,
    Outcome, SyncEvent,
};

/// Raw input produced by the connection manager
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Connected,
    Disconnected { reason: String, will_retry: bool },
    Frame(String),
}

/// Inbound message tagged with the connection generation it belongs to
#[derive(Debug, Clone)]
pub struct IntakeMessage {
    pub generation: u64,
    pub inbound: Inbound,
}

pub type IntakeSender = mpsc::UnboundedSender<IntakeMessage>;
pub type IntakeReceiver = mpsc::UnboundedReceiver<IntakeMessage>;

pub fn intake_channel() -> (IntakeSender, IntakeReceiver) {
    mpsc::unbounded_channel()
}

/// Shared counter of connection generations.
///
/// Advancing it on teardown makes every message still queued for the old
/// connection stale, so nothing is handled after a disconnect begins.
#[derive(Debug, Clone, Default)]
pub struct GenerationGate(Arc<AtomicU64>);

impl GenerationGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.current() == generation
    }
}

pub struct EventDispatcher {
    synchronizer: Arc<CacheSynchronizer>,
    notifier: Arc<dyn NotificationSink>,
}

impl EventDispatcher {
    pub fn new(synchronizer: Arc<CacheSynchronizer>, notifier: Arc<dyn NotificationSink>) -> Self {
        Self {
            synchronizer,
            notifier,
        }
    }

    /// Decode and handle one inbound message.
    ///
    /// Returns `None` when the message was dropped before reaching a handler
    /// (unknown or malformed frames).
    pub fn dispatch(&self, inbound: Inbound) -> Option<Outcome> {
        let event = match inbound {
            Inbound::Connected => SyncEvent::Connected,
            Inbound::Disconnected { reason, will_retry } => {
                SyncEvent::Disconnected { reason, will_retry }
            }
            Inbound::Frame(text) => match decode_frame(&text) {
                Ok(Some(event)) => event,
                Ok(None) => return None,
                Err(e) => {
                    warn!(error = %e, "dropping malformed frame");
                    return None;
                }
            },
        };

        Some(self.handle(&event))
    }

    /// Apply the cache effect first, then surface it to the user
    pub fn handle(&self, event: &SyncEvent) -> Outcome {
        let outcome = self.synchronizer.apply(event);
        trace!(event = event.name(), job_id = ?event.job_id(), ?outcome, "event handled");

        if should_notify(&outcome) {
            if let Some(notification) = notification_for(event) {
                deliver(self.notifier.as_ref(), notification);
            }
        }

        outcome
    }

    /// Consume the intake queue until shutdown or until every producer is gone
    pub async fn run(
        self,
        mut intake: IntakeReceiver,
        gate: GenerationGate,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                message = intake.recv() => {
                    let Some(message) = message else { break };
                    if *shutdown.borrow() {
                        break;
                    }
                    if !gate.is_current(message.generation) {
                        trace!(generation = message.generation, "dropping message from closed connection");
                        continue;
                    }
                    self.dispatch(message.inbound);
                }
            }
        }

        debug!("event dispatcher stopped");
    }
}

/// State errors, including terminal events for untracked jobs, are benign
/// races and stay invisible to the user
fn should_notify(outcome: &Outcome) -> bool {
    matches!(
        outcome,
        Outcome::Applied | Outcome::Ignored(IgnoreReason::NoCacheEffect)
    )
}

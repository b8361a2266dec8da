/// User-facing status notifications derived from events
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::{JobId, SyncEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationLevel {
    Info,
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
    pub job_id: Option<JobId>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Notification {
    pub fn new(level: NotificationLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            job_id: None,
            created_at: chrono::Utc::now(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Info, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Success, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Error, message)
    }

    pub fn for_job(mut self, job_id: &JobId) -> Self {
        self.job_id = Some(job_id.clone());
        self
    }
}

/// Project an event onto the message a user should see, if any
pub fn notification_for(event: &SyncEvent) -> Option<Notification> {
    let notification = match event {
        SyncEvent::Connected => Notification::info("Connected to live updates"),
        SyncEvent::Disconnected { reason, will_retry } => {
            if *will_retry {
                Notification::info(format!("Live updates interrupted ({reason}); reconnecting"))
            } else {
                Notification::info(format!("Live updates disconnected: {reason}"))
            }
        }
        SyncEvent::JobStarted(e) => {
            let message = match &e.message {
                Some(message) => format!("Processing video {}: {}", e.video_id, message),
                None => format!("Processing started for video {}", e.video_id),
            };
            Notification::info(message).for_job(&e.job_id)
        }
        SyncEvent::JobProgress(_) => return None,
        SyncEvent::JobCompleted(e) => {
            Notification::success(format!("Video {} processed successfully", e.video_id))
                .for_job(&e.job_id)
        }
        SyncEvent::JobFailed(e) => {
            Notification::error(format!("Job {} failed: {}", e.job_id, e.error)).for_job(&e.job_id)
        }
    };

    Some(notification)
}

/// Displays notifications. Implementations must not block.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Hand a notification to a sink; a panicking sink is logged and swallowed.
pub fn deliver(sink: &dyn NotificationSink, notification: Notification) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| sink.notify(notification)));
    if result.is_err() {
        error!("notification sink panicked; notification dropped");
    }
}

/// Writes notifications to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, notification: Notification) {
        let job_id = notification.job_id.as_ref().map(JobId::as_str);
        match notification.level {
            NotificationLevel::Error => warn!(?job_id, "{}", notification.message),
            NotificationLevel::Info | NotificationLevel::Success => {
                info!(?job_id, "{}", notification.message)
            }
        }
    }
}

/// Forwards notifications to a UI task over an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, notification: Notification) {
        // A closed receiver means nobody is displaying anymore
        let _ = self.tx.send(notification);
    }
}

/// Delivers to several sinks; one failing sink does not starve the others
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl NotificationSink for FanoutSink {
    fn notify(&self, notification: Notification) {
        for sink in &self.sinks {
            deliver(sink.as_ref(), notification.clone());
        }
    }
}

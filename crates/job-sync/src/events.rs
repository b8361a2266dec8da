/// Event-stream protocol: named events with JSON bodies
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::{JobId, JobStatus, Result, SyncError, VideoId};

pub const EVENT_CONNECTED: &str = "connected";
pub const EVENT_DISCONNECTED: &str = "disconnected";
pub const EVENT_JOB_STARTED: &str = "job:started";
pub const EVENT_JOB_PROGRESS: &str = "job:progress";
pub const EVENT_JOB_COMPLETED: &str = "job:completed";
pub const EVENT_JOB_FAILED: &str = "job:failed";

/// Frame layout on the wire: `{"event": "job:progress", "data": {...}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub event: String,

    #[serde(default)]
    pub data: serde_json::Value,
}

impl WireEnvelope {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStarted {
    pub job_id: JobId,
    pub video_id: VideoId,

    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub job_id: JobId,

    #[serde(deserialize_with = "deserialize_percent")]
    pub progress: u8,

    #[serde(default)]
    pub status: Option<JobStatus>,

    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCompleted {
    pub job_id: JobId,
    pub video_id: VideoId,

    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFailed {
    pub job_id: JobId,
    pub error: String,
}

/// Closed set of events the dispatcher routes
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected { reason: String, will_retry: bool },
    JobStarted(JobStarted),
    JobProgress(JobProgress),
    JobCompleted(JobCompleted),
    JobFailed(JobFailed),
}

impl SyncEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::Connected => EVENT_CONNECTED,
            SyncEvent::Disconnected { .. } => EVENT_DISCONNECTED,
            SyncEvent::JobStarted(_) => EVENT_JOB_STARTED,
            SyncEvent::JobProgress(_) => EVENT_JOB_PROGRESS,
            SyncEvent::JobCompleted(_) => EVENT_JOB_COMPLETED,
            SyncEvent::JobFailed(_) => EVENT_JOB_FAILED,
        }
    }

    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            SyncEvent::JobStarted(e) => Some(&e.job_id),
            SyncEvent::JobProgress(e) => Some(&e.job_id),
            SyncEvent::JobCompleted(e) => Some(&e.job_id),
            SyncEvent::JobFailed(e) => Some(&e.job_id),
            SyncEvent::Connected | SyncEvent::Disconnected { .. } => None,
        }
    }
}

/// Decode one text frame.
///
/// Returns `Ok(None)` for events this client does not handle (unknown names,
/// and lifecycle names, which only the connection manager may produce).
/// Malformed frames are `SyncError::Protocol`.
pub fn decode_frame(text: &str) -> Result<Option<SyncEvent>> {
    let envelope: WireEnvelope = serde_json::from_str(text)?;

    let event = match envelope.event.as_str() {
        EVENT_JOB_STARTED => SyncEvent::JobStarted(decode_body(&envelope)?),
        EVENT_JOB_PROGRESS => SyncEvent::JobProgress(decode_body(&envelope)?),
        EVENT_JOB_COMPLETED => SyncEvent::JobCompleted(decode_body(&envelope)?),
        EVENT_JOB_FAILED => SyncEvent::JobFailed(decode_body(&envelope)?),
        EVENT_CONNECTED | EVENT_DISCONNECTED => {
            debug!(event = %envelope.event, "ignoring lifecycle event sent by server");
            return Ok(None);
        }
        other => {
            debug!(event = %other, "ignoring unknown event");
            return Ok(None);
        }
    };

    Ok(Some(event))
}

fn decode_body<T: serde::de::DeserializeOwned>(envelope: &WireEnvelope) -> Result<T> {
    T::deserialize(&envelope.data)
        .map_err(|e| SyncError::Protocol(format!("invalid {} body: {}", envelope.event, e)))
}

/// The pipeline reports whole or fractional percentages; anything outside
/// 0-100 is malformed.
fn deserialize_percent<'de, D>(deserializer: D) -> std::result::Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if !(0.0..=100.0).contains(&value) {
        return Err(serde::de::Error::custom(format!(
            "progress {value} outside 0-100"
        )));
    }
    Ok(value.round() as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(event: &str, data: serde_json::Value) -> String {
        WireEnvelope::new(event, data).to_frame().unwrap()
    }

    #[test]
    fn test_decode_started() {
        let text = frame(EVENT_JOB_STARTED, json!({"jobId": "J1", "videoId": "V1"}));
        let event = decode_frame(&text).unwrap().unwrap();

        assert_eq!(
            event,
            SyncEvent::JobStarted(JobStarted {
                job_id: JobId::new("J1"),
                video_id: VideoId::new("V1"),
                message: None,
            })
        );
        assert_eq!(event.name(), "job:started");
        assert_eq!(event.job_id(), Some(&JobId::new("J1")));
    }

    #[test]
    fn test_decode_progress_with_status_and_fraction() {
        let text = frame(
            EVENT_JOB_PROGRESS,
            json!({"jobId": "J1", "progress": 42.6, "status": "processing", "message": "Generating notes"}),
        );

        match decode_frame(&text).unwrap() {
            Some(SyncEvent::JobProgress(p)) => {
                assert_eq!(p.progress, 43);
                assert_eq!(p.status, Some(JobStatus::Processing));
                assert_eq!(p.message.as_deref(), Some("Generating notes"));
            }
            other => panic!("expected progress event, got {:?}", other),
        }
    }

    #[test]
    fn test_progress_out_of_range_is_protocol_error() {
        for progress in [json!(101), json!(-1), json!("ten")] {
            let text = frame(EVENT_JOB_PROGRESS, json!({"jobId": "J1", "progress": progress}));
            let err = decode_frame(&text).unwrap_err();
            assert!(matches!(err, SyncError::Protocol(_)), "got {err:?}");
        }
    }

    #[test]
    fn test_decode_completed_and_failed() {
        let text = frame(
            EVENT_JOB_COMPLETED,
            json!({"jobId": "J1", "videoId": "V1", "result": {"noteId": "N1"}}),
        );
        match decode_frame(&text).unwrap() {
            Some(SyncEvent::JobCompleted(c)) => {
                assert_eq!(c.result, Some(json!({"noteId": "N1"})));
            }
            other => panic!("expected completed event, got {:?}", other),
        }

        let text = frame(EVENT_JOB_FAILED, json!({"jobId": "J1", "error": "transcription timeout"}));
        match decode_frame(&text).unwrap() {
            Some(SyncEvent::JobFailed(f)) => assert_eq!(f.error, "transcription timeout"),
            other => panic!("expected failed event, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_and_lifecycle_events_are_ignored() {
        assert_eq!(decode_frame(&frame("job:paused", json!({"jobId": "J1"}))).unwrap(), None);
        assert_eq!(decode_frame(&frame(EVENT_CONNECTED, json!({}))).unwrap(), None);
        assert_eq!(decode_frame(&frame(EVENT_DISCONNECTED, json!(null))).unwrap(), None);
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(decode_frame("not json"), Err(SyncError::Protocol(_))));
        assert!(matches!(decode_frame("{\"data\": {}}"), Err(SyncError::Protocol(_))));

        let missing_video = frame(EVENT_JOB_STARTED, json!({"jobId": "J1"}));
        assert!(matches!(decode_frame(&missing_video), Err(SyncError::Protocol(_))));
    }
}

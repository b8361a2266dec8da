/// Job lifecycle: valid states and legal transitions
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::{JobId, VideoId};

/// Status of a background processing job as modelled by the backend.
///
/// Cancellation is not a status: a cancelled job is removed from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[serde(alias = "QUEUED")]
    Queued,

    #[serde(alias = "PROCESSING")]
    Processing,

    #[serde(alias = "COMPLETED")]
    Completed,

    #[serde(alias = "FAILED")]
    Failed,
}

impl JobStatus {
    /// Completed and failed jobs accept no further transitions
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the backend lifecycle allows moving from `from` to `to`.
///
/// `QUEUED -> PROCESSING -> {COMPLETED, FAILED}` plus `QUEUED -> FAILED`
/// for pre-flight failures. Re-entering the same active state is allowed so
/// duplicate deliveries stay idempotent.
pub fn is_valid_transition(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;

    match (from, to) {
        (Queued, Queued) | (Processing, Processing) => true,
        (Queued, Processing) | (Queued, Failed) => true,
        (Processing, Completed) | (Processing, Failed) => true,
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal job transition {from} -> {to}")]
pub struct TransitionRejected {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Cached view of one asynchronous processing task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub video_id: VideoId,
    pub status: JobStatus,

    /// Percentage 0-100
    pub progress: u8,

    /// Set only while `status` is FAILED
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Set only while `status` is COMPLETED
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    /// Latest stage text reported by the pipeline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

impl Job {
    pub fn new(id: JobId, video_id: VideoId) -> Self {
        Self {
            id,
            video_id,
            status: JobStatus::Queued,
            progress: 0,
            error: None,
            result: None,
            status_message: None,
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }

    /// Move to `to` if the lifecycle allows it, keeping the error/result
    /// fields consistent with the new status.
    pub fn transition(&mut self, to: JobStatus) -> Result<(), TransitionRejected> {
        if !is_valid_transition(self.status, to) {
            return Err(TransitionRejected {
                from: self.status,
                to,
            });
        }

        self.status = to;
        if to != JobStatus::Failed {
            self.error = None;
        }
        if to != JobStatus::Completed {
            self.result = None;
        }
        Ok(())
    }

    /// Reset a failed job back to QUEUED after the backend accepted a retry.
    ///
    /// This is a client-side restart, not a lifecycle transition; it returns
    /// false and leaves the job untouched unless the job is FAILED.
    pub fn restart(&mut self) -> bool {
        if self.status != JobStatus::Failed {
            return false;
        }

        self.status = JobStatus::Queued;
        self.progress = 0;
        self.error = None;
        self.result = None;
        self.status_message = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use JobStatus::*;

    const ALL: [JobStatus; 4] = [Queued, Processing, Completed, Failed];

    fn job() -> Job {
        Job::new(JobId::new("J1"), VideoId::new("V1"))
    }

    #[test]
    fn test_valid_sequences_are_accepted() {
        let sequences: &[&[JobStatus]] = &[
            &[Queued, Processing, Completed],
            &[Queued, Processing, Failed],
            &[Queued, Failed],
            &[Queued, Processing, Processing, Completed],
        ];

        for sequence in sequences {
            for pair in sequence.windows(2) {
                assert!(
                    is_valid_transition(pair[0], pair[1]),
                    "{:?} -> {:?} should be valid",
                    pair[0],
                    pair[1]
                );
            }
        }
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let invalid = [
            (Completed, Queued),
            (Completed, Processing),
            (Failed, Processing),
            (Failed, Queued),
            (Processing, Queued),
            (Queued, Completed),
        ];

        for (from, to) in invalid {
            assert!(!is_valid_transition(from, to), "{from} -> {to} should be invalid");
        }
    }

    #[test]
    fn test_terminal_states_accept_nothing() {
        for from in [Completed, Failed] {
            for to in ALL {
                assert!(!is_valid_transition(from, to));
            }
        }
    }

    #[test]
    fn test_transition_clears_stale_fields() {
        let mut job = job();
        job.error = Some("old".to_string());
        job.transition(Processing).unwrap();
        assert_eq!(job.error, None);

        let err = job.transition(Queued).unwrap_err();
        assert_eq!(err, TransitionRejected { from: Processing, to: Queued });
        assert_eq!(job.status, Processing);
    }

    #[test]
    fn test_restart_only_from_failed() {
        let mut job = job().with_status(Processing);
        assert!(!job.restart());
        assert_eq!(job.status, Processing);

        job.transition(Failed).unwrap();
        job.error = Some("transcription timeout".to_string());
        job.progress = 40;
        assert!(job.restart());
        assert_eq!(job.status, Queued);
        assert_eq!(job.progress, 0);
        assert_eq!(job.error, None);
    }

    #[test]
    fn test_status_wire_names() {
        let parsed: JobStatus = serde_json::from_str("\"processing\"").unwrap();
        assert_eq!(parsed, Processing);
        let parsed: JobStatus = serde_json::from_str("\"FAILED\"").unwrap();
        assert_eq!(parsed, Failed);
        assert_eq!(serde_json::to_string(&Completed).unwrap(), "\"completed\"");
    }
}

/// Applies job events and command results to the shared read cache.
///
/// Every mutation, whether driven by the event stream or by a user command,
/// runs under one lock so a command's write and an event for the same job
/// can never interleave.
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

use crate::{
    Cache, CacheKey, CacheValue, Job, JobCompleted, JobFailed, JobId, JobProgress, JobStarted,
    JobStatus, SyncEvent, TransitionRejected,
};

/// Cancelled ids remembered to stop late events from resurrecting them
const TOMBSTONE_CAPACITY: usize = 256;

/// What the synchronizer did with an event or command result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Ignored(IgnoreReason),
    Rejected(TransitionRejected),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The event refers to a job the cache does not track
    UntrackedJob,
    /// The job already reached a terminal state
    TerminalJob,
    /// The user cancelled this job
    Cancelled,
    /// Same terminal event delivered again
    Duplicate,
    /// Retry accepted but the job is no longer FAILED
    NotRetryable,
    /// Another job for the same video is already queued or processing
    VideoBusy,
    /// Lifecycle events that leave the cache alone
    NoCacheEffect,
}

impl Outcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied)
    }
}

#[derive(Debug, Default)]
struct SyncState {
    pending_retries: HashSet<JobId>,
    tombstones: HashSet<JobId>,
    tombstone_order: VecDeque<JobId>,
}

impl SyncState {
    fn is_cancelled(&self, id: &JobId) -> bool {
        self.tombstones.contains(id)
    }

    fn bury(&mut self, id: JobId) {
        if !self.tombstones.insert(id.clone()) {
            return;
        }
        self.tombstone_order.push_back(id);
        while self.tombstone_order.len() > TOMBSTONE_CAPACITY {
            if let Some(oldest) = self.tombstone_order.pop_front() {
                self.tombstones.remove(&oldest);
            }
        }
    }
}

pub struct CacheSynchronizer {
    cache: Arc<dyn Cache>,
    state: Mutex<SyncState>,
}

impl CacheSynchronizer {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self {
            cache,
            state: Mutex::new(SyncState::default()),
        }
    }

    /// Apply one decoded event
    pub fn apply(&self, event: &SyncEvent) -> Outcome {
        match event {
            SyncEvent::Connected => {
                self.resync();
                Outcome::Applied
            }
            // Stale data may stay on screen while disconnected
            SyncEvent::Disconnected { .. } => Outcome::Ignored(IgnoreReason::NoCacheEffect),
            SyncEvent::JobStarted(e) => self.on_started(e),
            SyncEvent::JobProgress(e) => self.on_progress(e),
            SyncEvent::JobCompleted(e) => self.on_completed(e),
            SyncEvent::JobFailed(e) => self.on_failed(e),
        }
    }

    /// Mark every list and every cached job stale after a (re)connect.
    ///
    /// Missed events are never replayed, so this is the only way back to a
    /// consistent view. Returns the number of keys invalidated.
    pub fn resync(&self) -> usize {
        let _state = self.state.lock();

        let mut keys: Vec<CacheKey> = CacheKey::LISTS.to_vec();
        keys.extend(
            self.cache
                .keys()
                .into_iter()
                .filter(|key| matches!(key, CacheKey::Job(_))),
        );

        for key in &keys {
            self.cache.invalidate(key);
        }

        info!(keys = keys.len(), "resynchronized cache after connect");
        keys.len()
    }

    fn on_started(&self, event: &JobStarted) -> Outcome {
        let state = self.state.lock();
        if state.is_cancelled(&event.job_id) {
            debug!(job_id = %event.job_id, "ignoring start of cancelled job");
            return Outcome::Ignored(IgnoreReason::Cancelled);
        }

        let key = CacheKey::Job(event.job_id.clone());
        let job = match self.read_job(&event.job_id) {
            Some(mut job) => {
                // A retry is in flight: the server restarting the job wins
                // over the optimistic write still waiting for its response.
                if job.status == JobStatus::Failed && state.pending_retries.contains(&job.id) {
                    job.restart();
                }
                if let Err(rejected) = job.transition(JobStatus::Processing) {
                    return self.reject(&key, rejected);
                }
                job.video_id = event.video_id.clone();
                if event.message.is_some() {
                    job.status_message = event.message.clone();
                }
                job
            }
            None => {
                let mut job = Job::new(event.job_id.clone(), event.video_id.clone())
                    .with_status(JobStatus::Processing);
                job.status_message = event.message.clone();
                job
            }
        };

        self.evict_other_active(&job);
        self.cache.write(key, CacheValue::Job(job));
        self.cache.invalidate(&CacheKey::JobList);
        self.cache.invalidate(&CacheKey::VideoList);
        Outcome::Applied
    }

    fn on_progress(&self, event: &JobProgress) -> Outcome {
        let state = self.state.lock();
        if state.is_cancelled(&event.job_id) {
            return Outcome::Ignored(IgnoreReason::Cancelled);
        }

        let key = CacheKey::Job(event.job_id.clone());
        let Some(mut job) = self.read_job(&event.job_id) else {
            // Fetch it fresh rather than fabricate an entry without a video
            self.cache.invalidate(&CacheKey::JobList);
            return Outcome::Ignored(IgnoreReason::UntrackedJob);
        };

        if job.status.is_terminal() {
            debug!(job_id = %job.id, status = %job.status, "dropping progress for finished job");
            return Outcome::Ignored(IgnoreReason::TerminalJob);
        }

        // Progress on a queued job means the pipeline picked it up
        let target = match event.status {
            Some(status) => status,
            None if job.status == JobStatus::Queued => JobStatus::Processing,
            None => job.status,
        };
        if let Err(rejected) = job.transition(target) {
            return self.reject(&key, rejected);
        }

        if event.progress < job.progress {
            // No sequence numbers on the wire: arrival order wins
            debug!(
                job_id = %job.id,
                from = job.progress,
                to = event.progress,
                "progress went backwards; applying in arrival order"
            );
        }
        job.progress = event.progress;
        if event.message.is_some() {
            job.status_message = event.message.clone();
        }

        self.cache.write(key.clone(), CacheValue::Job(job.clone()));
        match job.status {
            JobStatus::Completed => self.invalidate_for_completion(&job),
            JobStatus::Failed => self.cache.invalidate(&key),
            JobStatus::Queued | JobStatus::Processing => {}
        }
        self.cache.invalidate(&CacheKey::JobList);
        Outcome::Applied
    }

    fn on_completed(&self, event: &JobCompleted) -> Outcome {
        let state = self.state.lock();
        if state.is_cancelled(&event.job_id) {
            debug!(job_id = %event.job_id, "ignoring completion of cancelled job");
            return Outcome::Ignored(IgnoreReason::Cancelled);
        }

        let key = CacheKey::Job(event.job_id.clone());
        let Some(mut job) = self.read_job(&event.job_id) else {
            debug!(job_id = %event.job_id, "completion for untracked job; refreshing lists only");
            self.cache.invalidate(&CacheKey::JobList);
            self.cache.invalidate(&CacheKey::VideoList);
            return Outcome::Ignored(IgnoreReason::UntrackedJob);
        };

        if job.status == JobStatus::Completed {
            return Outcome::Ignored(IgnoreReason::Duplicate);
        }
        if let Err(rejected) = job.transition(JobStatus::Completed) {
            return self.reject(&key, rejected);
        }

        job.video_id = event.video_id.clone();
        job.progress = 100;
        job.result = event.result.clone();

        self.cache.write(key, CacheValue::Job(job.clone()));
        self.invalidate_for_completion(&job);
        self.cache.invalidate(&CacheKey::JobList);
        Outcome::Applied
    }

    fn on_failed(&self, event: &JobFailed) -> Outcome {
        let state = self.state.lock();
        if state.is_cancelled(&event.job_id) {
            return Outcome::Ignored(IgnoreReason::Cancelled);
        }

        let key = CacheKey::Job(event.job_id.clone());
        let Some(mut job) = self.read_job(&event.job_id) else {
            self.cache.invalidate(&CacheKey::JobList);
            return Outcome::Ignored(IgnoreReason::UntrackedJob);
        };

        if job.status == JobStatus::Failed {
            return Outcome::Ignored(IgnoreReason::Duplicate);
        }
        if let Err(rejected) = job.transition(JobStatus::Failed) {
            return self.reject(&key, rejected);
        }
        job.error = Some(event.error.clone());

        self.cache.write(key.clone(), CacheValue::Job(job));
        self.cache.invalidate(&CacheKey::JobList);
        self.cache.invalidate(&key);
        Outcome::Applied
    }

    /// Note that a retry request for `id` is about to be sent
    pub fn begin_retry(&self, id: &JobId) {
        self.state.lock().pending_retries.insert(id.clone());
    }

    /// The backend accepted a retry: requeue the job if it is still FAILED
    pub fn retry_accepted(&self, id: &JobId) -> Outcome {
        let mut state = self.state.lock();
        state.pending_retries.remove(id);

        let outcome = match self.read_job(id) {
            Some(job) if job.status != JobStatus::Failed => {
                debug!(job_id = %id, status = %job.status, "retry accepted for non-failed job; leaving cache");
                Outcome::Ignored(IgnoreReason::NotRetryable)
            }
            Some(job) if self.has_active_sibling(&job) => {
                // The sibling's state came from the server; refetch this one
                debug!(job_id = %id, video_id = %job.video_id, "video already has an active job; not requeueing");
                self.cache.invalidate(&CacheKey::Job(id.clone()));
                Outcome::Ignored(IgnoreReason::VideoBusy)
            }
            Some(mut job) => {
                job.restart();
                self.cache.write(CacheKey::Job(id.clone()), CacheValue::Job(job));
                Outcome::Applied
            }
            None => Outcome::Ignored(IgnoreReason::UntrackedJob),
        };

        // Reconcile with server truth on next read either way
        self.cache.invalidate(&CacheKey::JobList);
        outcome
    }

    /// The backend rejected a retry; nothing was written optimistically
    pub fn retry_rejected(&self, id: &JobId) {
        self.state.lock().pending_retries.remove(id);
    }

    /// The backend accepted a cancel: drop the job and forget it for good
    pub fn cancel_accepted(&self, id: &JobId) -> Outcome {
        let mut state = self.state.lock();
        state.pending_retries.remove(id);
        state.bury(id.clone());

        self.cache.remove(&CacheKey::Job(id.clone()));
        self.cache.invalidate(&CacheKey::JobList);
        self.cache.invalidate(&CacheKey::VideoList);
        Outcome::Applied
    }

    fn read_job(&self, id: &JobId) -> Option<Job> {
        self.cache
            .read(&CacheKey::Job(id.clone()))
            .and_then(CacheValue::into_job)
    }

    fn reject(&self, key: &CacheKey, rejected: TransitionRejected) -> Outcome {
        debug!(%key, %rejected, "dropping event with illegal transition");
        // Let the view refetch the job instead of trusting either side
        self.cache.invalidate(key);
        Outcome::Rejected(rejected)
    }

    fn invalidate_for_completion(&self, job: &Job) {
        self.cache.invalidate(&CacheKey::VideoList);
        self.cache.invalidate(&CacheKey::Video(job.video_id.clone()));
        self.cache.invalidate(&CacheKey::NoteList);
        self.cache.invalidate(&CacheKey::Job(job.id.clone()));
    }

    /// Cached queued/processing jobs for the same video, other than `job`
    fn active_siblings(&self, job: &Job) -> Vec<CacheKey> {
        self.cache
            .keys()
            .into_iter()
            .filter(|key| {
                key.job_id()
                    .filter(|other_id| *other_id != &job.id)
                    .and_then(|other_id| self.read_job(other_id))
                    .map(|other| other.video_id == job.video_id && other.status.is_active())
                    .unwrap_or(false)
            })
            .collect()
    }

    fn has_active_sibling(&self, job: &Job) -> bool {
        !self.active_siblings(job).is_empty()
    }

    /// Keep at most one queued/processing job cached per video
    fn evict_other_active(&self, job: &Job) {
        for key in self.active_siblings(job) {
            debug!(%key, video_id = %job.video_id, "evicting superseded active job");
            self.cache.remove(&key);
            self.cache.invalidate(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryCache, VideoId};

    fn setup() -> (Arc<MemoryCache>, CacheSynchronizer) {
        let cache = Arc::new(MemoryCache::new());
        let sync = CacheSynchronizer::new(cache.clone());
        (cache, sync)
    }

    fn started(job: &str, video: &str) -> SyncEvent {
        SyncEvent::JobStarted(JobStarted {
            job_id: JobId::new(job),
            video_id: VideoId::new(video),
            message: None,
        })
    }

    fn progress(job: &str, progress: u8, status: Option<JobStatus>) -> SyncEvent {
        SyncEvent::JobProgress(JobProgress {
            job_id: JobId::new(job),
            progress,
            status,
            message: None,
        })
    }

    fn completed(job: &str, video: &str) -> SyncEvent {
        SyncEvent::JobCompleted(JobCompleted {
            job_id: JobId::new(job),
            video_id: VideoId::new(video),
            result: None,
        })
    }

    fn failed(job: &str, error: &str) -> SyncEvent {
        SyncEvent::JobFailed(JobFailed {
            job_id: JobId::new(job),
            error: error.to_string(),
        })
    }

    fn job(cache: &MemoryCache, id: &str) -> Option<Job> {
        cache.read_job(&JobId::new(id))
    }

    #[test]
    fn test_started_upserts_processing() {
        let (cache, sync) = setup();

        assert_eq!(sync.apply(&started("J1", "V1")), Outcome::Applied);

        let cached = job(&cache, "J1").unwrap();
        assert_eq!(cached.status, JobStatus::Processing);
        assert_eq!(cached.video_id, VideoId::new("V1"));
        assert!(cache.is_stale(&CacheKey::JobList));
        assert!(cache.is_stale(&CacheKey::VideoList));
        assert!(!cache.is_stale(&CacheKey::NoteList));
    }

    #[test]
    fn test_ordered_lifecycle_ends_completed() {
        let (cache, sync) = setup();

        for event in [
            started("J1", "V1"),
            progress("J1", 30, None),
            progress("J1", 70, None),
            completed("J1", "V1"),
        ] {
            assert_eq!(sync.apply(&event), Outcome::Applied);
        }

        let cached = job(&cache, "J1").unwrap();
        assert_eq!(cached.status, JobStatus::Completed);
        assert_eq!(cached.progress, 100);
        for key in [
            CacheKey::JobList,
            CacheKey::VideoList,
            CacheKey::NoteList,
            CacheKey::Video(VideoId::new("V1")),
            CacheKey::Job(JobId::new("J1")),
        ] {
            assert!(cache.is_stale(&key), "{key} should be stale");
        }
    }

    #[test]
    fn test_progress_is_idempotent() {
        let (cache, sync) = setup();
        sync.apply(&started("J1", "V1"));

        sync.apply(&progress("J1", 55, None));
        let once = job(&cache, "J1");
        sync.apply(&progress("J1", 55, None));

        assert_eq!(job(&cache, "J1"), once);
        assert!(cache.is_stale(&CacheKey::JobList));
    }

    #[test]
    fn test_progress_regression_trusts_arrival_order() {
        let (cache, sync) = setup();
        sync.apply(&started("J1", "V1"));

        sync.apply(&progress("J1", 70, None));
        assert_eq!(sync.apply(&progress("J1", 40, None)), Outcome::Applied);

        let cached = job(&cache, "J1").unwrap();
        assert_eq!(cached.progress, 40);
        assert_eq!(cached.status, JobStatus::Processing);
    }

    #[test]
    fn test_progress_on_queued_job_starts_processing() {
        let (cache, sync) = setup();
        let queued = Job::new(JobId::new("J1"), VideoId::new("V1"));
        cache.write(CacheKey::Job(queued.id.clone()), CacheValue::Job(queued));

        assert_eq!(sync.apply(&progress("J1", 5, None)), Outcome::Applied);

        let cached = job(&cache, "J1").unwrap();
        assert_eq!(cached.status, JobStatus::Processing);
        assert_eq!(cached.progress, 5);
    }

    #[test]
    fn test_progress_for_absent_job_only_invalidates_list() {
        let (cache, sync) = setup();

        assert_eq!(
            sync.apply(&progress("J9", 10, None)),
            Outcome::Ignored(IgnoreReason::UntrackedJob)
        );
        assert!(job(&cache, "J9").is_none());
        assert!(cache.is_stale(&CacheKey::JobList));
    }

    #[test]
    fn test_progress_after_terminal_is_dropped() {
        let (cache, sync) = setup();
        sync.apply(&started("J1", "V1"));
        sync.apply(&completed("J1", "V1"));

        assert_eq!(
            sync.apply(&progress("J1", 20, None)),
            Outcome::Ignored(IgnoreReason::TerminalJob)
        );
        assert_eq!(job(&cache, "J1").unwrap().progress, 100);
    }

    #[test]
    fn test_orphan_completion_creates_no_entry() {
        let (cache, sync) = setup();

        assert_eq!(
            sync.apply(&completed("J404", "V1")),
            Outcome::Ignored(IgnoreReason::UntrackedJob)
        );
        assert!(job(&cache, "J404").is_none());
        assert!(cache.keys().is_empty());
        assert!(cache.is_stale(&CacheKey::JobList));
        assert_eq!(cache.invalidation_count(&CacheKey::Job(JobId::new("J404"))), 0);
    }

    #[test]
    fn test_late_start_after_completion_is_rejected() {
        let (cache, sync) = setup();
        sync.apply(&started("J1", "V1"));
        sync.apply(&completed("J1", "V1"));

        let outcome = sync.apply(&started("J1", "V1"));
        assert_eq!(
            outcome,
            Outcome::Rejected(TransitionRejected {
                from: JobStatus::Completed,
                to: JobStatus::Processing,
            })
        );
        assert_eq!(job(&cache, "J1").unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn test_failed_records_error() {
        let (cache, sync) = setup();
        sync.apply(&started("J1", "V1"));

        assert_eq!(sync.apply(&failed("J1", "transcription timeout")), Outcome::Applied);

        let cached = job(&cache, "J1").unwrap();
        assert_eq!(cached.status, JobStatus::Failed);
        assert_eq!(cached.error.as_deref(), Some("transcription timeout"));
        assert!(cache.is_stale(&CacheKey::Job(JobId::new("J1"))));

        assert_eq!(
            sync.apply(&failed("J1", "transcription timeout")),
            Outcome::Ignored(IgnoreReason::Duplicate)
        );
    }

    #[test]
    fn test_failed_for_untracked_job_is_dropped() {
        let (cache, sync) = setup();
        assert_eq!(
            sync.apply(&failed("J7", "boom")),
            Outcome::Ignored(IgnoreReason::UntrackedJob)
        );
        assert!(job(&cache, "J7").is_none());
    }

    #[test]
    fn test_one_active_job_per_video() {
        let (cache, sync) = setup();
        sync.apply(&started("J1", "V1"));
        sync.apply(&started("J2", "V2"));
        sync.apply(&started("J3", "V1"));

        assert!(job(&cache, "J1").is_none());
        assert!(job(&cache, "J2").is_some());
        assert_eq!(job(&cache, "J3").unwrap().status, JobStatus::Processing);
    }

    #[test]
    fn test_resync_invalidates_lists_and_jobs_once() {
        let (cache, sync) = setup();
        sync.apply(&started("J1", "V1"));
        let before = cache.invalidation_count(&CacheKey::JobList);

        let invalidated = sync.resync();

        assert_eq!(invalidated, 4);
        assert_eq!(cache.invalidation_count(&CacheKey::JobList), before + 1);
        assert_eq!(cache.invalidation_count(&CacheKey::NoteList), 1);
        assert!(cache.is_stale(&CacheKey::Job(JobId::new("J1"))));
    }

    #[test]
    fn test_retry_accepted_requeues_failed_job() {
        let (cache, sync) = setup();
        sync.apply(&started("J1", "V1"));
        sync.apply(&failed("J1", "boom"));
        let id = JobId::new("J1");

        sync.begin_retry(&id);
        assert_eq!(sync.retry_accepted(&id), Outcome::Applied);

        let cached = job(&cache, "J1").unwrap();
        assert_eq!(cached.status, JobStatus::Queued);
        assert_eq!(cached.error, None);
    }

    #[test]
    fn test_retry_does_not_requeue_beside_active_job() {
        let (cache, sync) = setup();
        sync.apply(&started("J1", "V1"));
        sync.apply(&failed("J1", "boom"));
        sync.apply(&started("J2", "V1"));
        let id = JobId::new("J1");
        let before = cache.invalidation_count(&CacheKey::Job(id.clone()));

        sync.begin_retry(&id);
        assert_eq!(
            sync.retry_accepted(&id),
            Outcome::Ignored(IgnoreReason::VideoBusy)
        );

        let active: Vec<Job> = cache
            .keys()
            .into_iter()
            .filter_map(|key| key.job_id().and_then(|id| cache.read_job(id)))
            .filter(|j| j.video_id == VideoId::new("V1") && j.status.is_active())
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, JobId::new("J2"));
        assert_eq!(job(&cache, "J1").unwrap().status, JobStatus::Failed);
        assert_eq!(cache.invalidation_count(&CacheKey::Job(id)), before + 1);
        assert!(cache.is_stale(&CacheKey::JobList));
    }

    #[test]
    fn test_server_start_wins_over_pending_retry() {
        let (cache, sync) = setup();
        sync.apply(&started("J1", "V1"));
        sync.apply(&failed("J1", "boom"));
        let id = JobId::new("J1");

        sync.begin_retry(&id);
        // The restart event overtakes the HTTP response
        assert_eq!(sync.apply(&started("J1", "V1")), Outcome::Applied);
        assert_eq!(
            sync.retry_accepted(&id),
            Outcome::Ignored(IgnoreReason::NotRetryable)
        );

        assert_eq!(job(&cache, "J1").unwrap().status, JobStatus::Processing);
    }

    #[test]
    fn test_start_on_failed_job_without_retry_is_rejected() {
        let (cache, sync) = setup();
        sync.apply(&started("J1", "V1"));
        sync.apply(&failed("J1", "boom"));

        assert!(matches!(sync.apply(&started("J1", "V1")), Outcome::Rejected(_)));
        assert_eq!(job(&cache, "J1").unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn test_cancel_blocks_late_events() {
        let (cache, sync) = setup();
        sync.apply(&started("J1", "V1"));

        assert_eq!(sync.cancel_accepted(&JobId::new("J1")), Outcome::Applied);
        assert!(job(&cache, "J1").is_none());

        for event in [completed("J1", "V1"), started("J1", "V1"), progress("J1", 90, None)] {
            assert_eq!(sync.apply(&event), Outcome::Ignored(IgnoreReason::Cancelled));
        }
        assert!(job(&cache, "J1").is_none());
    }

    #[test]
    fn test_tombstones_are_bounded() {
        let mut state = SyncState::default();
        for i in 0..(TOMBSTONE_CAPACITY + 10) {
            state.bury(JobId::new(format!("J{i}")));
        }
        assert_eq!(state.tombstones.len(), TOMBSTONE_CAPACITY);
        assert!(!state.is_cancelled(&JobId::new("J0")));
        assert!(state.is_cancelled(&JobId::new(format!("J{}", TOMBSTONE_CAPACITY + 9))));
    }
}

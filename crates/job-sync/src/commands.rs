/// Job-affecting commands (retry, cancel) and their cache reconciliation
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::{
    deliver, CacheSynchronizer, Credentials, JobId, Notification, NotificationSink, Outcome,
    Result, SyncError,
};

/// Request channel to the backend, separate from the event stream
#[async_trait]
pub trait JobApi: Send + Sync {
    async fn retry_job(&self, job_id: &JobId) -> Result<()>;

    async fn cancel_job(&self, job_id: &JobId) -> Result<()>;
}

/// `JobApi` over authenticated HTTP
pub struct HttpJobApi {
    base_url: String,
    credentials: Credentials,
    client: reqwest::Client,
}

impl HttpJobApi {
    pub fn new(base_url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            base_url: base_url.into(),
            credentials,
            client: reqwest::Client::new(),
        }
    }

    fn job_url(&self, job_id: &JobId) -> String {
        format!("{}/jobs/{}", self.base_url.trim_end_matches('/'), job_id)
    }

    async fn check(response: reqwest::Response) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let message = if body.trim().is_empty() {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        } else {
            body
        };
        Err(SyncError::Command {
            status: Some(status.as_u16()),
            message,
        })
    }
}

#[async_trait]
impl JobApi for HttpJobApi {
    async fn retry_job(&self, job_id: &JobId) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/retry", self.job_url(job_id)))
            .bearer_auth(self.credentials.token())
            .send()
            .await?;
        Self::check(response).await
    }

    async fn cancel_job(&self, job_id: &JobId) -> Result<()> {
        let response = self
            .client
            .delete(self.job_url(job_id))
            .bearer_auth(self.credentials.token())
            .send()
            .await?;
        Self::check(response).await
    }
}

/// Marks a retry as in flight until it settles or the caller gives up on it
struct PendingRetry<'a> {
    synchronizer: &'a CacheSynchronizer,
    job_id: &'a JobId,
}

impl<'a> PendingRetry<'a> {
    fn begin(synchronizer: &'a CacheSynchronizer, job_id: &'a JobId) -> Self {
        synchronizer.begin_retry(job_id);
        Self {
            synchronizer,
            job_id,
        }
    }
}

impl Drop for PendingRetry<'_> {
    fn drop(&mut self) {
        // No-op once the retry was accepted or rejected
        self.synchronizer.retry_rejected(self.job_id);
    }
}

/// Issues commands and reconciles the cache around them.
///
/// Nothing is written before the backend answers, so a rejected command
/// leaves the cache exactly as it was.
pub struct CommandLayer {
    api: Arc<dyn JobApi>,
    synchronizer: Arc<CacheSynchronizer>,
    notifier: Arc<dyn NotificationSink>,
}

impl CommandLayer {
    pub fn new(
        api: Arc<dyn JobApi>,
        synchronizer: Arc<CacheSynchronizer>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            api,
            synchronizer,
            notifier,
        }
    }

    pub async fn retry(&self, job_id: &JobId) -> Result<Outcome> {
        let _pending = PendingRetry::begin(&self.synchronizer, job_id);

        match self.api.retry_job(job_id).await {
            Ok(()) => {
                let outcome = self.synchronizer.retry_accepted(job_id);
                info!(%job_id, ?outcome, "retry accepted");
                deliver(
                    self.notifier.as_ref(),
                    Notification::info(format!("Retrying job {job_id}")).for_job(job_id),
                );
                Ok(outcome)
            }
            Err(e) => {
                self.synchronizer.retry_rejected(job_id);
                warn!(%job_id, error = %e, "retry rejected");
                deliver(
                    self.notifier.as_ref(),
                    Notification::error(format!("Could not retry job {job_id}: {e}"))
                        .for_job(job_id),
                );
                Err(e)
            }
        }
    }

    pub async fn cancel(&self, job_id: &JobId) -> Result<Outcome> {
        match self.api.cancel_job(job_id).await {
            Ok(()) => {
                let outcome = self.synchronizer.cancel_accepted(job_id);
                info!(%job_id, "cancel accepted");
                deliver(
                    self.notifier.as_ref(),
                    Notification::info(format!("Cancelled job {job_id}")).for_job(job_id),
                );
                Ok(outcome)
            }
            Err(e) => {
                warn!(%job_id, error = %e, "cancel rejected");
                deliver(
                    self.notifier.as_ref(),
                    Notification::error(format!("Could not cancel job {job_id}: {e}"))
                        .for_job(job_id),
                );
                Err(e)
            }
        }
    }
}

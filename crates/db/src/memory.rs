//! In-process [`JobStore`] used by tests and database-less local runs.

use std::collections::HashMap;

use async_trait::async_trait;
use brandkit_core::build_job::{BuildJob, BuildJobFilter, BuildJobPatch};
use brandkit_core::types::JobId;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::store::{JobStore, StoreError};

/// Records held in a map behind an async lock.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, BuildJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &BuildJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(format!("build job {} already exists", job.id)));
        }
        if job.status.is_active() && jobs.values().any(|j| j.status.is_active()) {
            return Err(StoreError::Conflict("uq_build_jobs_single_active".into()));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update(&self, id: JobId, patch: &BuildJobPatch) -> Result<BuildJob, StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !job.status.admits(patch.status) {
            return Err(StoreError::illegal_transition(id, job.status, patch.status));
        }
        job.apply(patch, Utc::now());
        Ok(job.clone())
    }

    async fn get(&self, id: JobId) -> Result<Option<BuildJob>, StoreError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn list(&self, filter: &BuildJobFilter) -> Result<Vec<BuildJob>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<BuildJob> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(matching)
    }

    async fn delete(&self, filter: &BuildJobFilter) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, j| !filter.matches(j));
        Ok((before - jobs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use brandkit_core::build_job::{BuildMode, BuildStatus};
    use brandkit_core::types::new_job_id;

    fn job(brand: &str, status: BuildStatus, offset_secs: i64) -> BuildJob {
        let at = Utc::now() + chrono::Duration::seconds(offset_secs);
        let mut job = BuildJob::queued(new_job_id(), brand, BuildMode::Native, at);
        job.status = status;
        job
    }

    #[tokio::test]
    async fn list_is_newest_first_and_filtered() {
        let store = MemoryJobStore::new();
        let old = job("acme", BuildStatus::Success, -60);
        let new = job("acme", BuildStatus::Failed, 0);
        let other = job("globex", BuildStatus::Success, 30);
        for j in [&old, &new, &other] {
            store.insert(j).await.expect("insert");
        }

        let all = store.list(&BuildJobFilter::default()).await.expect("list");
        let ids: Vec<_> = all.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![other.id, new.id, old.id]);

        let acme = store.list(&BuildJobFilter::brand("acme")).await.expect("list");
        assert_eq!(acme.len(), 2);
        assert_eq!(acme[0].id, new.id);
    }

    #[tokio::test]
    async fn second_active_job_is_a_conflict() {
        let store = MemoryJobStore::new();
        store.insert(&job("acme", BuildStatus::Queued, 0)).await.expect("first insert");
        let result = store.insert(&job("globex", BuildStatus::Queued, 0)).await;
        assert_matches!(result, Err(StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn update_unknown_id_is_not_found() {
        let store = MemoryJobStore::new();
        let id = new_job_id();
        let result = store.update(id, &BuildJobPatch::message("x")).await;
        assert_matches!(result, Err(StoreError::NotFound(got)) if got == id);
    }

    #[tokio::test]
    async fn cancelled_job_cannot_return_to_building() {
        let store = MemoryJobStore::new();
        let queued = job("acme", BuildStatus::Queued, 0);
        store.insert(&queued).await.expect("insert");
        let cancel = BuildJobPatch {
            status: Some(BuildStatus::Cancelled),
            ..Default::default()
        };
        store.update(queued.id, &cancel).await.expect("cancel");

        let result = store.update(queued.id, &BuildJobPatch::progress(20, "again")).await;
        assert_matches!(result, Err(StoreError::Conflict(_)));

        let stored = store.get(queued.id).await.expect("get").expect("job");
        assert_eq!(stored.status, BuildStatus::Cancelled);
        assert_eq!(stored.progress_percent, 0);
    }

    #[tokio::test]
    async fn terminal_job_accepts_status_preserving_patch() {
        let store = MemoryJobStore::new();
        let submitted = job("acme", BuildStatus::Submitted, 0);
        store.insert(&submitted).await.expect("insert");

        let updated = store
            .update(submitted.id, &BuildJobPatch::message("Submitted to beta track"))
            .await
            .expect("message update");
        assert_eq!(updated.status, BuildStatus::Submitted);
        assert_eq!(updated.message, "Submitted to beta track");
    }

    #[tokio::test]
    async fn delete_removes_only_matching() {
        let store = MemoryJobStore::new();
        store.insert(&job("acme", BuildStatus::Failed, 0)).await.expect("insert");
        store.insert(&job("acme", BuildStatus::Success, 1)).await.expect("insert");
        store.insert(&job("globex", BuildStatus::Failed, 2)).await.expect("insert");

        let filter = BuildJobFilter {
            brand_id: Some("acme".into()),
            status: Some(BuildStatus::Failed),
        };
        assert_eq!(store.delete(&filter).await.expect("delete"), 1);
        assert_eq!(store.list(&BuildJobFilter::default()).await.expect("list").len(), 2);
    }
}

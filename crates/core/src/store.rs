//! Job store contract and the in-memory implementation.
//!
//! The store is the single source of truth. Components never cache job rows
//! across poll passes; they re-read through this trait so externally driven
//! changes (a user deleting a running job) are observed on the next pass.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::dataset::{Dataset, DatasetState};
use crate::destination::JobDestination;
use crate::error::StoreError;
use crate::job::{DatasetId, Job, JobEvent, JobId, JobState, UserId};

/// Filter for [`JobStore::find_jobs`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub states: Vec<JobState>,
    pub handler: Option<String>,
    pub user_id: Option<UserId>,
}

impl JobFilter {
    pub fn states(states: &[JobState]) -> Self {
        Self {
            states: states.to_vec(),
            ..Self::default()
        }
    }

    pub fn handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    pub fn user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        if !self.states.is_empty() && !self.states.contains(&job.state) {
            return false;
        }
        if let Some(ref handler) = self.handler {
            if job.handler.as_deref() != Some(handler.as_str()) {
                return false;
            }
        }
        if let Some(user_id) = self.user_id {
            if job.owner.user_id() != Some(user_id) {
                return false;
            }
        }
        true
    }
}

/// Persistence boundary consumed by the scheduler core.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get_job(&self, id: JobId) -> Result<Job, StoreError>;

    /// Jobs matching `filter`, ordered by id.
    async fn find_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Set the job state; `info` replaces the user-visible message when given.
    async fn update_state(
        &self,
        id: JobId,
        state: JobState,
        info: Option<String>,
    ) -> Result<(), StoreError>;

    /// Record (or clear) the runner plugin name and backend handle.
    async fn set_external(
        &self,
        id: JobId,
        runner_name: Option<String>,
        external_id: Option<String>,
    ) -> Result<(), StoreError>;

    /// Persist the resolved destination id and params.
    async fn set_destination(
        &self,
        id: JobId,
        destination: &JobDestination,
    ) -> Result<(), StoreError>;

    async fn append_history(&self, id: JobId, event: JobEvent) -> Result<(), StoreError>;

    async fn get_dataset(&self, id: DatasetId) -> Result<Dataset, StoreError>;

    async fn update_dataset_state(
        &self,
        id: DatasetId,
        state: DatasetState,
        info: Option<String>,
    ) -> Result<(), StoreError>;

    /// Bytes of storage currently charged to the user.
    async fn user_disk_usage(&self, user_id: UserId) -> Result<u64, StoreError>;

    /// Quota in bytes; `None` means unlimited.
    async fn user_quota(&self, user_id: UserId) -> Result<Option<u64>, StoreError>;
}

// ── In-memory store ──────────────────────────────────────────────

/// Serializable content of a [`MemoryJobStore`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub datasets: Vec<Dataset>,
    #[serde(default)]
    pub usage: HashMap<UserId, u64>,
    #[serde(default)]
    pub quotas: HashMap<UserId, u64>,
}

#[derive(Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    datasets: HashMap<DatasetId, Dataset>,
    usage: HashMap<UserId, u64>,
    quotas: HashMap<UserId, u64>,
}

/// Thread-safe in-memory [`JobStore`].
#[derive(Default)]
pub struct MemoryJobStore {
    tables: RwLock<Tables>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let store = Self::new();
        for job in snapshot.jobs {
            store.insert_job(job);
        }
        for dataset in snapshot.datasets {
            store.insert_dataset(dataset);
        }
        if let Ok(mut t) = store.tables.write() {
            t.usage = snapshot.usage;
            t.quotas = snapshot.quotas;
        }
        store
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let t = self.tables.read().expect("store lock poisoned");
        let mut jobs: Vec<Job> = t.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.id);
        let mut datasets: Vec<Dataset> = t.datasets.values().cloned().collect();
        datasets.sort_by_key(|d| d.id);
        StoreSnapshot {
            jobs,
            datasets,
            usage: t.usage.clone(),
            quotas: t.quotas.clone(),
        }
    }

    pub fn insert_job(&self, job: Job) {
        self.tables
            .write()
            .expect("store lock poisoned")
            .jobs
            .insert(job.id, job);
    }

    pub fn insert_dataset(&self, dataset: Dataset) {
        self.tables
            .write()
            .expect("store lock poisoned")
            .datasets
            .insert(dataset.id, dataset);
    }

    pub fn set_usage(&self, user_id: UserId, bytes: u64) {
        self.tables
            .write()
            .expect("store lock poisoned")
            .usage
            .insert(user_id, bytes);
    }

    pub fn set_quota(&self, user_id: UserId, bytes: Option<u64>) {
        let mut t = self.tables.write().expect("store lock poisoned");
        match bytes {
            Some(b) => t.quotas.insert(user_id, b),
            None => t.quotas.remove(&user_id),
        };
    }

    fn with_job<T>(
        &self,
        id: JobId,
        f: impl FnOnce(&mut Job) -> T,
    ) -> Result<T, StoreError> {
        let mut t = self
            .tables
            .write()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
        let job = t.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        let out = f(job);
        job.update_time = Utc::now();
        Ok(out)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get_job(&self, id: JobId) -> Result<Job, StoreError> {
        let t = self
            .tables
            .read()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
        t.jobs.get(&id).cloned().ok_or(StoreError::JobNotFound(id))
    }

    async fn find_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let t = self
            .tables
            .read()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
        let mut jobs: Vec<Job> = t.jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    async fn update_state(
        &self,
        id: JobId,
        state: JobState,
        info: Option<String>,
    ) -> Result<(), StoreError> {
        self.with_job(id, |job| {
            job.state = state;
            if info.is_some() {
                job.info = info;
            }
        })
    }

    async fn set_external(
        &self,
        id: JobId,
        runner_name: Option<String>,
        external_id: Option<String>,
    ) -> Result<(), StoreError> {
        self.with_job(id, |job| {
            job.runner_name = runner_name;
            job.external_id = external_id;
        })
    }

    async fn set_destination(
        &self,
        id: JobId,
        destination: &JobDestination,
    ) -> Result<(), StoreError> {
        self.with_job(id, |job| {
            job.destination_id = Some(destination.id.clone());
            job.destination_params = destination.params.clone();
        })
    }

    async fn append_history(&self, id: JobId, event: JobEvent) -> Result<(), StoreError> {
        self.with_job(id, |job| job.history.push(event))
    }

    async fn get_dataset(&self, id: DatasetId) -> Result<Dataset, StoreError> {
        let t = self
            .tables
            .read()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
        t.datasets
            .get(&id)
            .cloned()
            .ok_or(StoreError::DatasetNotFound(id))
    }

    async fn update_dataset_state(
        &self,
        id: DatasetId,
        state: DatasetState,
        info: Option<String>,
    ) -> Result<(), StoreError> {
        let mut t = self
            .tables
            .write()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
        let dataset = t.datasets.get_mut(&id).ok_or(StoreError::DatasetNotFound(id))?;
        dataset.state = state;
        if info.is_some() {
            dataset.info = info;
        }
        Ok(())
    }

    async fn user_disk_usage(&self, user_id: UserId) -> Result<u64, StoreError> {
        let t = self
            .tables
            .read()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
        Ok(t.usage.get(&user_id).copied().unwrap_or(0))
    }

    async fn user_quota(&self, user_id: UserId) -> Result<Option<u64>, StoreError> {
        let t = self
            .tables
            .read()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
        Ok(t.quotas.get(&user_id).copied())
    }
}

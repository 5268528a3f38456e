// Job registry: CRUD, start/stop and startup recovery
//
// Every mutation validates first and only then touches the job list, so a
// rejected mutation leaves prior state intact. The full list is saved before
// the call returns.

use super::{Inner, RegistryState, ScheduleManager, STATUS_CHANNEL_CAPACITY};
use crate::dependency::{DependencyGraph, DependencyNode};
use crate::errors::{RegistryError, StorageError, ValidationError};
use crate::models::{
    DependencyStrategy, Environment, Job, JobId, JobStatus, JobUpdate, LastRun, LogEntry, NewJob,
    RunOutcome,
};
use crate::notification::{email::is_valid_address, Notifier};
use crate::store::ConfigStore;
use crate::telemetry;
use crate::worker::WorkerLauncher;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, instrument, warn};

/// Check a job definition on its own, without looking at other jobs
pub fn validate_definition(job: &Job) -> Result<(), ValidationError> {
    if job.name.trim().is_empty() {
        return Err(ValidationError::MissingField("name".to_string()));
    }
    if job.name.chars().any(char::is_control) {
        return Err(invalid("name", "must not contain control characters"));
    }

    job.recurrence.validate()?;

    let both_custom = job.source_environment == Environment::Custom
        && job.target_environment == Environment::Custom;
    if job.source_environment == job.target_environment && !both_custom {
        return Err(ValidationError::SameEnvironment);
    }
    for (side, env, credentials) in [
        ("source", job.source_environment, &job.source_credentials),
        ("target", job.target_environment, &job.target_credentials),
    ] {
        let has_credentials = credentials.as_deref().is_some_and(|c| !c.trim().is_empty());
        if env == Environment::Custom && !has_credentials {
            return Err(ValidationError::MissingCredentials {
                side: side.to_string(),
            });
        }
    }

    if job.params.batch_size == 0 {
        return Err(invalid("params.batch_size", "must be greater than 0"));
    }
    if job.dependency_strategy == DependencyStrategy::Wait && job.dependency_timeout_minutes == 0 {
        return Err(invalid(
            "dependency_timeout_minutes",
            "must be greater than 0 for the wait strategy",
        ));
    }

    if let Some(email) = &job.notifications.email {
        if !is_valid_address(email) {
            return Err(invalid("notifications.email", "not a valid email address"));
        }
    }
    if let Some(url) = &job.notifications.webhook_url {
        match reqwest::Url::parse(url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
            Ok(parsed) => {
                return Err(invalid(
                    "notifications.webhook_url",
                    &format!("unsupported scheme '{}'", parsed.scheme()),
                ))
            }
            Err(e) => return Err(invalid("notifications.webhook_url", &e.to_string())),
        }
    }

    Ok(())
}

fn invalid(field: &str, reason: &str) -> ValidationError {
    ValidationError::InvalidFieldValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn next_run(job: &Job, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ValidationError> {
    if job.is_disabled() {
        return Ok(None);
    }
    Ok(Some(job.recurrence.next_after(now)?))
}

impl ScheduleManager {
    /// Empty registry; nothing is armed until [`ScheduleManager::start_all`]
    pub fn new(
        store: Arc<dyn ConfigStore>,
        launcher: Arc<dyn WorkerLauncher>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self::with_jobs(Vec::new(), store, launcher, notifier)
    }

    fn with_jobs(
        jobs: Vec<Job>,
        store: Arc<dyn ConfigStore>,
        launcher: Arc<dyn WorkerLauncher>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self::from_inner(Arc::new(Inner {
            state: Mutex::new(RegistryState {
                jobs,
                ..RegistryState::default()
            }),
            store,
            launcher,
            notifier,
            status_tx,
        }))
    }

    /// Load the persisted job list.
    ///
    /// Jobs persisted as `running` belonged to a process that died mid-run;
    /// they are recorded as failed so their dependents see a final outcome.
    #[instrument(skip_all)]
    pub async fn load(
        store: Arc<dyn ConfigStore>,
        launcher: Arc<dyn WorkerLauncher>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, StorageError> {
        let mut jobs = store.load().await?;
        let now = Utc::now();

        let mut recovered = 0;
        for job in jobs.iter_mut().filter(|job| job.is_running()) {
            job.last_run = Some(LastRun {
                outcome: RunOutcome::Failed,
                exit_code: None,
                finished_at: now,
            });
            job.status = if job.stop_requested {
                JobStatus::Disabled
            } else {
                JobStatus::Failed
            };
            job.stop_requested = false;
            job.append_log(now, "run interrupted by scheduler restart");
            job.updated_at = now;
            recovered += 1;
            warn!(job_id = %job.id, job_name = %job.name, "Recovered job left running by a previous process");
        }

        if let Some(cycle) = DependencyGraph::from_jobs(&jobs).find_any_cycle() {
            // Only reachable through hand-edited store files
            warn!(cycle = ?cycle, "Persisted jobs contain a dependency cycle");
        }

        info!(job_count = jobs.len(), recovered, "Job registry loaded");
        let manager = Self::with_jobs(jobs, store, launcher, notifier);
        if recovered > 0 {
            let state = manager.inner.state.lock().await;
            manager.persist(&state).await;
        }
        Ok(manager)
    }

    #[instrument(skip(self, new), fields(job_name = %new.name))]
    pub async fn create(&self, new: NewJob) -> Result<Job, RegistryError> {
        let now = Utc::now();
        let mut state = self.inner.state.lock().await;

        let mut job = Job::from_new(new, now);
        if state.job(&job.id).is_some() {
            return Err(invalid("id", "already in use").into());
        }
        validate_definition(&job)?;
        DependencyGraph::from_jobs(&state.jobs).validate(job.id, &job.dependencies)?;

        job.next_run_at = next_run(&job, now)?;
        job.append_log(now, "job created");
        state.jobs.push(job.clone());

        if state.started && !job.is_disabled() {
            self.arm(&mut state, job.id);
        }
        self.persist(&state).await;

        info!(job_id = %job.id, next_run_at = ?job.next_run_at, "Job created");
        Ok(job)
    }

    /// Apply a partial update. Dependencies are re-validated only when the
    /// update writes them; a recurrence change re-arms the timer.
    #[instrument(skip(self, update), fields(job_id = %id))]
    pub async fn update(&self, id: JobId, update: JobUpdate) -> Result<Job, RegistryError> {
        let now = Utc::now();
        let mut state = self.inner.state.lock().await;
        let idx = state.index_of(&id).ok_or(RegistryError::JobNotFound(id))?;

        let mut job = state.jobs[idx].clone();
        let (dependencies_changed, recurrence_changed) = job.apply_update(update);
        validate_definition(&job)?;
        if dependencies_changed {
            DependencyGraph::from_jobs(&state.jobs).validate(id, &job.dependencies)?;
        }
        if recurrence_changed {
            job.next_run_at = next_run(&job, now)?;
        }
        job.updated_at = now;
        job.append_log(now, "job updated");
        state.jobs[idx] = job.clone();

        if recurrence_changed && state.started && !job.is_disabled() {
            self.arm(&mut state, id);
        }
        self.persist(&state).await;

        info!(dependencies_changed, recurrence_changed, "Job updated");
        Ok(job)
    }

    /// Remove a job. Dependents are not re-validated; a stale reference
    /// blocks them at their next trigger.
    #[instrument(skip(self), fields(job_id = %id))]
    pub async fn delete(&self, id: JobId) -> Result<Job, RegistryError> {
        let mut state = self.inner.state.lock().await;
        let idx = state.index_of(&id).ok_or(RegistryError::JobNotFound(id))?;

        let job = state.jobs.remove(idx);
        self.disarm(&mut state, &id);
        self.cancel_wait(&mut state, &id);
        self.persist(&state).await;
        drop(state);

        self.publish_status(id);
        info!(job_name = %job.name, "Job deleted");
        Ok(job)
    }

    pub async fn get(&self, id: JobId) -> Option<Job> {
        self.inner.state.lock().await.job(&id).cloned()
    }

    /// All jobs in creation order
    pub async fn list(&self) -> Vec<Job> {
        self.inner.state.lock().await.jobs.clone()
    }

    /// The last `n` log entries of a job, oldest first
    pub async fn recent_log(&self, id: JobId, n: usize) -> Result<Vec<LogEntry>, RegistryError> {
        let state = self.inner.state.lock().await;
        let job = state.job(&id).ok_or(RegistryError::JobNotFound(id))?;
        Ok(job.recent_log(n).to_vec())
    }

    /// Upstream dependency tree of a job; deleted dependencies show as missing
    pub async fn dependency_tree(&self, id: JobId) -> Result<DependencyNode, RegistryError> {
        let state = self.inner.state.lock().await;
        if state.job(&id).is_none() {
            return Err(RegistryError::JobNotFound(id));
        }
        let graph = DependencyGraph::from_jobs(&state.jobs);
        Ok(graph.tree(id, |dep| {
            state.job(dep).map(|job| (job.name.clone(), job.status))
        }))
    }

    /// Jobs that list `id` as a dependency
    pub async fn dependents(&self, id: JobId) -> Result<Vec<Job>, RegistryError> {
        let state = self.inner.state.lock().await;
        if state.job(&id).is_none() {
            return Err(RegistryError::JobNotFound(id));
        }
        let graph = DependencyGraph::from_jobs(&state.jobs);
        Ok(graph
            .dependents_of(&id)
            .iter()
            .filter_map(|dep| state.job(dep).cloned())
            .collect())
    }

    /// Ids of jobs with an armed recurrence timer, sorted
    pub async fn armed_jobs(&self) -> Vec<JobId> {
        let state = self.inner.state.lock().await;
        let mut ids: Vec<JobId> = state.triggers.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Arm every non-disabled job. Calling it again re-arms.
    #[instrument(skip(self))]
    pub async fn start_all(&self) {
        let mut state = self.inner.state.lock().await;
        state.started = true;

        let ids: Vec<JobId> = state
            .jobs
            .iter()
            .filter(|job| !job.is_disabled())
            .map(|job| job.id)
            .collect();
        for id in &ids {
            self.arm(&mut state, *id);
        }
        info!(armed = ids.len(), "Scheduler started");
    }

    /// Disarm every timer. Job status is left untouched and running workers
    /// are not interrupted.
    #[instrument(skip(self))]
    pub async fn stop_all(&self) {
        let mut state = self.inner.state.lock().await;
        state.started = false;

        let ids: Vec<JobId> = state.triggers.keys().copied().collect();
        for id in &ids {
            self.disarm(&mut state, id);
        }
        info!(disarmed = ids.len(), "Scheduler stopped");
    }

    /// [`ScheduleManager::stop_all`] plus cancelling every dependency wait
    pub async fn shutdown(&self) {
        self.stop_all().await;

        let mut state = self.inner.state.lock().await;
        let ids: Vec<JobId> = state.waits.keys().copied().collect();
        for id in &ids {
            self.cancel_wait(&mut state, id);
        }
        info!(cancelled_waits = ids.len(), "Scheduler shut down");
    }

    /// Re-enable a job and arm it if the scheduler is running
    #[instrument(skip(self), fields(job_id = %id))]
    pub async fn start_job(&self, id: JobId) -> Result<Job, RegistryError> {
        let now = Utc::now();
        let mut state = self.inner.state.lock().await;
        let idx = state.index_of(&id).ok_or(RegistryError::JobNotFound(id))?;

        let already_started = !state.jobs[idx].is_disabled()
            && !state.jobs[idx].stop_requested
            && (!state.started || state.triggers.contains_key(&id));
        if already_started {
            return Ok(state.jobs[idx].clone());
        }

        let job = &mut state.jobs[idx];
        if job.is_running() {
            // Cancels a stop requested during this run
            job.stop_requested = false;
        } else if job.is_disabled() {
            job.status = JobStatus::Scheduled;
        }
        job.next_run_at = next_run(job, now)?;
        job.updated_at = now;
        job.append_log(now, "job started");
        let job = job.clone();

        if state.started {
            self.arm(&mut state, id);
        }
        self.persist(&state).await;
        drop(state);

        self.publish_status(id);
        info!("Job started");
        Ok(job)
    }

    /// Disable a job. A running worker is left to finish; its exit moves the
    /// job to `disabled`.
    #[instrument(skip(self), fields(job_id = %id))]
    pub async fn stop_job(&self, id: JobId) -> Result<Job, RegistryError> {
        let now = Utc::now();
        let mut state = self.inner.state.lock().await;
        let idx = state.index_of(&id).ok_or(RegistryError::JobNotFound(id))?;

        let disarmed = self.disarm(&mut state, &id);
        let cancelled = self.cancel_wait(&mut state, &id);

        let job = &mut state.jobs[idx];
        if job.is_disabled() || (job.is_running() && job.stop_requested) {
            return Ok(job.clone());
        }

        if job.is_running() {
            job.stop_requested = true;
            job.append_log(now, "stop requested, current run will finish");
        } else {
            job.status = JobStatus::Disabled;
            job.append_log(now, "job stopped");
        }
        job.next_run_at = None;
        job.updated_at = now;
        let job = job.clone();

        self.persist(&state).await;
        drop(state);

        self.publish_status(id);
        info!(disarmed, cancelled_wait = cancelled, "Job stopped");
        Ok(job)
    }

    /// Abort the dependency wait of `id`, if any
    pub(super) fn cancel_wait(&self, state: &mut RegistryState, id: &JobId) -> bool {
        match state.waits.remove(id) {
            Some(handle) => {
                handle.abort();
                telemetry::record_dependency_wait("cancelled");
                true
            }
            None => false,
        }
    }
}

// Run orchestration
//
// Per trigger: single-flight guard, dependency resolution, then either a skip,
// a dependency wait, or a worker launch. Worker exit is observed by a
// supervising task that records the outcome and notifies.

use super::{Inner, RegistryState, ScheduleManager};
use crate::dependency::{resolve, Resolution};
use crate::errors::RegistryError;
use crate::models::{JobId, JobStatus, LastRun, RunOutcome, TriggerSource};
use crate::notification::RunNotification;
use crate::telemetry;
use crate::worker::{RunArtifacts, WorkerRequest};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// What a trigger did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A worker was launched
    Started,
    /// Parked in a dependency wait
    Deferred { reason: String },
    /// Logged as skipped, nothing launched
    Skipped { reason: String },
    /// Disabled job, nothing logged
    Ignored,
}

/// How a run ended, as seen by the supervising task
struct RunResult {
    exit_code: Option<i32>,
    artifacts: Option<RunArtifacts>,
    error: Option<String>,
}

fn resolve_in(state: &RegistryState, idx: usize) -> Resolution {
    resolve(&state.jobs[idx], |dep| state.job(dep))
}

impl ScheduleManager {
    /// Trigger a job immediately, regardless of its recurrence.
    ///
    /// A disabled job runs once and returns to `disabled` afterwards.
    pub async fn run_now(&self, id: JobId) -> Result<TriggerOutcome, RegistryError> {
        self.trigger(id, TriggerSource::Manual).await
    }

    #[instrument(skip_all, fields(job_id = %id, source = %source))]
    pub(super) async fn trigger(
        &self,
        id: JobId,
        source: TriggerSource,
    ) -> Result<TriggerOutcome, RegistryError> {
        let now = Utc::now();
        let mut state = self.inner.state.lock().await;
        let idx = state.index_of(&id).ok_or(RegistryError::JobNotFound(id))?;

        let disabled = state.jobs[idx].is_disabled();
        if disabled && source != TriggerSource::Manual {
            debug!("Job is disabled, trigger ignored");
            return Ok(TriggerOutcome::Ignored);
        }
        if state.jobs[idx].is_running() {
            telemetry::record_trigger_skipped("running");
            return Ok(self
                .skip(&mut state, idx, now, "previous run still in progress".to_string())
                .await);
        }

        let resolution = resolve_in(&state, idx);
        let strategy = state.jobs[idx].dependency_strategy;

        if resolution.defers_under(strategy) {
            if disabled {
                telemetry::record_trigger_skipped("dependencies");
                let reason = format!("{resolution} (job is disabled, not waiting)");
                return Ok(self.skip(&mut state, idx, now, reason).await);
            }
            if state.waits.contains_key(&id) {
                telemetry::record_trigger_skipped("wait_pending");
                return Ok(self
                    .skip(&mut state, idx, now, "dependency wait already in progress".to_string())
                    .await);
            }

            let timeout = Duration::from_secs(u64::from(state.jobs[idx].dependency_timeout_minutes) * 60);
            self.arm_wait(&mut state, id, timeout);
            telemetry::record_dependency_wait("armed");

            let reason = resolution.reason;
            state.jobs[idx].append_log(now, format!("waiting for dependencies: {reason}"));
            self.persist(&state).await;
            info!(timeout_secs = timeout.as_secs(), reason = %reason, "Trigger deferred until dependencies settle");
            return Ok(TriggerOutcome::Deferred { reason });
        }

        if !resolution.can_run {
            telemetry::record_trigger_skipped("dependencies");
            return Ok(self.skip(&mut state, idx, now, resolution.reason).await);
        }

        if disabled {
            state.jobs[idx].stop_requested = true;
        }
        self.begin_run(&mut state, idx, source, &resolution, now).await;
        Ok(TriggerOutcome::Started)
    }

    async fn skip(
        &self,
        state: &mut RegistryState,
        idx: usize,
        now: DateTime<Utc>,
        reason: String,
    ) -> TriggerOutcome {
        state.jobs[idx].append_log(now, format!("skipped: {reason}"));
        self.persist(state).await;
        info!(reason = %reason, "Trigger skipped");
        TriggerOutcome::Skipped { reason }
    }

    /// Mark the job running and hand the launch to a supervising task.
    /// Runs under the registry lock, so no second trigger for the same job
    /// can pass the running guard before the status is recorded.
    async fn begin_run(
        &self,
        state: &mut RegistryState,
        idx: usize,
        source: TriggerSource,
        resolution: &Resolution,
        now: DateTime<Utc>,
    ) {
        let job = &mut state.jobs[idx];
        job.status = JobStatus::Running;
        job.last_run_at = Some(now);
        job.updated_at = now;
        let mut message = format!("run started (trigger: {source})");
        if resolution.reason.starts_with("ignoring failed") {
            message.push_str(&format!(": {}", resolution.reason));
        }
        job.append_log(now, message);

        let request = WorkerRequest::for_job(job, now);
        let job_id = job.id;
        info!(job_id = %job_id, job_name = %job.name, source = %source, "Run started");

        self.persist(state).await;
        self.publish_status(job_id);

        tokio::spawn(self.clone().supervise(request));
    }

    async fn supervise(self, request: WorkerRequest) {
        let started = Instant::now();
        let result = match self.inner.launcher.launch(&request).await {
            Ok(worker) => {
                let artifacts = worker.artifacts.clone();
                match worker.exit.await {
                    Ok(code) => RunResult {
                        exit_code: Some(code),
                        artifacts: Some(artifacts),
                        error: None,
                    },
                    Err(e) => RunResult {
                        exit_code: None,
                        artifacts: Some(artifacts),
                        error: Some(e.to_string()),
                    },
                }
            }
            Err(e) => {
                warn!(job_id = %request.job_id, error = %e, "Worker could not be started");
                RunResult {
                    exit_code: None,
                    artifacts: None,
                    error: Some(e.to_string()),
                }
            }
        };

        self.complete_run(request.job_id, result, started.elapsed()).await;
    }

    #[instrument(skip(self, result, elapsed), fields(job_id = %id))]
    async fn complete_run(&self, id: JobId, result: RunResult, elapsed: Duration) {
        let now = Utc::now();
        let notification = {
            let mut state = self.inner.state.lock().await;
            let Some(idx) = state.index_of(&id) else {
                warn!("Job was deleted while its worker ran, outcome dropped");
                return;
            };

            let outcome = result
                .exit_code
                .map_or(RunOutcome::Failed, RunOutcome::from_exit_code);
            let job = &mut state.jobs[idx];
            job.last_run = Some(LastRun {
                outcome,
                exit_code: result.exit_code,
                finished_at: now,
            });
            job.status = if job.stop_requested {
                JobStatus::Disabled
            } else {
                outcome.as_status()
            };
            job.stop_requested = false;
            job.next_run_at = if job.is_disabled() {
                None
            } else {
                job.recurrence.next_after(now).ok()
            };
            job.updated_at = now;

            let message = match (&result.error, result.exit_code) {
                (Some(error), _) => format!("run failed: {error}"),
                (None, Some(code)) => format!("run {outcome} (exit code {code})"),
                (None, None) => format!("run {outcome}"),
            };
            job.append_log(now, message);

            match outcome {
                RunOutcome::Completed => telemetry::record_run_success(&job.id, &job.name),
                RunOutcome::Failed => {
                    let reason = if result.error.is_some() { "launch" } else { "exit_code" };
                    telemetry::record_run_failure(&job.id, &job.name, reason);
                }
            }
            telemetry::record_run_duration(&job.id, &job.name, elapsed.as_secs_f64());
            info!(
                outcome = %outcome,
                exit_code = ?result.exit_code,
                status = %job.status,
                duration_ms = elapsed.as_millis() as u64,
                "Run finished"
            );

            let notification = RunNotification::for_run(
                job,
                outcome,
                result.exit_code,
                now,
                result.artifacts,
                result.error,
            );
            self.persist(&state).await;
            notification
        };

        self.publish_status(id);
        self.inner.notifier.notify(&notification).await;
    }

    /// Park a deferred trigger until dependencies change or `timeout` passes
    fn arm_wait(&self, state: &mut RegistryState, id: JobId, timeout: Duration) {
        let receiver = self.inner.status_tx.subscribe();
        let deadline = Instant::now() + timeout;
        let handle = tokio::spawn(wait_for_dependencies(
            Arc::downgrade(&self.inner),
            id,
            deadline,
            receiver,
        ));
        state.waits.insert(id, handle);
    }

    /// Re-evaluate a parked trigger. Returns true once the wait is over.
    #[instrument(skip(self), fields(job_id = %id))]
    async fn resume_wait(&self, id: JobId, timed_out: bool) -> bool {
        let now = Utc::now();
        let mut state = self.inner.state.lock().await;
        let Some(idx) = state.index_of(&id) else {
            state.waits.remove(&id);
            return true;
        };

        if state.jobs[idx].is_disabled() {
            state.waits.remove(&id);
            return true;
        }
        if state.jobs[idx].is_running() {
            state.waits.remove(&id);
            telemetry::record_trigger_skipped("running");
            self.skip(&mut state, idx, now, "previous run still in progress".to_string())
                .await;
            return true;
        }

        let resolution = resolve_in(&state, idx);
        if resolution.can_run {
            state.waits.remove(&id);
            telemetry::record_dependency_wait("released");
            self.begin_run(&mut state, idx, TriggerSource::DependencyWait, &resolution, now)
                .await;
            return true;
        }

        let still_waiting = resolution.defers_under(state.jobs[idx].dependency_strategy);
        if still_waiting && !timed_out {
            return false;
        }

        state.waits.remove(&id);
        if still_waiting {
            telemetry::record_dependency_wait("timed_out");
            state.jobs[idx].append_log(now, format!("dependency wait timed out: {resolution}"));
            self.persist(&state).await;
            warn!(reason = %resolution, "Dependency wait timed out");
        } else {
            telemetry::record_trigger_skipped("dependencies");
            self.skip(&mut state, idx, now, resolution.reason).await;
        }
        true
    }
}

async fn wait_for_dependencies(
    inner: Weak<Inner>,
    id: JobId,
    deadline: Instant,
    mut receiver: broadcast::Receiver<JobId>,
) {
    loop {
        let timed_out = tokio::select! {
            _ = tokio::time::sleep_until(deadline) => true,
            changed = receiver.recv() => match changed {
                Ok(changed) if changed == id => continue,
                Ok(_) | Err(RecvError::Lagged(_)) => false,
                Err(RecvError::Closed) => return,
            },
        };

        let Some(manager) = inner.upgrade().map(ScheduleManager::from_inner) else {
            return;
        };
        if manager.resume_wait(id, timed_out).await {
            return;
        }
    }
}

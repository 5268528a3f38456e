// Scheduler: job registry, trigger arming and run orchestration
//
// One in-memory registry per process. Recurrence timers and dependency waits
// are independent tasks that may fire concurrently for different jobs; for a
// single job the `running` status is the only guard against a second worker.

mod orchestrator;
mod registry;
mod trigger;

pub use orchestrator::TriggerOutcome;
pub use registry::validate_definition;

use crate::models::{Job, JobId};
use crate::notification::Notifier;
use crate::store::ConfigStore;
use crate::worker::WorkerLauncher;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::error;

const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Handle to the scheduler. Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct ScheduleManager {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<RegistryState>,
    store: Arc<dyn ConfigStore>,
    launcher: Arc<dyn WorkerLauncher>,
    notifier: Arc<dyn Notifier>,
    /// Carries the id of every job whose recorded status or last run changed
    status_tx: broadcast::Sender<JobId>,
}

#[derive(Default)]
struct RegistryState {
    jobs: Vec<Job>,
    triggers: HashMap<JobId, JoinHandle<()>>,
    waits: HashMap<JobId, JoinHandle<()>>,
    started: bool,
}

impl RegistryState {
    fn index_of(&self, id: &JobId) -> Option<usize> {
        self.jobs.iter().position(|job| job.id == *id)
    }

    fn job(&self, id: &JobId) -> Option<&Job> {
        self.jobs.iter().find(|job| job.id == *id)
    }
}

impl ScheduleManager {
    fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// Receive the id of each job whose status changes
    pub fn subscribe(&self) -> broadcast::Receiver<JobId> {
        self.inner.status_tx.subscribe()
    }

    fn publish_status(&self, id: JobId) {
        // No receivers is the normal case when nothing waits
        let _ = self.inner.status_tx.send(id);
    }

    /// Write the full job list. Failures are logged and otherwise ignored;
    /// memory stays authoritative until the next successful save.
    async fn persist(&self, state: &RegistryState) {
        if let Err(e) = self.inner.store.save(&state.jobs).await {
            error!(error = %e, job_count = state.jobs.len(), "Failed to persist job store");
        }
    }
}

impl std::fmt::Debug for ScheduleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleManager").finish_non_exhaustive()
    }
}

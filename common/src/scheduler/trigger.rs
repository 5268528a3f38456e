// Recurrence timers
//
// One task per armed job. It sleeps until the next occurrence, hands the
// trigger to a detached task and computes the following occurrence. Tasks hold
// a weak reference so a dropped manager ends them.

use super::{Inner, RegistryState, ScheduleManager};
use crate::models::{JobId, TriggerSource};
use crate::telemetry;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

impl ScheduleManager {
    /// Arm the recurrence timer of `id`, replacing any timer already armed
    pub(super) fn arm(&self, state: &mut RegistryState, id: JobId) {
        let handle = tokio::spawn(run_timer(Arc::downgrade(&self.inner), id));
        if let Some(previous) = state.triggers.insert(id, handle) {
            previous.abort();
        }
        telemetry::set_jobs_armed(state.triggers.len());
    }

    /// Disarm the timer of `id`; a no-op when none is armed
    pub(super) fn disarm(&self, state: &mut RegistryState, id: &JobId) -> bool {
        let Some(handle) = state.triggers.remove(id) else {
            return false;
        };
        handle.abort();
        telemetry::set_jobs_armed(state.triggers.len());
        true
    }

    /// Next occurrence strictly after both now and `cursor`, recorded as the
    /// job's `next_run_at`. `None` ends the timer.
    async fn next_fire(&self, id: JobId, cursor: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        let mut state = self.inner.state.lock().await;
        let idx = state.index_of(&id)?;
        let job = &mut state.jobs[idx];
        if job.is_disabled() {
            return None;
        }

        let now = Utc::now();
        let after = cursor.map_or(now, |cursor| cursor.max(now));
        match job.recurrence.next_after(after) {
            Ok(next) => {
                job.next_run_at = Some(next);
                Some(next)
            }
            Err(e) => {
                warn!(job_id = %id, error = %e, "No further occurrence, timer ends");
                job.next_run_at = None;
                None
            }
        }
    }
}

async fn run_timer(inner: Weak<Inner>, id: JobId) {
    let mut cursor = None;
    loop {
        let Some(manager) = inner.upgrade().map(ScheduleManager::from_inner) else {
            return;
        };
        let Some(next) = manager.next_fire(id, cursor).await else {
            return;
        };
        drop(manager);

        let delay = (next - Utc::now()).to_std().unwrap_or_default();
        debug!(job_id = %id, next_run_at = %next, delay_ms = delay.as_millis() as u64, "Timer armed");
        tokio::time::sleep(delay).await;
        cursor = Some(next);

        let Some(manager) = inner.upgrade().map(ScheduleManager::from_inner) else {
            return;
        };
        // Detached so that disarming this timer never cancels a trigger midway
        tokio::spawn(async move {
            if let Err(e) = manager.trigger(id, TriggerSource::Schedule).await {
                error!(job_id = %id, error = %e, "Scheduled trigger failed");
            }
        });
    }
}

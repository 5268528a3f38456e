// Run-time dependency resolution
//
// A pure read of recorded status: nothing here triggers a dependency. Each
// dependency's own schedule is expected to move its status forward.

use crate::models::{DependencyStrategy, Job, JobId, RunOutcome};
use std::fmt;

/// Why a dependency check did not come back clear
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blocker {
    /// The id no longer resolves to a job (deleted after validation)
    Missing(JobId),
    /// Never ran, or running right now
    Pending(Vec<JobId>),
    /// Last recorded run failed
    Failed(Vec<JobId>),
}

impl Blocker {
    pub fn kind(&self) -> &'static str {
        match self {
            Blocker::Missing(_) => "missing",
            Blocker::Pending(_) => "pending",
            Blocker::Failed(_) => "failed",
        }
    }
}

/// Go/no-go decision for one trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub can_run: bool,
    pub reason: String,
    pub blocker: Option<Blocker>,
}

impl Resolution {
    fn clear(reason: impl Into<String>) -> Self {
        Self {
            can_run: true,
            reason: reason.into(),
            blocker: None,
        }
    }

    fn blocked(reason: String, blocker: Blocker) -> Self {
        Self {
            can_run: false,
            reason,
            blocker: Some(blocker),
        }
    }

    /// Whether the orchestrator should park the trigger in a dependency wait
    /// instead of skipping it. Missing dependencies never wait.
    pub fn defers_under(&self, strategy: DependencyStrategy) -> bool {
        strategy == DependencyStrategy::Wait
            && !self.can_run
            && matches!(
                self.blocker,
                Some(Blocker::Pending(_)) | Some(Blocker::Failed(_))
            )
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Evaluate `job`'s dependencies against recorded status.
///
/// Dependencies are visited in list order. A missing id stops evaluation at
/// once; otherwise pending and failed dependencies are collected and pending
/// takes precedence over failed.
pub fn resolve<'a, F>(job: &Job, lookup: F) -> Resolution
where
    F: Fn(&JobId) -> Option<&'a Job>,
{
    if job.dependencies.is_empty() {
        return Resolution::clear("no dependencies");
    }

    let mut pending: Vec<&Job> = Vec::new();
    let mut failed: Vec<&Job> = Vec::new();

    for dep_id in &job.dependencies {
        let Some(dep) = lookup(dep_id) else {
            return Resolution::blocked(
                format!("dependency {dep_id} no longer exists"),
                Blocker::Missing(*dep_id),
            );
        };

        if dep.is_running() {
            pending.push(dep);
            continue;
        }
        match dep.last_run.as_ref().map(|run| run.outcome) {
            None => pending.push(dep),
            Some(RunOutcome::Failed) => failed.push(dep),
            Some(RunOutcome::Completed) => {}
        }
    }

    if !pending.is_empty() {
        return Resolution::blocked(
            format!("dependencies not finished: {}", describe(&pending)),
            Blocker::Pending(pending.iter().map(|j| j.id).collect()),
        );
    }

    if !failed.is_empty() {
        let names = describe(&failed);
        let ids = failed.iter().map(|j| j.id).collect();
        return match job.dependency_strategy {
            DependencyStrategy::Fail => {
                Resolution::blocked(format!("dependencies failed: {names}"), Blocker::Failed(ids))
            }
            DependencyStrategy::Skip => {
                Resolution::clear(format!("ignoring failed dependencies: {names}"))
            }
            DependencyStrategy::Wait => Resolution::blocked(
                format!("dependencies failed, waiting for a successful run: {names}"),
                Blocker::Failed(ids),
            ),
        };
    }

    Resolution::clear("all dependencies completed")
}

fn describe(jobs: &[&Job]) -> String {
    jobs.iter()
        .map(|job| format!("{} ({})", job.name, job.id))
        .collect::<Vec<_>>()
        .join(", ")
}

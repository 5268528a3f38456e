use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque job identifier, assigned at creation and never changed.
pub type JobId = Uuid;

// Helper functions for Tz serialization
fn serialize_tz<S>(tz: &Tz, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(tz.name())
}

fn deserialize_tz<'de, D>(deserializer: D) -> Result<Tz, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Tz::from_str(&s).map_err(serde::de::Error::custom)
}

fn default_timeout_minutes() -> u32 {
    60
}

fn default_batch_size() -> u32 {
    1000
}

fn default_enabled() -> bool {
    true
}

// ============================================================================
// Job Models
// ============================================================================

/// Job is a persisted, recurring migration definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub recurrence: Recurrence,
    pub source_environment: Environment,
    pub target_environment: Environment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_credentials: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_credentials: Option<String>,
    #[serde(default)]
    pub params: ExecutionParams,
    #[serde(default)]
    pub dependencies: Vec<JobId>,
    #[serde(default)]
    pub dependency_strategy: DependencyStrategy,
    #[serde(default = "default_timeout_minutes")]
    pub dependency_timeout_minutes: u32,
    pub status: JobStatus,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    /// Outcome of the most recent finished run, kept while the job is disabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<LastRun>,
    #[serde(default)]
    pub log: Vec<LogEntry>,
    #[serde(default)]
    pub notifications: NotificationTargets,
    /// A stop arrived while a worker was in flight; applied when it exits
    #[serde(default)]
    pub stop_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a job from creation input. Validation happens in the registry.
    pub fn from_new(new: NewJob, now: DateTime<Utc>) -> Self {
        let status = if new.enabled {
            JobStatus::Scheduled
        } else {
            JobStatus::Disabled
        };

        Self {
            id: new.id.unwrap_or_else(Uuid::new_v4),
            name: new.name,
            recurrence: new.recurrence,
            source_environment: new.source_environment,
            target_environment: new.target_environment,
            source_credentials: new.source_credentials,
            target_credentials: new.target_credentials,
            params: new.params,
            dependencies: dedup_preserving_order(new.dependencies),
            dependency_strategy: new.dependency_strategy,
            dependency_timeout_minutes: new.dependency_timeout_minutes,
            status,
            last_run_at: None,
            next_run_at: None,
            last_run: None,
            log: Vec::new(),
            notifications: new.notifications,
            stop_requested: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a partial update. Returns (dependencies_changed, recurrence_changed).
    pub fn apply_update(&mut self, update: JobUpdate) -> (bool, bool) {
        let mut dependencies_changed = false;
        let mut recurrence_changed = false;

        if let Some(name) = update.name {
            self.name = name;
        }
        if let Some(recurrence) = update.recurrence {
            recurrence_changed = recurrence != self.recurrence;
            self.recurrence = recurrence;
        }
        if let Some(env) = update.source_environment {
            self.source_environment = env;
        }
        if let Some(env) = update.target_environment {
            self.target_environment = env;
        }
        if let Some(credentials) = update.source_credentials {
            self.source_credentials = credentials;
        }
        if let Some(credentials) = update.target_credentials {
            self.target_credentials = credentials;
        }
        if let Some(params) = update.params {
            self.params = params;
        }
        if let Some(dependencies) = update.dependencies {
            dependencies_changed = true;
            self.dependencies = dedup_preserving_order(dependencies);
        }
        if let Some(strategy) = update.dependency_strategy {
            self.dependency_strategy = strategy;
        }
        if let Some(minutes) = update.dependency_timeout_minutes {
            self.dependency_timeout_minutes = minutes;
        }
        if let Some(notifications) = update.notifications {
            self.notifications = notifications;
        }

        (dependencies_changed, recurrence_changed)
    }

    pub fn append_log(&mut self, at: DateTime<Utc>, message: impl Into<String>) {
        self.log.push(LogEntry {
            at,
            message: message.into(),
        });
    }

    /// The last `n` log entries, oldest first
    pub fn recent_log(&self, n: usize) -> &[LogEntry] {
        let start = self.log.len().saturating_sub(n);
        &self.log[start..]
    }

    pub fn is_disabled(&self) -> bool {
        self.status == JobStatus::Disabled
    }

    pub fn is_running(&self) -> bool {
        self.status == JobStatus::Running
    }
}

fn dedup_preserving_order(ids: Vec<JobId>) -> Vec<JobId> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

/// Recurrence is a cron expression evaluated in an IANA timezone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    pub expression: String,
    #[serde(serialize_with = "serialize_tz", deserialize_with = "deserialize_tz")]
    pub timezone: Tz,
}

impl Recurrence {
    pub fn new(expression: impl Into<String>, timezone: Tz) -> Self {
        Self {
            expression: expression.into(),
            timezone,
        }
    }
}

/// Environment a migration reads from or writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    Production,
    Custom,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
            Environment::Custom => "custom",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" => Ok(Environment::Development),
            "staging" => Ok(Environment::Staging),
            "production" => Ok(Environment::Production),
            "custom" => Ok(Environment::Custom),
            other => Err(format!("unknown environment: {other}")),
        }
    }
}

/// Parameters handed to the worker untouched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionParams {
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default)]
    pub collections: Vec<String>,
    /// JSON query filter, passed through as text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default)]
    pub include_indexes: bool,
    #[serde(default)]
    pub transform: bool,
    #[serde(default)]
    pub backup: bool,
}

impl Default for ExecutionParams {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            collections: Vec::new(),
            query: None,
            include_indexes: false,
            transform: false,
            backup: false,
        }
    }
}

/// How a job reacts when a dependency's last run failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyStrategy {
    #[default]
    Fail,
    Skip,
    Wait,
}

impl fmt::Display for DependencyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DependencyStrategy::Fail => "fail",
            DependencyStrategy::Skip => "skip",
            DependencyStrategy::Wait => "wait",
        };
        write!(f, "{s}")
    }
}

/// JobStatus represents the lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
    Disabled,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Disabled => "disabled",
        };
        write!(f, "{s}")
    }
}

/// Terminal result of a single run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Completed,
    Failed,
}

impl RunOutcome {
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            RunOutcome::Completed
        } else {
            RunOutcome::Failed
        }
    }

    pub fn as_status(self) -> JobStatus {
        match self {
            RunOutcome::Completed => JobStatus::Completed,
            RunOutcome::Failed => JobStatus::Failed,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_status().fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastRun {
    pub outcome: RunOutcome,
    pub exit_code: Option<i32>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationTargets {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

impl NotificationTargets {
    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.webhook_url.is_none()
    }
}

/// What caused the per-trigger algorithm to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Schedule,
    Manual,
    DependencyWait,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerSource::Schedule => "schedule",
            TriggerSource::Manual => "manual",
            TriggerSource::DependencyWait => "dependency wait",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// Registry inputs
// ============================================================================

/// Input for creating a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    /// Preassigned id, used when importing existing definitions
    #[serde(default)]
    pub id: Option<JobId>,
    pub name: String,
    pub recurrence: Recurrence,
    pub source_environment: Environment,
    pub target_environment: Environment,
    #[serde(default)]
    pub source_credentials: Option<String>,
    #[serde(default)]
    pub target_credentials: Option<String>,
    #[serde(default)]
    pub params: ExecutionParams,
    #[serde(default)]
    pub dependencies: Vec<JobId>,
    #[serde(default)]
    pub dependency_strategy: DependencyStrategy,
    #[serde(default = "default_timeout_minutes")]
    pub dependency_timeout_minutes: u32,
    #[serde(default)]
    pub notifications: NotificationTargets,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl NewJob {
    /// Minimal definition with defaults for everything optional
    pub fn new(
        name: impl Into<String>,
        recurrence: Recurrence,
        source_environment: Environment,
        target_environment: Environment,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            recurrence,
            source_environment,
            target_environment,
            source_credentials: None,
            target_credentials: None,
            params: ExecutionParams::default(),
            dependencies: Vec::new(),
            dependency_strategy: DependencyStrategy::default(),
            dependency_timeout_minutes: default_timeout_minutes(),
            notifications: NotificationTargets::default(),
            enabled: true,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<JobId>, strategy: DependencyStrategy) -> Self {
        self.dependencies = dependencies;
        self.dependency_strategy = strategy;
        self
    }
}

/// Partial update; `None` leaves the field untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobUpdate {
    pub name: Option<String>,
    pub recurrence: Option<Recurrence>,
    pub source_environment: Option<Environment>,
    pub target_environment: Option<Environment>,
    pub source_credentials: Option<Option<String>>,
    pub target_credentials: Option<Option<String>>,
    pub params: Option<ExecutionParams>,
    pub dependencies: Option<Vec<JobId>>,
    pub dependency_strategy: Option<DependencyStrategy>,
    pub dependency_timeout_minutes: Option<u32>,
    pub notifications: Option<NotificationTargets>,
}

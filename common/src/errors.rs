// Error handling framework
// One enum per concern; registry mutations surface ValidationError, everything
// that happens behind a trigger is logged instead of returned.

use crate::models::JobId;
use thiserror::Error;

/// Schedule-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("No next execution time available for expression '{expression}'")]
    NoNextExecution { expression: String },
}

/// Validation errors raised synchronously by registry mutations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },

    #[error("Job {job_id} depends on unknown job {dependency_id}")]
    UnknownDependency { job_id: JobId, dependency_id: JobId },

    #[error("Cyclic dependency detected: {}", render_path(.path))]
    CyclicDependency { path: Vec<JobId> },

    #[error("Source and target environment must differ unless both are custom")]
    SameEnvironment,

    #[error("Custom {side} environment requires a credential reference")]
    MissingCredentials { side: String },

    #[error("Invalid recurrence: {0}")]
    InvalidRecurrence(#[from] ScheduleError),
}

fn render_path(path: &[JobId]) -> String {
    path.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Errors returned by the job registry's CRUD surface
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Configuration store errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Filesystem error: {0}")]
    FileSystemError(String),

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Unsupported store document version: {0}")]
    UnsupportedVersion(u32),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Worker process errors
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Failed to prepare run artifact {path}: {reason}")]
    ArtifactFailed { path: String, reason: String },

    #[error("Failed to wait for worker: {0}")]
    WaitFailed(String),
}

/// Notification delivery errors
#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Webhook delivery to {url} failed: {reason}")]
    WebhookFailed { url: String, reason: String },

    #[error("Email delivery to {recipient} failed: {reason}")]
    EmailFailed { recipient: String, reason: String },

    #[error("Invalid notification payload: {0}")]
    InvalidPayload(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::FileSystemError(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::InvalidJson(err.to_string())
    }
}

impl From<serde_json::Error> for NotificationError {
    fn from(err: serde_json::Error) -> Self {
        NotificationError::InvalidPayload(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_schedule_error_display() {
        let err = ScheduleError::InvalidCronExpression {
            expression: "* * * *".to_string(),
            reason: "invalid format".to_string(),
        };
        assert!(err.to_string().contains("Invalid cron expression"));
    }

    #[test]
    fn test_cycle_error_renders_full_path() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let err = ValidationError::CyclicDependency {
            path: vec![a, b, a],
        };
        assert_eq!(
            err.to_string(),
            format!("Cyclic dependency detected: {a} -> {b} -> {a}")
        );
    }

    #[test]
    fn test_registry_error_is_transparent_over_validation() {
        let err: RegistryError = ValidationError::SameEnvironment.into();
        assert_eq!(err.to_string(), ValidationError::SameEnvironment.to_string());
    }

    #[test]
    fn test_recurrence_error_wraps_schedule_error() {
        let err: ValidationError = ScheduleError::InvalidTimezone("Mars/Base".to_string()).into();
        assert!(err.to_string().contains("Mars/Base"));
    }
}

// Configuration management with layered configuration (file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub notification: NotificationConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// JSON document holding the job list
    pub store_path: String,
    /// Directory for per-run stdout/stderr artifacts
    pub log_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Executable spawned for every run
    pub program: String,
    /// Fixed arguments placed before the per-run arguments
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub webhook_timeout_seconds: u64,
    /// HMAC-SHA256 key for signing webhook bodies
    #[serde(default)]
    pub webhook_secret: Option<String>,
    pub max_attempts: u32,
    #[serde(default = "default_email_enabled")]
    pub email_enabled: bool,
    pub sendmail_path: String,
    pub from_address: String,
}

fn default_email_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    #[serde(default)]
    pub metrics_port: Option<u16>,
    #[serde(default)]
    pub tracing_endpoint: Option<String>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let defaults = Config::try_from(&Settings::default())?;

        let builder = Config::builder()
            // Built-in defaults so a bare environment still yields a full config
            .add_source(defaults)
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            // e.g. APP__WORKER__PROGRAM=/usr/local/bin/migrate
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.scheduler.store_path.is_empty() {
            return Err("Scheduler store_path cannot be empty".to_string());
        }
        if self.scheduler.log_dir.is_empty() {
            return Err("Scheduler log_dir cannot be empty".to_string());
        }

        if self.worker.program.is_empty() {
            return Err("Worker program cannot be empty".to_string());
        }

        if self.notification.webhook_timeout_seconds == 0 {
            return Err("Notification webhook_timeout_seconds must be greater than 0".to_string());
        }
        if self.notification.max_attempts == 0 {
            return Err("Notification max_attempts must be greater than 0".to_string());
        }
        if self.notification.email_enabled {
            if self.notification.sendmail_path.is_empty() {
                return Err("Notification sendmail_path cannot be empty".to_string());
            }
            if !crate::notification::email::is_valid_address(&self.notification.from_address) {
                return Err(format!(
                    "Notification from_address '{}' is not a valid email address",
                    self.notification.from_address
                ));
            }
        }

        if self.observability.metrics_port == Some(0) {
            return Err("Observability metrics_port must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig {
                store_path: "data/jobs.json".to_string(),
                log_dir: "logs/runs".to_string(),
            },
            worker: WorkerConfig {
                program: "migration-worker".to_string(),
                args: Vec::new(),
                working_dir: None,
            },
            notification: NotificationConfig {
                webhook_timeout_seconds: 10,
                webhook_secret: None,
                max_attempts: 3,
                email_enabled: true,
                sendmail_path: "/usr/sbin/sendmail".to_string(),
                from_address: "migrations@localhost".to_string(),
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: None,
                tracing_endpoint: None,
            },
        }
    }
}

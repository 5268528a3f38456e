// Notification dispatcher
//
// Fired after every finished run. Each channel is optional per job and
// delivery failures are logged only; they never touch job status.

pub mod email;
pub mod webhook;

use crate::config::NotificationConfig;
use crate::errors::NotificationError;
use crate::models::{Environment, Job, NotificationTargets, RunOutcome};
use crate::worker::RunArtifacts;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, instrument};

pub use email::{EmailChannel, MailTransport, SendmailTransport};
pub use webhook::WebhookChannel;

/// Message describing one finished run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunNotification {
    pub job_id: uuid::Uuid,
    pub job_name: String,
    pub outcome: RunOutcome,
    pub exit_code: Option<i32>,
    pub source_environment: Environment,
    pub target_environment: Environment,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<RunArtifacts>,
    /// Set when the worker could not be launched or awaited
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub targets: NotificationTargets,
}

impl RunNotification {
    pub fn for_run(
        job: &Job,
        outcome: RunOutcome,
        exit_code: Option<i32>,
        finished_at: DateTime<Utc>,
        artifacts: Option<RunArtifacts>,
        error: Option<String>,
    ) -> Self {
        Self {
            job_id: job.id,
            job_name: job.name.clone(),
            outcome,
            exit_code,
            source_environment: job.source_environment,
            target_environment: job.target_environment,
            started_at: job.last_run_at,
            finished_at,
            artifacts,
            error,
            targets: job.notifications.clone(),
        }
    }

    pub(crate) fn exit_code_text(&self) -> String {
        self.exit_code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "none".to_string())
    }
}

/// Notifier receives every finished run
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &RunNotification);
}

/// Drops every notification; used when nothing is configured
#[derive(Debug, Default, Clone)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, notification: &RunNotification) {
        debug!(job_id = %notification.job_id, "Notification dropped, no channels configured");
    }
}

/// Fans a run notification out to the channels the job asks for
pub struct NotificationDispatcher {
    webhook: Option<WebhookChannel>,
    email: Option<EmailChannel>,
}

impl NotificationDispatcher {
    pub fn new(webhook: Option<WebhookChannel>, email: Option<EmailChannel>) -> Self {
        Self { webhook, email }
    }

    /// Build both channels from configuration
    pub fn from_config(config: &NotificationConfig) -> Result<Self, NotificationError> {
        let webhook = WebhookChannel::from_config(config)?;
        let email = config.email_enabled.then(|| {
            EmailChannel::new(
                config.from_address.clone(),
                Box::new(SendmailTransport::new(config.sendmail_path.clone())),
            )
        });
        Ok(Self::new(Some(webhook), email))
    }
}

#[async_trait]
impl Notifier for NotificationDispatcher {
    #[instrument(skip_all, fields(job_id = %notification.job_id, outcome = %notification.outcome))]
    async fn notify(&self, notification: &RunNotification) {
        let targets = &notification.targets;
        if targets.is_empty() {
            debug!("Job has no notification targets");
            return;
        }

        let webhook = async {
            match (&self.webhook, &targets.webhook_url) {
                (Some(channel), Some(url)) => {
                    if let Err(e) = channel.send(url, notification).await {
                        error!(error = %e, url = %url, "Webhook notification failed");
                    }
                }
                (None, Some(url)) => debug!(url = %url, "Webhook channel disabled, skipping"),
                _ => {}
            }
        };

        let email = async {
            match (&self.email, &targets.email) {
                (Some(channel), Some(recipient)) => {
                    if let Err(e) = channel.send(recipient, notification).await {
                        error!(error = %e, recipient = %recipient, "Email notification failed");
                    }
                }
                (None, Some(recipient)) => {
                    debug!(recipient = %recipient, "Email channel disabled, skipping")
                }
                _ => {}
            }
        };

        futures::join!(webhook, email);
    }
}

// Email notification channel

use super::RunNotification;
use crate::errors::NotificationError;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

lazy_static! {
    static ref ADDRESS_REGEX: Regex =
        Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(\.[A-Za-z0-9\-]+)*$").unwrap();
}

/// Loose syntactic check of a mailbox address
pub fn is_valid_address(address: &str) -> bool {
    ADDRESS_REGEX.is_match(address)
}

/// A rendered plain-text email
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl MailMessage {
    /// RFC 5322 text with headers, as fed to sendmail
    pub fn to_rfc5322(&self) -> String {
        format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}",
            self.from,
            self.to,
            self.subject,
            self.body.replace('\n', "\r\n")
        )
    }
}

/// MailTransport hands a rendered message to the local mail system
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn deliver(&self, message: &MailMessage) -> Result<(), NotificationError>;
}

/// Pipes messages into `sendmail -t -i`
#[derive(Debug, Clone)]
pub struct SendmailTransport {
    program: String,
}

impl SendmailTransport {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl MailTransport for SendmailTransport {
    async fn deliver(&self, message: &MailMessage) -> Result<(), NotificationError> {
        let failed = |reason: String| NotificationError::EmailFailed {
            recipient: message.to.clone(),
            reason,
        };

        let mut child = Command::new(&self.program)
            .args(["-t", "-i"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| failed(format!("failed to start {}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(message.to_rfc5322().as_bytes())
                .await
                .map_err(|e| failed(e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !output.status.success() {
            return Err(failed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Renders run notifications as plain-text mail
pub struct EmailChannel {
    from: String,
    transport: Box<dyn MailTransport>,
}

impl EmailChannel {
    pub fn new(from: String, transport: Box<dyn MailTransport>) -> Self {
        Self { from, transport }
    }

    pub fn render(&self, recipient: &str, notification: &RunNotification) -> MailMessage {
        // Header text, so line breaks cannot start a new header
        let job_name: String = notification
            .job_name
            .chars()
            .map(|c| if c.is_control() { ' ' } else { c })
            .collect();
        let subject = format!("[migration] {} {}", job_name, notification.outcome);

        let mut body = format!(
            "Job: {}\nJob ID: {}\nOutcome: {}\nExit code: {}\nSource: {}\nTarget: {}\nFinished at: {}\n",
            notification.job_name,
            notification.job_id,
            notification.outcome,
            notification.exit_code_text(),
            notification.source_environment,
            notification.target_environment,
            notification.finished_at.to_rfc3339(),
        );
        if let Some(started_at) = notification.started_at {
            body.push_str(&format!("Started at: {}\n", started_at.to_rfc3339()));
        }
        if let Some(artifacts) = &notification.artifacts {
            body.push_str(&format!(
                "Stdout: {}\nStderr: {}\n",
                artifacts.stdout.display(),
                artifacts.stderr.display()
            ));
        }
        if let Some(error) = &notification.error {
            body.push_str(&format!("Error: {error}\n"));
        }

        MailMessage {
            from: self.from.clone(),
            to: recipient.to_string(),
            subject,
            body,
        }
    }

    #[instrument(skip(self, notification), fields(job_id = %notification.job_id))]
    pub async fn send(&self, recipient: &str, notification: &RunNotification) -> Result<(), NotificationError> {
        let message = self.render(recipient, notification);
        self.transport.deliver(&message).await?;
        debug!("Email notification handed to transport");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Environment, Job, NewJob, Recurrence, RunOutcome};
    use crate::worker::RunArtifacts;
    use chrono::Utc;
    use std::path::Path;

    fn notification() -> RunNotification {
        let job = Job::from_new(
            NewJob::new(
                "inventory",
                Recurrence::new("0 0 * * 0", chrono_tz::UTC),
                Environment::Staging,
                Environment::Production,
            ),
            Utc::now(),
        );
        let artifacts = RunArtifacts::for_run(Path::new("/tmp/runs"), job.id, Utc::now());
        RunNotification::for_run(&job, RunOutcome::Failed, Some(4), Utc::now(), Some(artifacts), None)
    }

    #[test]
    fn test_address_validation() {
        assert!(is_valid_address("ops@example.com"));
        assert!(is_valid_address("first.last+tag@sub.example.org"));
        assert!(is_valid_address("migrations@localhost"));
        assert!(!is_valid_address("not-an-address"));
        assert!(!is_valid_address("two@@example.com"));
        assert!(!is_valid_address("spaces in@example.com"));
    }

    #[test]
    fn test_render_includes_run_details() {
        let channel = EmailChannel::new(
            "migrations@example.com".to_string(),
            Box::new(MockMailTransport::new()),
        );
        let n = notification();
        let message = channel.render("dba@example.com", &n);

        assert_eq!(message.subject, "[migration] inventory failed");
        assert!(message.body.contains(&format!("Job ID: {}", n.job_id)));
        assert!(message.body.contains("Exit code: 4"));
        assert!(message.body.contains("Source: staging"));
        assert!(message.body.contains("Target: production"));
        assert!(message.body.contains("Stdout: /tmp/runs/"));

        let raw = message.to_rfc5322();
        assert!(raw.starts_with("From: migrations@example.com\r\nTo: dba@example.com\r\n"));
    }

    #[test]
    fn test_line_breaks_in_job_name_stay_inside_subject() {
        let channel = EmailChannel::new(
            "migrations@example.com".to_string(),
            Box::new(MockMailTransport::new()),
        );
        let mut n = notification();
        n.job_name = "nightly\r\nBcc: attacker@evil.example".to_string();

        let raw = channel.render("dba@example.com", &n).to_rfc5322();
        let (headers, _) = raw.split_once("\r\n\r\n").unwrap();
        let headers: Vec<&str> = headers.split("\r\n").collect();

        assert_eq!(headers.len(), 4);
        assert!(headers.iter().all(|h| !h.starts_with("Bcc:")));
        assert!(headers[2].starts_with("Subject: [migration] nightly"));
    }

    #[tokio::test]
    async fn test_send_delivers_through_transport() {
        let mut transport = MockMailTransport::new();
        transport
            .expect_deliver()
            .withf(|m| m.to == "dba@example.com" && m.subject.contains("inventory"))
            .times(1)
            .returning(|_| Ok(()));

        let channel = EmailChannel::new("migrations@example.com".to_string(), Box::new(transport));
        channel.send("dba@example.com", &notification()).await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_failure_is_returned() {
        let mut transport = MockMailTransport::new();
        transport.expect_deliver().returning(|m| {
            Err(NotificationError::EmailFailed {
                recipient: m.to.clone(),
                reason: "mailbox unavailable".to_string(),
            })
        });

        let channel = EmailChannel::new("migrations@example.com".to_string(), Box::new(transport));
        let err = channel.send("dba@example.com", &notification()).await.unwrap_err();
        assert!(err.to_string().contains("mailbox unavailable"));
    }

    #[tokio::test]
    async fn test_missing_sendmail_binary_fails() {
        let transport = SendmailTransport::new("/nonexistent/sendmail");
        let message = MailMessage {
            from: "a@example.com".to_string(),
            to: "b@example.com".to_string(),
            subject: "s".to_string(),
            body: "b".to_string(),
        };
        assert!(matches!(
            transport.deliver(&message).await,
            Err(NotificationError::EmailFailed { .. })
        ));
    }
}

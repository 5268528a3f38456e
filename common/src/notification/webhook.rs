// Webhook notification channel

use super::RunNotification;
use crate::config::NotificationConfig;
use crate::errors::NotificationError;
use crate::retry::{retry_with, ExponentialBackoff, RetryStrategy};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, instrument};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC-SHA256 of the request body
pub const SIGNATURE_HEADER: &str = "X-Migration-Signature";

/// Compute the hex-encoded HMAC-SHA256 signature of `payload`
pub fn sign_payload(payload: &[u8], secret: &str) -> Result<String, NotificationError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| NotificationError::InvalidPayload(format!("invalid signing key: {e}")))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Check a signature produced by [`sign_payload`], for receivers
pub fn verify_signature(payload: &[u8], signature: &str, secret: &str) -> bool {
    let Ok(bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&bytes).is_ok()
}

/// Posts the run payload as JSON to the job's webhook URL
pub struct WebhookChannel {
    client: reqwest::Client,
    secret: Option<String>,
    retry: Box<dyn RetryStrategy>,
}

impl WebhookChannel {
    pub fn new(
        timeout: Duration,
        secret: Option<String>,
        retry: Box<dyn RetryStrategy>,
    ) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotificationError::WebhookFailed {
                url: String::new(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            secret,
            retry,
        })
    }

    pub fn from_config(config: &NotificationConfig) -> Result<Self, NotificationError> {
        Self::new(
            Duration::from_secs(config.webhook_timeout_seconds),
            config.webhook_secret.clone(),
            Box::new(ExponentialBackoff::new(config.max_attempts)),
        )
    }

    #[instrument(skip(self, notification), fields(job_id = %notification.job_id))]
    pub async fn send(&self, url: &str, notification: &RunNotification) -> Result<(), NotificationError> {
        let body = serde_json::to_vec(notification)?;
        let signature = match &self.secret {
            Some(secret) => Some(sign_payload(&body, secret)?),
            None => None,
        };

        retry_with(self.retry.as_ref(), "Webhook delivery", || {
            self.post_once(url, body.clone(), signature.as_deref())
        })
        .await?;

        debug!("Webhook notification delivered");
        Ok(())
    }

    async fn post_once(
        &self,
        url: &str,
        body: Vec<u8>,
        signature: Option<&str>,
    ) -> Result<(), NotificationError> {
        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(signature) = signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = request.send().await.map_err(|e| NotificationError::WebhookFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(NotificationError::WebhookFailed {
                url: url.to_string(),
                reason: format!("HTTP {status}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Environment, Job, NewJob, Recurrence, RunOutcome};
    use crate::retry::FixedDelay;
    use chrono::Utc;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn notification() -> RunNotification {
        let job = Job::from_new(
            NewJob::new(
                "ledger sync",
                Recurrence::new("*/15 * * * *", chrono_tz::UTC),
                Environment::Production,
                Environment::Development,
            ),
            Utc::now(),
        );
        RunNotification::for_run(&job, RunOutcome::Completed, Some(0), Utc::now(), None, None)
    }

    fn channel(secret: Option<&str>, attempts: u32) -> WebhookChannel {
        WebhookChannel::new(
            Duration::from_secs(5),
            secret.map(str::to_string),
            Box::new(FixedDelay::new(Duration::from_millis(5), attempts)),
        )
        .unwrap()
    }

    #[test]
    fn test_sign_and_verify() {
        let signature = sign_payload(b"payload", "secret").unwrap();
        assert_eq!(signature.len(), 64);
        assert!(verify_signature(b"payload", &signature, "secret"));
        assert!(!verify_signature(b"payload!", &signature, "secret"));
        assert!(!verify_signature(b"payload", &signature, "other"));
        assert!(!verify_signature(b"payload", "not-hex", "secret"));
    }

    #[tokio::test]
    async fn test_signed_delivery_carries_valid_signature() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header_exists(SIGNATURE_HEADER))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        channel(Some("s3cret"), 1)
            .send(&format!("{}/hook", server.uri()), &notification())
            .await
            .unwrap();

        let received: Vec<Request> = server.received_requests().await.unwrap();
        let request = &received[0];
        let signature = request
            .headers
            .get(SIGNATURE_HEADER)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(verify_signature(&request.body, signature, "s3cret"));

        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body["job_name"], "ledger sync");
        assert_eq!(body["outcome"], "completed");
    }

    #[tokio::test]
    async fn test_server_errors_are_retried_then_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let err = channel(None, 3)
            .send(&server.uri(), &notification())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("HTTP 503"));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        channel(None, 2)
            .send(&server.uri(), &notification())
            .await
            .unwrap();
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }
}

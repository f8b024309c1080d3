//! callbacks to interested services after a terminal transition

use std::fmt;
use std::thread::{sleep, Builder};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::store::model::{Verification, VerificationStatus};

pub const MAX_DELIVERY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub verification_id: Uuid,
    pub domain: String,
    pub status: VerificationStatus,
    pub service_id: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Verification> for Notification {
    fn from(v: &Verification) -> Self {
        Notification {
            verification_id: v.id,
            domain: v.domain.clone(),
            status: v.status,
            service_id: v.service_id.clone(),
            completed_at: v.completed_at,
        }
    }
}

#[derive(Debug)]
pub enum NotifyError {
    Http(reqwest::Error),
    Status(u16),
}

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyError::Http(e) => write!(f, "webhook request failed: {}", e),
            NotifyError::Status(code) => write!(f, "webhook answered with status {}", code),
        }
    }
}

impl std::error::Error for NotifyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NotifyError::Http(e) => Some(e),
            NotifyError::Status(_) => None,
        }
    }
}

impl From<reqwest::Error> for NotifyError {
    fn from(e: reqwest::Error) -> Self {
        NotifyError::Http(e)
    }
}

/// Fire and forget. Implementations must not block the caller on delivery and
/// must never report failure back into the state machine.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Posts the notification as JSON to a fixed URL from a background thread
#[derive(Clone)]
pub struct WebhookNotifier {
    url: String,
    timeout: Duration,
    backoff: Duration,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> WebhookNotifier {
        WebhookNotifier {
            url: url.to_string(),
            timeout,
            backoff: Duration::from_millis(500),
        }
    }

    /// Base delay between attempts, doubled after each failure
    pub fn with_backoff(mut self, backoff: Duration) -> WebhookNotifier {
        self.backoff = backoff;
        self
    }

    /// Deliver synchronously, returning the number of attempts it took
    pub fn deliver(&self, notification: &Notification) -> Result<u32, NotifyError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;

        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            let result = client
                .post(&self.url)
                .json(notification)
                .send()
                .map_err(NotifyError::from)
                .and_then(|res| {
                    if res.status().is_success() {
                        Ok(())
                    } else {
                        Err(NotifyError::Status(res.status().as_u16()))
                    }
                });

            match result {
                Ok(()) => return Ok(attempt),
                Err(err) if attempt >= MAX_DELIVERY_ATTEMPTS => return Err(err),
                Err(err) => {
                    log::info!(
                        "Webhook attempt {} for {} failed: {}",
                        attempt,
                        notification.verification_id,
                        err
                    );
                    sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
            }
        }
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, notification: Notification) {
        let notifier = self.clone();

        let spawned = Builder::new()
            .name("WebhookNotifier".into())
            .spawn(move || match notifier.deliver(&notification) {
                Ok(attempts) => log::info!(
                    "Notified {} of {} for {} after {} attempt(s)",
                    notifier.url,
                    notification.status,
                    notification.domain,
                    attempts
                ),
                Err(err) => log::warn!(
                    "Giving up notifying {} for {}: {}",
                    notifier.url,
                    notification.domain,
                    err
                ),
            });

        if let Err(err) = spawned {
            log::warn!("Failed to spawn webhook thread: {}", err);
        }
    }
}

/// Used when no webhook is configured
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        log::info!(
            "Verification {} for {} is now {}",
            notification.verification_id,
            notification.domain,
            notification.status
        );
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc::channel;

    fn notification() -> Notification {
        Notification {
            verification_id: Uuid::nil(),
            domain: "example.com".to_string(),
            status: VerificationStatus::Verified,
            service_id: Some("svc-1".to_string()),
            completed_at: None,
        }
    }

    /// Answer each connection with the next status, sending request bodies back
    fn serve(statuses: Vec<u16>) -> (String, std::sync::mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        let (tx, rx) = channel();

        std::thread::spawn(move || {
            for status in statuses {
                let (stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream);

                let mut content_length = 0;
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).unwrap();
                    if line == "\r\n" || line.is_empty() {
                        break;
                    }
                    let lower = line.to_ascii_lowercase();
                    if let Some(value) = lower.strip_prefix("content-length:") {
                        content_length = value.trim().parse().unwrap();
                    }
                }

                let mut body = vec![0; content_length];
                reader.read_exact(&mut body).unwrap();
                tx.send(String::from_utf8(body).unwrap()).unwrap();

                let mut stream = reader.into_inner();
                write!(
                    stream,
                    "HTTP/1.1 {} X\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    status
                )
                .unwrap();
            }
        });

        (url, rx)
    }

    #[test]
    fn test_payload_shape() {
        let json = serde_json::to_value(&notification()).unwrap();

        assert_eq!("00000000-0000-0000-0000-000000000000", json["verificationId"]);
        assert_eq!("verified", json["status"]);
        assert_eq!("svc-1", json["serviceId"]);
        assert!(json["completedAt"].is_null());
    }

    #[test]
    fn test_delivery_retries_until_success() {
        let (url, bodies) = serve(vec![500, 503, 200]);
        let notifier = WebhookNotifier::new(&url, Duration::from_secs(2))
            .with_backoff(Duration::from_millis(10));

        assert_eq!(3, notifier.deliver(&notification()).unwrap());

        let first: serde_json::Value = serde_json::from_str(&bodies.recv().unwrap()).unwrap();
        assert_eq!("example.com", first["domain"]);
        assert_eq!(2, bodies.iter().take(2).count());
    }

    #[test]
    fn test_delivery_gives_up() {
        let (url, _bodies) = serve(vec![500, 500, 500]);
        let notifier = WebhookNotifier::new(&url, Duration::from_secs(2))
            .with_backoff(Duration::from_millis(10));

        assert!(matches!(
            notifier.deliver(&notification()),
            Err(NotifyError::Status(500))
        ));
    }
}

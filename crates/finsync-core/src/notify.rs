//! ntfy notifications.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use crate::config::NotificationConfig;
use crate::ports::{Notification, Notifier, NotifyError, Priority};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct NtfyMessage<'a> {
    message: &'a str,
    priority: &'static str,
}

/// Publishes to `{server}/{topic}`. Without a topic every call is a no-op.
#[derive(Debug, Clone)]
pub struct NtfyNotifier {
    client: Client,
    server: String,
    topic: Option<String>,
}

impl NtfyNotifier {
    pub fn new(server: impl Into<String>, topic: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            server: server.into(),
            topic: topic.filter(|t| !t.trim().is_empty()),
        }
    }

    pub fn from_config(config: &NotificationConfig) -> Self {
        Self::new(&config.ntfy_server, config.ntfy_topic.clone())
    }

    pub fn is_enabled(&self) -> bool {
        self.topic.is_some()
    }
}

#[async_trait]
impl Notifier for NtfyNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let Some(topic) = &self.topic else {
            debug!("ntfy topic not configured, notification dropped");
            return Ok(());
        };

        let url = format!("{}/{}", self.server.trim_end_matches('/'), topic);
        let body = NtfyMessage {
            message: &notification.message,
            priority: match notification.priority {
                Priority::High => "high",
                Priority::Default => "default",
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError(format!("error sending notification: {}", e.without_url())))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(NotifyError(format!(
                "ntfy returned {status}: {}",
                text.trim()
            )));
        }
        debug!(topic = %topic, "notification sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answer one request with `status`, returning the full request text.
    async fn serve_once(status: u16) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 1024];
            // read head, then the JSON body up to its closing brace
            while !request.ends_with(b"}") {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..n]);
            }
            let response =
                format!("HTTP/1.1 {status} Test\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
            String::from_utf8_lossy(&request).into_owned()
        });
        (format!("http://{addr}"), handle)
    }

    #[tokio::test]
    async fn posts_json_to_topic() {
        let (server, request) = serve_once(200).await;
        let notifier = NtfyNotifier::new(server, Some("finance".into()));

        notifier
            .notify(&Notification::warning("Reconnect First Bank"))
            .await
            .unwrap();

        let request = request.await.unwrap();
        assert!(request.starts_with("POST /finance "));
        assert!(request.contains(r#""message":"Reconnect First Bank""#));
        assert!(request.contains(r#""priority":"high""#));
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let (server, _request) = serve_once(500).await;
        let notifier = NtfyNotifier::new(server, Some("finance".into()));
        let err = notifier
            .notify(&Notification::info("hello"))
            .await
            .unwrap_err();
        assert!(err.0.contains("500"));
    }

    #[tokio::test]
    async fn missing_topic_is_a_noop() {
        let notifier = NtfyNotifier::new("http://127.0.0.1:1", None);
        assert!(!notifier.is_enabled());
        notifier.notify(&Notification::info("hello")).await.unwrap();
    }
}

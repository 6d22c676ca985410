use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::Client;

use crate::types::*;

/// A sink that delivers short push messages to the operator.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Publishes a message with the given priority and tag.
    async fn publish(
        &self,
        message: &str,
        priority: Priority,
        tag: &str,
    ) -> Result<(), NotificationError>;
}

/// Publishes notifications to an ntfy.sh topic.
#[derive(Debug, Clone)]
pub struct NtfyClient {
    client: Client,
    base_url: String,
    topic: String,
}

impl NtfyClient {
    /// Creates a client publishing to `topic` on the server at `base_url`.
    pub fn new(base_url: &str, topic: &str) -> Result<Self, NotificationError> {
        if topic.is_empty() || topic.contains('/') {
            return Err(NotificationError::InvalidTopic(topic.to_string()));
        }

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            topic: topic.to_string(),
        })
    }

    /// The topic messages are published to.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl Notifier for NtfyClient {
    async fn publish(
        &self,
        message: &str,
        priority: Priority,
        tag: &str,
    ) -> Result<(), NotificationError> {
        let url = format!("{}/{}", self.base_url, self.topic);
        let mut request = self.client.post(&url).body(message.to_string());

        // ntfy treats a missing header as default priority
        if priority != Priority::Default {
            request = request.header("X-Priority", priority.to_string());
        }
        if !tag.is_empty() {
            request = request.header("X-Tags", tag);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            log::error!("❌ ntfy rejected message for {}: {}", self.topic, status);
            return Err(NotificationError::Rejected(status.as_u16()));
        }

        log::debug!("📣 Published to {}: {}", self.topic, message);
        Ok(())
    }
}

/// Writes notifications to the log only. Used when no ntfy topic is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn publish(
        &self,
        message: &str,
        priority: Priority,
        tag: &str,
    ) -> Result<(), NotificationError> {
        log::info!("📣 {} ({}, {})", message, priority, tag);
        Ok(())
    }
}

/// Mock notifier for development/testing. Records every message it receives.
#[derive(Debug, Default)]
pub struct MockNotifier {
    published: Mutex<Vec<Notification>>,
}

impl MockNotifier {
    /// Creates an empty mock notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything published so far.
    pub fn published(&self) -> Vec<Notification> {
        self.published
            .lock()
            .map(|published| published.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn publish(
        &self,
        message: &str,
        priority: Priority,
        tag: &str,
    ) -> Result<(), NotificationError> {
        log::info!("📣 [MOCK NTFY] {} ({}, {})", message, priority, tag);

        if let Ok(mut published) = self.published.lock() {
            published.push(Notification {
                message: message.to_string(),
                priority,
                tag: tag.to_string(),
            });
        }
        Ok(())
    }
}

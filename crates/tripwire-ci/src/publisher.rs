//! Delivery of build results to subscribers.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::PublishError;

/// One build payload as delivered on a topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Published {
    pub topic: String,
    pub payload: Value,
}

/// Sink for validated build payloads.
///
/// Publishing is fire-and-forget for the orchestrator: an error is logged
/// against the backend branch and never retried.
#[async_trait]
pub trait ResultPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &Value) -> Result<(), PublishError>;
}

/// In-process publisher backed by a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    sender: broadcast::Sender<Published>,
}

impl ChannelPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl ResultPublisher for ChannelPublisher {
    async fn publish(&self, topic: &str, payload: &Value) -> Result<(), PublishError> {
        let message = Published {
            topic: topic.to_string(),
            payload: payload.clone(),
        };
        self.sender
            .send(message)
            .map(|_| ())
            .map_err(|_| PublishError::NoSubscribers {
                topic: topic.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscriber_receives_payload() {
        let publisher = ChannelPublisher::new(8);
        let mut rx = publisher.subscribe();

        publisher
            .publish("build.completed", &json!({"status": "success"}))
            .await
            .unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.topic, "build.completed");
        assert_eq!(got.payload["status"], "success");
    }

    #[tokio::test]
    async fn test_no_subscribers_is_error() {
        let publisher = ChannelPublisher::new(8);
        let err = publisher
            .publish("build.completed", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::NoSubscribers { ref topic } if topic == "build.completed"));
    }
}

//! In-memory test doubles for publishing.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::PublishError;
use crate::publisher::{Published, ResultPublisher};

/// Records every published payload.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    published: Mutex<Vec<Published>>,
    reject: bool,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A publisher that rejects everything.
    pub fn rejecting() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            reject: true,
        }
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    /// Payloads published on `topic`, in publish order.
    pub fn payloads(&self, topic: &str) -> Vec<Value> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.topic == topic)
            .map(|p| p.payload.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.published.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultPublisher for MemoryPublisher {
    async fn publish(&self, topic: &str, payload: &Value) -> Result<(), PublishError> {
        if self.reject {
            return Err(PublishError::Rejected {
                topic: topic.to_string(),
                reason: "publisher configured to reject".to_string(),
            });
        }
        self.published.lock().unwrap().push(Published {
            topic: topic.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }
}

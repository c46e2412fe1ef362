use async_trait::async_trait;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use thiserror::Error;

use dedup_common::messages::ForwardedEvent;

use crate::kafka::KafkaContext;

/// Enumeration of errors for publishing first occurrences downstream.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("failed to serialize forwarded event")]
    SerializeError(#[from] serde_json::Error),
    #[error("failed to publish to {topic}: {error}")]
    PublishError { topic: String, error: KafkaError },
}

/// Destination for first-occurrence events. The worker only calls `send`
/// for `waiting` outcomes; duplicates are consumed silently.
#[async_trait]
pub trait ForwardSink {
    async fn send(&self, event: ForwardedEvent) -> Result<(), ForwardError>;
}

/// Publishes forwarded events to the answer topic.
pub struct KafkaSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaSink {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: String) -> Self {
        Self { producer, topic }
    }
}

#[async_trait]
impl ForwardSink for KafkaSink {
    async fn send(&self, event: ForwardedEvent) -> Result<(), ForwardError> {
        let payload = serde_json::to_string(&event)?;

        self.producer
            .send(
                FutureRecord::<(), _>::to(&self.topic).payload(&payload),
                Timeout::Never,
            )
            .await
            .map_err(|(error, _)| ForwardError::PublishError {
                topic: self.topic.clone(),
                error,
            })?;

        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Collects forwarded events instead of publishing them.
    #[derive(Default)]
    pub struct MemorySink {
        sent: Mutex<Vec<ForwardedEvent>>,
    }

    impl MemorySink {
        pub fn sent(&self) -> Vec<ForwardedEvent> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ForwardSink for MemorySink {
        async fn send(&self, event: ForwardedEvent) -> Result<(), ForwardError> {
            self.sent.lock().unwrap().push(event);
            Ok(())
        }
    }
}

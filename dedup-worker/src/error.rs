use rdkafka::error::KafkaError;
use thiserror::Error;

use dedup_common::execution::MissingIdentityError;

use crate::forward::ForwardError;
use crate::kafka::AckError;
use crate::store::StoreError;

/// Errors caused by the inbound event itself. Fatal to that one message,
/// never to the consumer loop: the message is acked and the loop moves on.
#[derive(Error, Debug)]
pub enum EventError {
    #[error(transparent)]
    MissingIdentity(#[from] MissingIdentityError),
    #[error("failed to serialize the payload snapshot")]
    PayloadSnapshot(#[from] serde_json::Error),
}

/// Errors from one event's trip through the pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Event(#[from] EventError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Forward(#[from] ForwardError),
}

impl From<MissingIdentityError> for PipelineError {
    fn from(error: MissingIdentityError) -> Self {
        PipelineError::Event(EventError::MissingIdentity(error))
    }
}

/// Enumeration of errors that terminate the consumer loop. Transport-level
/// failures are retried by restarting the process; the un-acked message is
/// redelivered.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("kafka consumer failed: {0}")]
    Consumer(#[from] KafkaError),
    #[error("failed to ack an inbound message: {0}")]
    Ack(#[from] AckError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Forward(#[from] ForwardError),
}

use std::sync::{Arc, Weak};

use rdkafka::{
    consumer::{Consumer, StreamConsumer},
    error::KafkaError,
    producer::FutureProducer,
    ClientConfig, Message,
};
use tracing::{debug, warn};

use dedup_common::messages::TriggerEvent;

use crate::config::KafkaConfig;

pub struct KafkaContext {}

impl rdkafka::ClientContext for KafkaContext {}

/// Errors returned when receiving a trigger event from the listen topic.
/// `Malformed` and `Empty` messages are acked on receipt so a poison pill
/// cannot wedge the partition; only `Kafka` indicates the consumer itself
/// is in trouble.
#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("malformed trigger event: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("received empty payload")]
    Empty,
}

#[derive(Debug, thiserror::Error)]
pub enum AckError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("consumer gone")]
    Gone,
}

/// A consumer over the listen topic that yields one trigger event at a
/// time. Offsets are stored only through the returned [`DeliveryTag`], so a
/// message stays un-acked until its whole pipeline has run.
#[derive(Clone)]
pub struct TriggerConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer,
    topic: String,
}

impl TriggerConsumer {
    pub fn new(config: &KafkaConfig) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", &config.kafka_consumer_group)
            .set("auto.offset.reset", "earliest");

        // Offsets are stored manually, after the pipeline completes.
        client_config.set("enable.auto.offset.store", "false");

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka consumer configuration: {:?}", client_config);
        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[config.kafka_listen_topic.as_str()])?;

        let inner = Inner {
            consumer,
            topic: config.kafka_listen_topic.clone(),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Wait for the next message and deserialize it into a TriggerEvent.
    /// Empty and undeserializable messages are acked here and surfaced as
    /// errors for the caller to count and skip.
    pub async fn recv(&self) -> Result<(TriggerEvent, DeliveryTag), RecvError> {
        let message = self.inner.consumer.recv().await?;

        let tag = DeliveryTag {
            handle: Arc::downgrade(&self.inner),
            partition: message.partition(),
            offset: message.offset(),
        };

        let Some(payload) = message.payload() else {
            tag.ack_or_warn();
            return Err(RecvError::Empty);
        };

        let event = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(error) => {
                tag.ack_or_warn();
                return Err(RecvError::Malformed(error));
            }
        };

        Ok((event, tag))
    }
}

/// Acknowledgment token for one inbound message. Storing the offset marks
/// the message processed; the stored offset is committed in the background
/// by the consumer.
pub struct DeliveryTag {
    handle: Weak<Inner>,
    partition: i32,
    offset: i64,
}

impl DeliveryTag {
    pub fn ack(self) -> Result<(), AckError> {
        let inner = self.handle.upgrade().ok_or(AckError::Gone)?;
        inner
            .consumer
            .store_offset(&inner.topic, self.partition, self.offset)?;
        Ok(())
    }

    fn ack_or_warn(self) {
        let partition = self.partition;
        let offset = self.offset;
        if let Err(error) = self.ack() {
            warn!(
                partition,
                offset, "failed to ack discarded message: {}", error
            );
        }
    }
}

pub async fn create_kafka_producer(
    config: &KafkaConfig,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        );

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    debug!("rdkafka producer configuration: {:?}", client_config);
    let producer: FutureProducer<KafkaContext> =
        client_config.create_with_context(KafkaContext {})?;

    Ok(producer)
}

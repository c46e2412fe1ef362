use tracing::{error, info, warn};

use dedup_common::classify::ScopeKind;
use dedup_common::execution::{
    contains_duplicate, ExecutionStatus, IdentityKey, NewExecution, RecordIds, ScopeRole,
};
use dedup_common::health::HealthHandle;
use dedup_common::messages::{ForwardedEvent, TriggerEvent};

use crate::error::{EventError, PipelineError, WorkerError};
use crate::forward::ForwardSink;
use crate::kafka::{RecvError, TriggerConsumer};
use crate::store::ExecutionStore;

/// Outcome of one event's trip through the pipeline.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Outcome {
    /// First occurrence: records written as `waiting` and the event
    /// forwarded with their ids.
    Forwarded(RecordIds),
    /// Repeat: records written as `duplicated`, nothing forwarded.
    Duplicated(RecordIds),
}

impl Outcome {
    fn status(&self) -> ExecutionStatus {
        match self {
            Outcome::Forwarded(_) => ExecutionStatus::Waiting,
            Outcome::Duplicated(_) => ExecutionStatus::Duplicated,
        }
    }
}

/// The sequential consumer of trigger events: one message in flight at a
/// time, fully processed and acked before the next is fetched. This is
/// what makes the lookup-then-write sequence race-free within one process;
/// running several instances against the same store reintroduces the
/// check-then-act race and is not supported.
pub struct DedupWorker<S, F> {
    consumer: TriggerConsumer,
    store: S,
    sink: F,
    liveness: HealthHandle,
}

impl<S, F> DedupWorker<S, F>
where
    S: ExecutionStore,
    F: ForwardSink,
{
    pub fn new(consumer: TriggerConsumer, store: S, sink: F, liveness: HealthHandle) -> Self {
        Self {
            consumer,
            store,
            sink,
            liveness,
        }
    }

    /// Run the consumer loop until a transport failure. Malformed events
    /// are counted and skipped; store and publish failures bubble up so
    /// the process restarts and the un-acked message is redelivered.
    pub async fn run(&self) -> Result<(), WorkerError> {
        loop {
            let (event, tag) = match self.consumer.recv().await {
                Ok(received) => received,
                Err(RecvError::Kafka(error)) => return Err(error.into()),
                Err(error) => {
                    // Already acked by the consumer; skip it.
                    self.discard_malformed(error).await;
                    continue;
                }
            };

            match process_event(&self.store, &self.sink, &event).await {
                Ok(outcome) => {
                    let labels = [
                        ("status", outcome.status().to_string()),
                        ("type", event.classification.to_string()),
                    ];
                    metrics::counter!("dedup_events_processed_total", &labels).increment(1);
                    info!(
                        responser_name = %event.responser_name,
                        classification = %event.classification,
                        status = %outcome.status(),
                        "execution recorded"
                    );
                }
                Err(PipelineError::Event(error)) => {
                    metrics::counter!("dedup_events_malformed_total").increment(1);
                    warn!(
                        responser_name = %event.responser_name,
                        classification = %event.classification,
                        "discarding trigger event: {}",
                        error
                    );
                }
                Err(PipelineError::Store(error)) => return Err(error.into()),
                Err(PipelineError::Forward(error)) => return Err(error.into()),
            }

            // Positive ack after the whole pipeline, duplicates included.
            tag.ack()?;
            self.liveness.report_healthy().await;
        }
    }

    /// Count and log a message the consumer already acked and discarded.
    /// Skipping a poison pill is still progress, so it still counts
    /// towards liveness.
    async fn discard_malformed(&self, error: RecvError) {
        metrics::counter!("dedup_events_malformed_total").increment(1);
        warn!("discarding inbound message: {}", error);
        self.liveness.report_healthy().await;
    }
}

/// Classify, look up, write, and conditionally forward one trigger event.
pub async fn process_event<S, F>(
    store: &S,
    sink: &F,
    event: &TriggerEvent,
) -> Result<Outcome, PipelineError>
where
    S: ExecutionStore,
    F: ForwardSink,
{
    let schema = event.classification.key_schema();
    let key = IdentityKey::project(&schema, event.details.as_ref())?;

    let window = store.scan_window().await?;
    let status = if contains_duplicate(&window, &key) {
        ExecutionStatus::Duplicated
    } else {
        ExecutionStatus::Waiting
    };

    let snapshot =
        serde_json::to_string(&event.payload).map_err(EventError::PayloadSnapshot)?;

    let records = match schema.scope_kind() {
        ScopeKind::Single => persist_single(store, event, &key, status, &snapshot).await?,
        ScopeKind::Combined => persist_combined(store, event, &key, status, &snapshot).await?,
    };

    match status {
        ExecutionStatus::Duplicated => Ok(Outcome::Duplicated(records)),
        ExecutionStatus::Waiting => {
            sink.send(ForwardedEvent::new(event.clone(), &records)).await?;
            Ok(Outcome::Forwarded(records))
        }
    }
}

fn new_execution(
    event: &TriggerEvent,
    key: &IdentityKey,
    scope_role: Option<ScopeRole>,
    real_id_relationship: Option<uuid::Uuid>,
    status: ExecutionStatus,
    snapshot: &str,
) -> NewExecution {
    NewExecution {
        responser_name: event.responser_name.clone(),
        classification: event.classification,
        scope_role,
        identity: key.clone(),
        payload_snapshot: snapshot.to_owned(),
        real_id_relationship,
        status,
    }
}

/// Write the one record of a single-scope occurrence.
async fn persist_single<S: ExecutionStore>(
    store: &S,
    event: &TriggerEvent,
    key: &IdentityKey,
    status: ExecutionStatus,
    snapshot: &str,
) -> Result<RecordIds, PipelineError> {
    let id = store
        .insert(new_execution(event, key, None, None, status, snapshot))
        .await?;

    Ok(RecordIds::Single(id))
}

/// Write the linked pair of a combined-scope occurrence: ip record first,
/// then the chain record pointing back at it, then the link-back update.
/// There is no compensating rollback; a failure partway leaves the earlier
/// rows in place, recognizable by an ip record with a null
/// `real_id_relationship`.
async fn persist_combined<S: ExecutionStore>(
    store: &S,
    event: &TriggerEvent,
    key: &IdentityKey,
    status: ExecutionStatus,
    snapshot: &str,
) -> Result<RecordIds, PipelineError> {
    let for_ip = store
        .insert(new_execution(
            event,
            key,
            Some(ScopeRole::Ip),
            None,
            status,
            snapshot,
        ))
        .await?;

    let for_chain = match store
        .insert(new_execution(
            event,
            key,
            Some(ScopeRole::Chain),
            Some(for_ip),
            status,
            snapshot,
        ))
        .await
    {
        Ok(id) => id,
        Err(error) => {
            error!(
                execution_id_for_ip = %for_ip,
                "chain insert failed, ip execution left unlinked: {}",
                error
            );
            return Err(error.into());
        }
    };

    if let Err(error) = store.set_relationship(for_ip, for_chain).await {
        error!(
            execution_id_for_ip = %for_ip,
            execution_id_for_chain = %for_chain,
            "link-back update failed, pair left half-linked: {}",
            error
        );
        return Err(error.into());
    }

    Ok(RecordIds::Pair { for_ip, for_chain })
}

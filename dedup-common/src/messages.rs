use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classify::ClassificationType;
use crate::execution::RecordIds;

/// A security-rule trigger event as reported by an enforcement agent on the
/// listen topic. Transient: only derived fields are persisted, the raw
/// payload is kept as an opaque snapshot.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
pub struct TriggerEvent {
    pub responser_name: String,
    #[serde(rename = "type")]
    pub classification: ClassificationType,
    pub details: Option<TriggerDetails>,
    pub payload: serde_json::Value,
}

/// The identity dimensions an agent reports alongside a trigger. Rule and
/// payload arrive pre-hashed; only exact equality is ever computed on them.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
pub struct TriggerDetails {
    pub ip: Option<IpDetail>,
    pub hashed_rule: Option<String>,
    pub hashed_payload: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
pub struct IpDetail {
    pub source_ip: Option<String>,
}

impl TriggerDetails {
    pub fn source_ip(&self) -> Option<&str> {
        self.ip.as_ref().and_then(|ip| ip.source_ip.as_deref())
    }
}

/// The message published to the answer topic for first occurrences: the
/// inbound object plus the identifiers of the records just created. The
/// unused identifier shape is kept as an explicit null so downstream
/// consumers can branch on it without probing for missing keys.
#[derive(Serialize, Debug, PartialEq, Clone)]
pub struct ForwardedEvent {
    #[serde(flatten)]
    pub event: TriggerEvent,
    pub execution_id: Option<Uuid>,
    pub execution_id_for_ip: Option<Uuid>,
    pub execution_id_for_chain: Option<Uuid>,
}

impl ForwardedEvent {
    pub fn new(event: TriggerEvent, records: &RecordIds) -> Self {
        match records {
            RecordIds::Single(id) => Self {
                event,
                execution_id: Some(*id),
                execution_id_for_ip: None,
                execution_id_for_chain: None,
            },
            RecordIds::Pair { for_ip, for_chain } => Self {
                event,
                execution_id: None,
                execution_id_for_ip: Some(*for_ip),
                execution_id_for_chain: Some(*for_chain),
            },
        }
    }
}

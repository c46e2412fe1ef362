use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::classify::{ClassificationType, KeySchema};
use crate::messages::TriggerDetails;

/// Decision recorded for an execution.
/// Waiting: a first occurrence, forwarded downstream for handling.
/// Duplicated: a repeat of an execution we already hold a record for.
#[derive(Debug, PartialEq, Eq, Clone, Copy, sqlx::Type)]
#[sqlx(type_name = "execution_status")]
#[sqlx(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Waiting,
    Duplicated,
}

/// Allow casting ExecutionStatus from strings.
impl FromStr for ExecutionStatus {
    type Err = ParseExecutionStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(ExecutionStatus::Waiting),
            "duplicated" => Ok(ExecutionStatus::Duplicated),
            invalid => Err(ParseExecutionStatusError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecutionStatus::Waiting => write!(f, "waiting"),
            ExecutionStatus::Duplicated => write!(f, "duplicated"),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid ExecutionStatus")]
pub struct ParseExecutionStatusError(pub String);

/// Which half of a combined-scope pair a record represents. Single-scope
/// records carry no role (stored null).
#[derive(Debug, PartialEq, Eq, Clone, Copy, sqlx::Type)]
#[sqlx(type_name = "execution_scope")]
#[sqlx(rename_all = "lowercase")]
pub enum ScopeRole {
    Ip,
    Chain,
}

impl fmt::Display for ScopeRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ScopeRole::Ip => write!(f, "ip"),
            ScopeRole::Chain => write!(f, "chain"),
        }
    }
}

/// A trigger event that requires a significant identity dimension the agent
/// did not report. A producer contract violation: fatal to that message,
/// never coerced.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("event details are missing the required {0} dimension")]
pub struct MissingIdentityError(pub &'static str);

/// The concrete identity values an event carries for its significant
/// dimensions, with every insignificant dimension pinned to `None`. Built
/// by [`IdentityKey::project`]; equality against a stored record's triple
/// is exactly the duplicate predicate: present dimensions equal, absent
/// dimensions null on both sides.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct IdentityKey {
    pub ip: Option<String>,
    pub rule: Option<String>,
    pub payload: Option<String>,
}

impl IdentityKey {
    /// Project an event's reported details through its key schema. Values
    /// for insignificant dimensions are discarded even when reported, so
    /// they are stored as null and compared as null.
    pub fn project(
        schema: &KeySchema,
        details: Option<&TriggerDetails>,
    ) -> Result<Self, MissingIdentityError> {
        let mut key = IdentityKey::default();

        if schema.ip {
            key.ip = Some(
                details
                    .and_then(|d| d.source_ip())
                    .ok_or(MissingIdentityError("source_ip"))?
                    .to_owned(),
            );
        }
        if schema.rule {
            key.rule = Some(
                details
                    .and_then(|d| d.hashed_rule.as_deref())
                    .ok_or(MissingIdentityError("hashed_rule"))?
                    .to_owned(),
            );
        }
        if schema.payload {
            key.payload = Some(
                details
                    .and_then(|d| d.hashed_payload.as_deref())
                    .ok_or(MissingIdentityError("hashed_payload"))?
                    .to_owned(),
            );
        }

        Ok(key)
    }
}

/// A persisted execution record, one row of the executions table. Immutable
/// once written except for `real_id_relationship`, which is set exactly
/// once on the ip half of a combined pair after its chain half exists.
#[derive(Debug, PartialEq, Clone, sqlx::FromRow)]
pub struct ExecutionRow {
    pub id: Uuid,
    pub responser_name: String,
    pub secrule_id: Option<String>,
    #[sqlx(rename = "type")]
    pub classification: ClassificationType,
    #[sqlx(rename = "for")]
    pub scope_role: Option<ScopeRole>,
    pub start: Option<DateTime<Utc>>,
    pub detail_ip: Option<String>,
    pub anomaly_score: Option<String>,
    pub paranoia_level: Option<String>,
    pub detail_rule: Option<String>,
    pub detail_payload: Option<String>,
    pub detail_hashed_rule: Option<String>,
    pub detail_hashed_payload: Option<String>,
    pub payload: String,
    pub relationship: Option<String>,
    pub real_id_relationship: Option<Uuid>,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
}

impl ExecutionRow {
    /// The exact conjunctive match of the duplicate lookup: every
    /// significant dimension equal, every insignificant dimension null.
    /// Both conditions fall out of `Option` equality against a projected
    /// key.
    pub fn matches_identity(&self, key: &IdentityKey) -> bool {
        self.detail_ip.as_deref() == key.ip.as_deref()
            && self.detail_hashed_rule.as_deref() == key.rule.as_deref()
            && self.detail_hashed_payload.as_deref() == key.payload.as_deref()
    }
}

/// Report whether any record in the scan window already matches the
/// projected identity key.
pub fn contains_duplicate(window: &[ExecutionRow], key: &IdentityKey) -> bool {
    window.iter().any(|row| row.matches_identity(key))
}

/// An execution record to be inserted. Identity fields come pre-projected,
/// so insignificant dimensions are already null.
#[derive(Debug, PartialEq, Clone)]
pub struct NewExecution {
    pub responser_name: String,
    pub classification: ClassificationType,
    pub scope_role: Option<ScopeRole>,
    pub identity: IdentityKey,
    pub payload_snapshot: String,
    pub real_id_relationship: Option<Uuid>,
    pub status: ExecutionStatus,
}

/// Identifiers of the record(s) written for one event, attached to the
/// forwarded message on first occurrences.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RecordIds {
    Single(Uuid),
    Pair { for_ip: Uuid, for_chain: Uuid },
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::classify::ClassificationType;
    use crate::messages::IpDetail;

    fn details(
        ip: Option<&str>,
        rule: Option<&str>,
        payload: Option<&str>,
    ) -> TriggerDetails {
        TriggerDetails {
            ip: ip.map(|source_ip| IpDetail {
                source_ip: Some(source_ip.to_owned()),
            }),
            hashed_rule: rule.map(str::to_owned),
            hashed_payload: payload.map(str::to_owned),
        }
    }

    fn stored_row(
        ip: Option<&str>,
        rule: Option<&str>,
        payload: Option<&str>,
    ) -> ExecutionRow {
        ExecutionRow {
            id: Uuid::now_v7(),
            responser_name: "responser-1".to_owned(),
            secrule_id: None,
            classification: ClassificationType::Full,
            scope_role: None,
            start: None,
            detail_ip: ip.map(str::to_owned),
            anomaly_score: None,
            paranoia_level: None,
            detail_rule: None,
            detail_payload: None,
            detail_hashed_rule: rule.map(str::to_owned),
            detail_hashed_payload: payload.map(str::to_owned),
            payload: "null".to_owned(),
            relationship: None,
            real_id_relationship: None,
            status: ExecutionStatus::Waiting,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_project_keeps_significant_dimensions_only() {
        let schema = ClassificationType::OnlyIpAndRegex.key_schema();
        let reported = details(Some("1.2.3.4"), Some("r1"), Some("p1"));

        let key = IdentityKey::project(&schema, Some(&reported)).unwrap();

        assert_eq!(key.ip.as_deref(), Some("1.2.3.4"));
        assert_eq!(key.rule.as_deref(), Some("r1"));
        // Reported but insignificant for this type: dropped, stored null.
        assert_eq!(key.payload, None);
    }

    #[test]
    fn test_project_requires_significant_dimensions() {
        let schema = ClassificationType::OnlyIp.key_schema();

        let missing_details = IdentityKey::project(&schema, None);
        assert_eq!(missing_details, Err(MissingIdentityError("source_ip")));

        let missing_ip = details(None, Some("r1"), None);
        assert_eq!(
            IdentityKey::project(&schema, Some(&missing_ip)),
            Err(MissingIdentityError("source_ip"))
        );

        let schema = ClassificationType::OnlyRegexAndPayload.key_schema();
        let missing_payload = details(None, Some("r1"), None);
        assert_eq!(
            IdentityKey::project(&schema, Some(&missing_payload)),
            Err(MissingIdentityError("hashed_payload"))
        );
    }

    #[test]
    fn test_matches_identity_requires_equal_and_null() {
        let schema = ClassificationType::OnlyRegexAndPayload.key_schema();
        let reported = details(None, Some("r2"), Some("p2"));
        let key = IdentityKey::project(&schema, Some(&reported)).unwrap();

        // Equal on significant dimensions, null on the insignificant one.
        assert!(stored_row(None, Some("r2"), Some("p2")).matches_identity(&key));

        // Same values but an ip present: not the same scope, no match.
        assert!(!stored_row(Some("9.9.9.9"), Some("r2"), Some("p2")).matches_identity(&key));

        // A significant dimension differs.
        assert!(!stored_row(None, Some("r2"), Some("other")).matches_identity(&key));

        // A significant dimension absent in the candidate.
        assert!(!stored_row(None, Some("r2"), None).matches_identity(&key));
    }

    #[test]
    fn test_contains_duplicate_scans_whole_window() {
        let schema = ClassificationType::OnlyIp.key_schema();
        let reported = details(Some("1.2.3.4"), None, None);
        let key = IdentityKey::project(&schema, Some(&reported)).unwrap();

        let window = vec![
            stored_row(Some("5.6.7.8"), None, None),
            stored_row(Some("1.2.3.4"), Some("r1"), None),
            stored_row(Some("1.2.3.4"), None, None),
        ];

        assert!(contains_duplicate(&window, &key));
        assert!(!contains_duplicate(&window[..2], &key));
        assert!(!contains_duplicate(&[], &key));
    }

    #[test]
    fn test_execution_status_from_str() {
        assert_eq!(
            ExecutionStatus::from_str("waiting"),
            Ok(ExecutionStatus::Waiting)
        );
        assert_eq!(
            ExecutionStatus::from_str("duplicated"),
            Ok(ExecutionStatus::Duplicated)
        );
        assert_eq!(
            ExecutionStatus::from_str("completed"),
            Err(ParseExecutionStatusError("completed".to_owned()))
        );
    }
}

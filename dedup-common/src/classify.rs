use std::fmt;
use std::str::FromStr;

use serde::{de::Visitor, Deserialize, Serialize};
use thiserror::Error;

/// Error raised when an inbound event carries a classification literal we
/// do not recognize. Unknown literals are a producer contract violation and
/// are never coerced to a known type.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid ClassificationType")]
pub struct ParseClassificationTypeError(pub String);

/// The type tag on an inbound trigger event. It selects which identity
/// dimensions are significant when deciding whether the event is a repeat
/// of one we have already recorded.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, sqlx::Type)]
#[sqlx(type_name = "classification_type")]
pub enum ClassificationType {
    #[sqlx(rename = "full")]
    Full,
    #[sqlx(rename = "onlyIPAndPayload")]
    OnlyIpAndPayload,
    #[sqlx(rename = "onlyIPAndRegex")]
    OnlyIpAndRegex,
    #[sqlx(rename = "onlyIP")]
    OnlyIp,
    #[sqlx(rename = "onlyRegexAndPayload")]
    OnlyRegexAndPayload,
    #[sqlx(rename = "onlyRegex")]
    OnlyRegex,
    #[sqlx(rename = "onlyPayload")]
    OnlyPayload,
}

/// The subset of identity dimensions that matter for a given classification
/// type. A dimension marked `true` must match exactly on lookup and is
/// stored with the event's value; a dimension marked `false` must be
/// exactly absent in any matching record and is stored as null.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct KeySchema {
    pub ip: bool,
    pub rule: bool,
    pub payload: bool,
}

/// Whether an occurrence is represented by one stored record or by a
/// linked ip/chain pair.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ScopeKind {
    Single,
    Combined,
}

impl ClassificationType {
    /// The fixed mapping from classification type to significant identity
    /// dimensions. Total over the enum; adding a type means adding a row
    /// here and nothing else.
    pub fn key_schema(&self) -> KeySchema {
        match self {
            ClassificationType::Full => KeySchema {
                ip: true,
                rule: true,
                payload: true,
            },
            ClassificationType::OnlyIpAndPayload => KeySchema {
                ip: true,
                rule: false,
                payload: true,
            },
            ClassificationType::OnlyIpAndRegex => KeySchema {
                ip: true,
                rule: true,
                payload: false,
            },
            ClassificationType::OnlyIp => KeySchema {
                ip: true,
                rule: false,
                payload: false,
            },
            ClassificationType::OnlyRegexAndPayload => KeySchema {
                ip: false,
                rule: true,
                payload: true,
            },
            ClassificationType::OnlyRegex => KeySchema {
                ip: false,
                rule: true,
                payload: false,
            },
            ClassificationType::OnlyPayload => KeySchema {
                ip: false,
                rule: false,
                payload: true,
            },
        }
    }
}

impl KeySchema {
    /// An occurrence needs a linked ip/chain pair exactly when the source
    /// address is significant together with at least one other dimension.
    /// This derivation, not a second table, decides the scope of a type.
    pub fn scope_kind(&self) -> ScopeKind {
        if self.ip && (self.rule || self.payload) {
            ScopeKind::Combined
        } else {
            ScopeKind::Single
        }
    }
}

/// Allow casting `ClassificationType` from the wire literals. Matching is
/// case-sensitive, as in the producers.
impl FromStr for ClassificationType {
    type Err = ParseClassificationTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(ClassificationType::Full),
            "onlyIPAndPayload" => Ok(ClassificationType::OnlyIpAndPayload),
            "onlyIPAndRegex" => Ok(ClassificationType::OnlyIpAndRegex),
            "onlyIP" => Ok(ClassificationType::OnlyIp),
            "onlyRegexAndPayload" => Ok(ClassificationType::OnlyRegexAndPayload),
            "onlyRegex" => Ok(ClassificationType::OnlyRegex),
            "onlyPayload" => Ok(ClassificationType::OnlyPayload),
            invalid => Err(ParseClassificationTypeError(invalid.to_owned())),
        }
    }
}

/// Implement `std::fmt::Display` to convert ClassificationType back to its
/// wire literal.
impl fmt::Display for ClassificationType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClassificationType::Full => write!(f, "full"),
            ClassificationType::OnlyIpAndPayload => write!(f, "onlyIPAndPayload"),
            ClassificationType::OnlyIpAndRegex => write!(f, "onlyIPAndRegex"),
            ClassificationType::OnlyIp => write!(f, "onlyIP"),
            ClassificationType::OnlyRegexAndPayload => write!(f, "onlyRegexAndPayload"),
            ClassificationType::OnlyRegex => write!(f, "onlyRegex"),
            ClassificationType::OnlyPayload => write!(f, "onlyPayload"),
        }
    }
}

struct ClassificationTypeVisitor;

impl<'de> Visitor<'de> for ClassificationTypeVisitor {
    type Value = ClassificationType;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "the string representation of ClassificationType")
    }

    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        match ClassificationType::from_str(s) {
            Ok(classification) => Ok(classification),
            Err(_) => Err(serde::de::Error::invalid_value(
                serde::de::Unexpected::Str(s),
                &self,
            )),
        }
    }
}

/// Deserialize required to read `ClassificationType` from inbound messages.
impl<'de> Deserialize<'de> for ClassificationType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(ClassificationTypeVisitor)
    }
}

/// Serialize required to echo `ClassificationType` in forwarded messages.
impl Serialize for ClassificationType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    const ALL_TYPES: [ClassificationType; 7] = [
        ClassificationType::Full,
        ClassificationType::OnlyIpAndPayload,
        ClassificationType::OnlyIpAndRegex,
        ClassificationType::OnlyIp,
        ClassificationType::OnlyRegexAndPayload,
        ClassificationType::OnlyRegex,
        ClassificationType::OnlyPayload,
    ];

    #[test]
    fn test_key_schema_table() {
        let expected = [
            (ClassificationType::Full, (true, true, true)),
            (ClassificationType::OnlyIpAndPayload, (true, false, true)),
            (ClassificationType::OnlyIpAndRegex, (true, true, false)),
            (ClassificationType::OnlyIp, (true, false, false)),
            (ClassificationType::OnlyRegexAndPayload, (false, true, true)),
            (ClassificationType::OnlyRegex, (false, true, false)),
            (ClassificationType::OnlyPayload, (false, false, true)),
        ];

        for (classification, (ip, rule, payload)) in expected {
            let schema = classification.key_schema();
            assert_eq!(schema, KeySchema { ip, rule, payload }, "{}", classification);
        }
    }

    #[test]
    fn test_scope_kind_derivation() {
        // Combined iff ip is significant together with at least one other
        // dimension.
        for classification in ALL_TYPES {
            let schema = classification.key_schema();
            let expected = if schema.ip && (schema.rule || schema.payload) {
                ScopeKind::Combined
            } else {
                ScopeKind::Single
            };
            assert_eq!(schema.scope_kind(), expected, "{}", classification);
        }

        assert_eq!(
            ClassificationType::Full.key_schema().scope_kind(),
            ScopeKind::Combined
        );
        assert_eq!(
            ClassificationType::OnlyIpAndPayload.key_schema().scope_kind(),
            ScopeKind::Combined
        );
        assert_eq!(
            ClassificationType::OnlyIpAndRegex.key_schema().scope_kind(),
            ScopeKind::Combined
        );
        assert_eq!(
            ClassificationType::OnlyIp.key_schema().scope_kind(),
            ScopeKind::Single
        );
        assert_eq!(
            ClassificationType::OnlyRegexAndPayload
                .key_schema()
                .scope_kind(),
            ScopeKind::Single
        );
        assert_eq!(
            ClassificationType::OnlyRegex.key_schema().scope_kind(),
            ScopeKind::Single
        );
        assert_eq!(
            ClassificationType::OnlyPayload.key_schema().scope_kind(),
            ScopeKind::Single
        );
    }

    #[test]
    fn test_key_schema_is_pure() {
        for classification in ALL_TYPES {
            assert_eq!(classification.key_schema(), classification.key_schema());
            assert_eq!(
                classification.key_schema().scope_kind(),
                classification.key_schema().scope_kind()
            );
        }
    }

    #[test]
    fn test_from_str_round_trips_display() {
        for classification in ALL_TYPES {
            let literal = classification.to_string();
            assert_eq!(
                ClassificationType::from_str(&literal),
                Ok(classification)
            );
        }
    }

    #[test]
    fn test_from_str_rejects_unknown_literals() {
        assert_eq!(
            ClassificationType::from_str("onlyip"),
            Err(ParseClassificationTypeError("onlyip".to_owned()))
        );
        assert!(ClassificationType::from_str("").is_err());
        assert!(ClassificationType::from_str("everything").is_err());
    }

    #[test]
    fn test_serde_uses_wire_literals() {
        let serialized = serde_json::to_string(&ClassificationType::OnlyIpAndRegex).unwrap();
        assert_eq!(serialized, "\"onlyIPAndRegex\"");

        let deserialized: ClassificationType = serde_json::from_str("\"onlyPayload\"").unwrap();
        assert_eq!(deserialized, ClassificationType::OnlyPayload);

        let invalid: Result<ClassificationType, _> = serde_json::from_str("\"onlyFoo\"");
        assert!(invalid.is_err());
    }
}

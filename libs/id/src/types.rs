//! Typed IDs and names for storage resources.

use crate::{define_id, define_name};

// =============================================================================
// Operator-chosen names
// =============================================================================

define_name!(VolumeName, "volume name");
define_name!(NodeName, "node name");

// =============================================================================
// Volume components
// =============================================================================

define_id!(EngineId, "e");
define_id!(ReplicaId, "r");

// =============================================================================
// Data protection
// =============================================================================

define_id!(SnapshotId, "snap");
define_id!(BackupId, "backup");

// =============================================================================
// Requests
// =============================================================================

define_id!(RequestId, "req");

// =============================================================================
// Events
// =============================================================================

/// Global event ordinal assigned by the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(i64);

impl EventId {
    /// Creates a new EventId from an i64.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the underlying i64 value.
    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl serde::Serialize for EventId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for EventId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let id = i64::deserialize(deserializer)?;
        Ok(Self(id))
    }
}

// =============================================================================
// Aggregate Sequence Number
// =============================================================================

/// Per-volume sequence number; orders the events a single volume emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AggregateSeq(i32);

impl AggregateSeq {
    /// The first sequence number for a new aggregate.
    pub const FIRST: Self = Self(1);

    /// Creates a new AggregateSeq from an i32.
    #[must_use]
    pub const fn new(seq: i32) -> Self {
        Self(seq)
    }

    /// Returns the underlying i32 value.
    #[must_use]
    pub const fn value(&self) -> i32 {
        self.0
    }

    /// Returns the next sequence number.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Default for AggregateSeq {
    fn default() -> Self {
        Self::FIRST
    }
}

impl std::fmt::Display for AggregateSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl serde::Serialize for AggregateSeq {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i32(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for AggregateSeq {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let seq = i32::deserialize(deserializer)?;
        Ok(Self(seq))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdError;
    use proptest::prelude::*;

    #[test]
    fn test_replica_id_renders_lowercase_with_dash() {
        let id = ReplicaId::new();
        let s = id.to_string();
        assert!(s.starts_with("r-"));
        assert_eq!(s, s.to_ascii_lowercase());
        assert_eq!(s.len(), 2 + 26);
    }

    #[test]
    fn test_id_roundtrip_accepts_either_case() {
        let id = SnapshotId::new();
        let lower = id.to_string();
        let upper = format!("snap-{}", id.ulid());
        assert_eq!(SnapshotId::parse(&lower).unwrap(), id);
        assert_eq!(SnapshotId::parse(&upper).unwrap(), id);
    }

    #[test]
    fn test_id_rejects_foreign_prefix() {
        let replica = ReplicaId::new().to_string();
        let err = EngineId::parse(&replica).unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn test_id_rejects_missing_separator() {
        assert_eq!(
            BackupId::parse("backup01hv4z2wqxkjnm8gpqy6vbkc3d"),
            Err(IdError::MissingSeparator)
        );
        assert!(BackupId::parse("").unwrap_err().is_empty());
    }

    #[test]
    fn test_id_serde_as_string() {
        let id = BackupId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: BackupId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_unique_prefixes() {
        let prefixes = [
            EngineId::PREFIX,
            ReplicaId::PREFIX,
            SnapshotId::PREFIX,
            BackupId::PREFIX,
            RequestId::PREFIX,
        ];
        let mut sorted = prefixes.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), prefixes.len());
    }

    #[test]
    fn test_volume_name_validation() {
        assert!(VolumeName::parse("test-vol-1").is_ok());
        assert!(VolumeName::parse("0abc").is_ok());
        assert!(matches!(
            VolumeName::parse("Bad_Name"),
            Err(IdError::InvalidName { .. })
        ));
        assert!(matches!(
            VolumeName::parse("-leading"),
            Err(IdError::InvalidName { .. })
        ));
        assert!(matches!(
            NodeName::parse(&"a".repeat(64)),
            Err(IdError::TooLong { max: 63, .. })
        ));
        assert_eq!(VolumeName::parse(""), Err(IdError::Empty));
    }

    #[test]
    fn test_volume_name_deserialize_validates() {
        let ok: VolumeName = serde_json::from_str("\"vol-a\"").unwrap();
        assert_eq!(ok.as_str(), "vol-a");
        assert!(serde_json::from_str::<VolumeName>("\"VOL\"").is_err());
    }

    #[test]
    fn test_aggregate_seq() {
        let seq = AggregateSeq::FIRST;
        assert_eq!(seq.value(), 1);
        assert_eq!(seq.next().value(), 2);
        assert_eq!(AggregateSeq::default(), AggregateSeq::FIRST);
    }

    proptest! {
        #[test]
        fn prop_valid_names_parse(name in "[a-z0-9][a-z0-9-]{0,62}") {
            let parsed = VolumeName::parse(&name).unwrap();
            prop_assert_eq!(parsed.as_str(), name.as_str());
        }
    }
}

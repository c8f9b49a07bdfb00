use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Width of every vector produced by the encoders.
pub const VECTOR_DIM: usize = 32;

/// Which kind of agent record a vector was encoded from.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[archive(check_bytes)]
#[serde(rename_all = "snake_case")]
pub enum VectorType {
    Status,
    Message,
    Task,
}

impl VectorType {
    pub const ALL: [VectorType; 3] = [VectorType::Status, VectorType::Message, VectorType::Task];

    pub fn as_str(&self) -> &'static str {
        match self {
            VectorType::Status => "status",
            VectorType::Message => "message",
            VectorType::Task => "task",
        }
    }
}

impl fmt::Display for VectorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[archive(check_bytes)]
#[serde(rename_all = "snake_case")]
pub enum VectorStatus {
    Active,
    Archived,
    Deleted,
}

impl VectorStatus {
    /// Records only ever move forward: Active -> Archived -> Deleted.
    pub fn can_transition_to(&self, next: VectorStatus) -> bool {
        matches!(
            (self, next),
            (VectorStatus::Active, VectorStatus::Archived)
                | (VectorStatus::Active, VectorStatus::Deleted)
                | (VectorStatus::Archived, VectorStatus::Deleted)
        )
    }
}

#[derive(Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct VectorMetadata {
    pub vector_id: String,
    pub vector_type: VectorType,
    pub agent_id: String,

    /// Unix timestamps (seconds)
    pub created_at: u64,
    pub updated_at: u64,

    pub status: VectorStatus,

    /// Must equal `vector_data.len()` of the owning record
    pub dimensions: usize,

    pub source: String,
    #[serde(default)]
    pub tags: HashSet<String>,
    #[serde(default)]
    pub properties: HashMap<String, String>,

    /// Bumped on every status transition. Writers never check it.
    pub version: u32,
}

/// The unit of storage: metadata plus the encoded feature vector.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct VectorRecord {
    pub metadata: VectorMetadata,
    pub vector_data: Vec<f32>,
}

impl VectorRecord {
    pub fn new(
        vector_id: impl Into<String>,
        vector_type: VectorType,
        agent_id: impl Into<String>,
        vector_data: Vec<f32>,
        source: impl Into<String>,
    ) -> Self {
        let now = now_secs();
        Self {
            metadata: VectorMetadata {
                vector_id: vector_id.into(),
                vector_type,
                agent_id: agent_id.into(),
                created_at: now,
                updated_at: now,
                status: VectorStatus::Active,
                dimensions: vector_data.len(),
                source: source.into(),
                tags: HashSet::new(),
                properties: HashMap::new(),
                version: 1,
            },
            vector_data,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.properties.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.metadata.vector_id
    }

    /// Checks `dimensions == vector_data.len() == expected_dim`.
    pub fn validate(&self, expected_dim: usize) -> Result<()> {
        if self.metadata.dimensions != self.vector_data.len() {
            return Err(StoreError::DimensionMismatch {
                expected: self.metadata.dimensions,
                actual: self.vector_data.len(),
            });
        }
        if self.vector_data.len() != expected_dim {
            return Err(StoreError::DimensionMismatch {
                expected: expected_dim,
                actual: self.vector_data.len(),
            });
        }
        Ok(())
    }

    /// Next version of this record with a new status. The vector is untouched.
    pub fn transitioned(&self, status: VectorStatus) -> Result<Self> {
        let from = self.metadata.status;
        if !from.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                id: self.metadata.vector_id.clone(),
                from,
                to: status,
            });
        }

        let mut next = self.clone();
        next.metadata.status = status;
        next.metadata.updated_at = now_secs().max(self.metadata.updated_at);
        next.metadata.version = self.metadata.version.saturating_add(1);
        Ok(next)
    }
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> VectorRecord {
        VectorRecord::new("task_1", VectorType::Task, "agent-7", vec![0.5; VECTOR_DIM], "test")
    }

    #[test]
    fn new_record_tracks_dimensions() {
        let r = record();
        assert_eq!(r.metadata.dimensions, VECTOR_DIM);
        assert_eq!(r.metadata.status, VectorStatus::Active);
        assert_eq!(r.metadata.version, 1);
        assert!(r.validate(VECTOR_DIM).is_ok());
    }

    #[test]
    fn validate_rejects_inconsistent_dimensions() {
        let mut r = record();
        r.metadata.dimensions = 16;
        assert!(matches!(
            r.validate(VECTOR_DIM),
            Err(StoreError::DimensionMismatch { expected: 16, actual: 32 })
        ));

        let short = VectorRecord::new("x", VectorType::Status, "a", vec![1.0; 8], "test");
        assert!(matches!(
            short.validate(VECTOR_DIM),
            Err(StoreError::DimensionMismatch { expected: 32, actual: 8 })
        ));
    }

    #[test]
    fn transitions_only_move_forward() {
        let r = record();
        let archived = r.transitioned(VectorStatus::Archived).unwrap();
        assert_eq!(archived.metadata.status, VectorStatus::Archived);
        assert_eq!(archived.metadata.version, 2);
        assert_eq!(archived.vector_data, r.vector_data);

        let deleted = archived.transitioned(VectorStatus::Deleted).unwrap();
        assert_eq!(deleted.metadata.version, 3);

        assert!(deleted.transitioned(VectorStatus::Active).is_err());
        assert!(archived.transitioned(VectorStatus::Active).is_err());
        assert!(r.transitioned(VectorStatus::Active).is_err());
    }

    #[test]
    fn builders_fill_tags_and_properties() {
        let r = record().with_tags(["urgent", "backend", "urgent"]).with_property("title", "fix it");
        assert_eq!(r.metadata.tags.len(), 2);
        assert_eq!(r.metadata.properties.get("title").map(String::as_str), Some("fix it"));
    }

    #[test]
    fn serde_uses_snake_case_enums() {
        let json = serde_json::to_value(record()).unwrap();
        assert_eq!(json["metadata"]["vector_type"], "task");
        assert_eq!(json["metadata"]["status"], "active");
    }
}

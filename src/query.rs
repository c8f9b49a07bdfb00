use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::model::{VectorMetadata, VectorStatus, VectorType};

/// Metadata constraints applied before scoring. Empty fields match anything,
/// except `statuses`, which defaults to active records only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilter {
    pub vector_type: Option<VectorType>,
    pub agent_id: Option<String>,
    /// Every listed tag must be present on the record
    pub tags: BTreeSet<String>,
    pub statuses: BTreeSet<VectorStatus>,
}

impl Default for SearchFilter {
    fn default() -> Self {
        Self {
            vector_type: None,
            agent_id: None,
            tags: BTreeSet::new(),
            statuses: BTreeSet::from([VectorStatus::Active]),
        }
    }
}

impl SearchFilter {
    pub fn matches(&self, meta: &VectorMetadata) -> bool {
        self.vector_type.map_or(true, |t| t == meta.vector_type)
            && self.agent_id.as_deref().map_or(true, |a| a == meta.agent_id)
            && self.tags.iter().all(|t| meta.tags.contains(t))
            && (self.statuses.is_empty() || self.statuses.contains(&meta.status))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub vector: Vec<f32>,
    pub top_k: usize,
    /// Minimum cosine similarity (inclusive)
    pub threshold: f32,
    pub filter: SearchFilter,
}

impl SearchQuery {
    pub fn new(vector: Vec<f32>) -> Self {
        Self {
            vector,
            top_k: 10,
            threshold: 0.0,
            filter: SearchFilter::default(),
        }
    }

    pub fn top_k(mut self, k: usize) -> Self {
        self.top_k = k;
        self
    }

    pub fn threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn vector_type(mut self, vector_type: VectorType) -> Self {
        self.filter.vector_type = Some(vector_type);
        self
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.filter.agent_id = Some(agent_id.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.filter.tags.insert(tag.into());
        self
    }

    pub fn statuses<I: IntoIterator<Item = VectorStatus>>(mut self, statuses: I) -> Self {
        self.filter.statuses = statuses.into_iter().collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub vector_id: String,
    pub similarity: f32,
    pub metadata: VectorMetadata,
}

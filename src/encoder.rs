//! Feature encoders for agent records.
//!
//! Each [`VectorType`] has a fixed table of [`Feature`]s. Encoding walks the
//! table, reads the named field from a JSON object and writes one float per
//! feature, then zero-pads to [`VECTOR_DIM`]. Missing fields, unparseable
//! numbers and unknown category labels all encode as `0.0`, so encoding never
//! fails and the same input always produces the same vector.

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::model::{VectorRecord, VectorType, VECTOR_DIM};

/// How one field of a record becomes one lane of the vector.
#[derive(Debug, Clone, Copy)]
pub enum Feature {
    /// `value / scale`, clamped to [0, 1]. Numeric strings are accepted.
    Numeric { field: &'static str, scale: f32 },
    /// Label looked up in a fixed table; unknown labels give 0.0.
    Categorical {
        field: &'static str,
        table: &'static [(&'static str, f32)],
    },
    /// Truthy booleans, non-zero numbers and "true"/"yes" strings give 1.0.
    Flag { field: &'static str },
    /// 1.0 when the field exists and is neither null nor empty.
    Present { field: &'static str },
    /// Char count of a string or length of an array/object, over `scale`.
    Length { field: &'static str, scale: f32 },
    /// Whitespace-separated word count of a string, over `scale`.
    Words { field: &'static str, scale: f32 },
}

impl Feature {
    fn field(&self) -> &'static str {
        match self {
            Feature::Numeric { field, .. }
            | Feature::Categorical { field, .. }
            | Feature::Flag { field }
            | Feature::Present { field }
            | Feature::Length { field, .. }
            | Feature::Words { field, .. } => *field,
        }
    }

    fn extract(&self, fields: &Map<String, Value>) -> f32 {
        let Some(value) = fields.get(self.field()) else {
            return 0.0;
        };

        let raw = match self {
            Feature::Numeric { scale, .. } => as_number(value).map(|n| n / scale).unwrap_or(0.0),
            Feature::Categorical { table, .. } => value
                .as_str()
                .map(|label| lookup(table, label))
                .unwrap_or(0.0),
            Feature::Flag { .. } => match value {
                Value::Bool(b) => bool_lane(*b),
                Value::Number(_) => bool_lane(as_number(value).is_some_and(|n| n != 0.0)),
                Value::String(s) => {
                    bool_lane(matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1"))
                }
                _ => 0.0,
            },
            Feature::Present { .. } => bool_lane(match value {
                Value::Null => false,
                Value::String(s) => !s.trim().is_empty(),
                Value::Array(a) => !a.is_empty(),
                Value::Object(o) => !o.is_empty(),
                _ => true,
            }),
            Feature::Length { scale, .. } => {
                let len = match value {
                    Value::String(s) => s.chars().count(),
                    Value::Array(a) => a.len(),
                    Value::Object(o) => o.len(),
                    _ => 0,
                };
                len as f32 / scale
            }
            Feature::Words { scale, .. } => value
                .as_str()
                .map(|s| s.split_whitespace().count() as f32 / scale)
                .unwrap_or(0.0),
        };

        if raw.is_finite() {
            raw.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

fn bool_lane(b: bool) -> f32 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn as_number(value: &Value) -> Option<f32> {
    match value {
        Value::Number(n) => n.as_f64().map(|n| n as f32),
        Value::String(s) => s.trim().trim_end_matches('%').parse::<f32>().ok(),
        _ => None,
    }
}

fn lookup(table: &[(&str, f32)], label: &str) -> f32 {
    let label = label.trim();
    table
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(label))
        .map(|(_, v)| *v)
        .unwrap_or(0.0)
}

// --- LOOKUP TABLES ---

const AGENT_STATE: &[(&str, f32)] = &[
    ("active", 1.0),
    ("busy", 0.85),
    ("idle", 0.7),
    ("waiting", 0.55),
    ("paused", 0.4),
    ("offline", 0.25),
    ("error", 0.1),
];

const HEALTH: &[(&str, f32)] = &[("healthy", 1.0), ("degraded", 0.5), ("unhealthy", 0.1)];

const PRIORITY: &[(&str, f32)] = &[
    ("low", 0.25),
    ("normal", 0.5),
    ("regular", 0.5),
    ("medium", 0.5),
    ("high", 0.75),
    ("urgent", 1.0),
    ("critical", 1.0),
];

const MESSAGE_KIND: &[(&str, f32)] = &[
    ("text", 0.2),
    ("broadcast", 0.4),
    ("onboarding", 0.6),
    ("system", 0.8),
    ("agent_to_agent", 1.0),
];

const SENDER_KIND: &[(&str, f32)] = &[("agent", 0.33), ("captain", 0.66), ("system", 1.0)];

const DELIVERY: &[(&str, f32)] = &[
    ("pending", 0.25),
    ("sent", 0.5),
    ("delivered", 0.75),
    ("read", 1.0),
    ("failed", 0.1),
];

const TASK_STATE: &[(&str, f32)] = &[
    ("pending", 0.2),
    ("assigned", 0.35),
    ("in_progress", 0.5),
    ("blocked", 0.3),
    ("review", 0.75),
    ("completed", 1.0),
    ("failed", 0.1),
    ("cancelled", 0.05),
];

const COMPLEXITY: &[(&str, f32)] = &[
    ("trivial", 0.2),
    ("low", 0.4),
    ("medium", 0.6),
    ("high", 0.8),
    ("very_high", 1.0),
];

const STATUS_FEATURES: &[Feature] = &[
    Feature::Categorical { field: "status", table: AGENT_STATE },
    Feature::Categorical { field: "health", table: HEALTH },
    Feature::Numeric { field: "progress", scale: 100.0 },
    Feature::Numeric { field: "active_tasks", scale: 10.0 },
    Feature::Numeric { field: "completed_tasks", scale: 100.0 },
    Feature::Numeric { field: "failed_tasks", scale: 20.0 },
    Feature::Numeric { field: "error_count", scale: 10.0 },
    Feature::Numeric { field: "uptime_seconds", scale: 86_400.0 },
    Feature::Numeric { field: "cpu_usage", scale: 100.0 },
    Feature::Numeric { field: "memory_usage", scale: 100.0 },
    Feature::Numeric { field: "response_time_ms", scale: 10_000.0 },
    Feature::Present { field: "current_task" },
    Feature::Length { field: "capabilities", scale: 20.0 },
    Feature::Flag { field: "accepting_tasks" },
];

const MESSAGE_FEATURES: &[Feature] = &[
    Feature::Categorical { field: "message_type", table: MESSAGE_KIND },
    Feature::Categorical { field: "priority", table: PRIORITY },
    Feature::Categorical { field: "sender_type", table: SENDER_KIND },
    Feature::Categorical { field: "recipient_type", table: SENDER_KIND },
    Feature::Categorical { field: "delivery_status", table: DELIVERY },
    Feature::Length { field: "content", scale: 2_000.0 },
    Feature::Words { field: "content", scale: 300.0 },
    Feature::Length { field: "recipients", scale: 20.0 },
    Feature::Length { field: "tags", scale: 10.0 },
    Feature::Length { field: "attachments", scale: 10.0 },
    Feature::Flag { field: "requires_ack" },
    Feature::Present { field: "reply_to" },
    Feature::Numeric { field: "retry_count", scale: 5.0 },
];

const TASK_FEATURES: &[Feature] = &[
    Feature::Categorical { field: "status", table: TASK_STATE },
    Feature::Categorical { field: "priority", table: PRIORITY },
    Feature::Categorical { field: "complexity", table: COMPLEXITY },
    Feature::Numeric { field: "progress", scale: 100.0 },
    Feature::Numeric { field: "estimated_hours", scale: 40.0 },
    Feature::Numeric { field: "actual_hours", scale: 40.0 },
    Feature::Length { field: "dependencies", scale: 10.0 },
    Feature::Length { field: "subtasks", scale: 20.0 },
    Feature::Length { field: "description", scale: 2_000.0 },
    Feature::Words { field: "description", scale: 300.0 },
    Feature::Length { field: "tags", scale: 10.0 },
    Feature::Present { field: "assignee" },
    Feature::Present { field: "deadline" },
    Feature::Numeric { field: "retry_count", scale: 5.0 },
    Feature::Flag { field: "blocking" },
];

/// Deterministic record → vector mapping for one [`VectorType`].
#[derive(Debug, Clone, Copy)]
pub struct FeatureEncoder {
    vector_type: VectorType,
    features: &'static [Feature],
}

impl FeatureEncoder {
    pub fn new(vector_type: VectorType) -> Self {
        let features = match vector_type {
            VectorType::Status => STATUS_FEATURES,
            VectorType::Message => MESSAGE_FEATURES,
            VectorType::Task => TASK_FEATURES,
        };
        Self { vector_type, features }
    }

    pub fn vector_type(&self) -> VectorType {
        self.vector_type
    }

    pub fn features(&self) -> &'static [Feature] {
        self.features
    }

    /// Always returns exactly `VECTOR_DIM` lanes. Non-object input encodes as zeros.
    pub fn encode(&self, fields: &Value) -> Vec<f32> {
        let mut vector = vec![0.0f32; VECTOR_DIM];
        let Some(fields) = fields.as_object() else {
            return vector;
        };

        for (lane, feature) in vector.iter_mut().zip(self.features) {
            *lane = feature.extract(fields);
        }
        vector
    }

    /// Encodes `fields` into a fresh, active record owned by `agent_id`.
    ///
    /// The id comes from an `id` or `vector_id` string field when present,
    /// otherwise `<type>_<uuid>`. String entries of a `tags` array become
    /// tags; scalar top-level fields are copied into properties.
    pub fn build_record(&self, agent_id: &str, fields: &Value, source: &str) -> VectorRecord {
        let vector_id = ["vector_id", "id"]
            .iter()
            .find_map(|k| fields.get(*k).and_then(Value::as_str))
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}_{}", self.vector_type, Uuid::new_v4().simple()));

        let mut record = VectorRecord::new(vector_id, self.vector_type, agent_id, self.encode(fields), source);

        if let Some(tags) = fields.get("tags").and_then(Value::as_array) {
            record = record.with_tags(tags.iter().filter_map(Value::as_str));
        }

        if let Some(obj) = fields.as_object() {
            for (key, value) in obj {
                let scalar = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => continue,
                };
                record.metadata.properties.insert(key.clone(), scalar);
            }
        }

        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task() -> Value {
        json!({
            "id": "task_build_index",
            "status": "in_progress",
            "priority": "HIGH",
            "complexity": "medium",
            "progress": 40,
            "estimated_hours": "8",
            "dependencies": ["task_a", "task_b"],
            "description": "build the similarity index",
            "tags": ["backend", "vectors", 7],
            "assignee": "agent-2",
        })
    }

    #[test]
    fn tables_fit_in_vector() {
        for t in VectorType::ALL {
            assert!(FeatureEncoder::new(t).features().len() <= VECTOR_DIM, "{t}");
        }
    }

    #[test]
    fn encoding_is_deterministic() {
        for t in VectorType::ALL {
            let enc = FeatureEncoder::new(t);
            let input = task();
            assert_eq!(enc.encode(&input), enc.encode(&input));
        }
    }

    #[test]
    fn every_vector_has_fixed_width() {
        let inputs = [task(), json!({}), json!(null), json!([1, 2, 3]), json!({"status": 5})];
        for t in VectorType::ALL {
            let enc = FeatureEncoder::new(t);
            for input in &inputs {
                assert_eq!(enc.encode(input).len(), VECTOR_DIM);
            }
        }
    }

    #[test]
    fn task_lanes_follow_the_table() {
        let v = FeatureEncoder::new(VectorType::Task).encode(&task());
        assert_eq!(v[0], 0.5); // in_progress
        assert_eq!(v[1], 0.75); // HIGH, case-insensitive
        assert_eq!(v[2], 0.6); // medium
        assert_eq!(v[3], 0.4); // 40 / 100
        assert_eq!(v[4], 0.2); // "8" / 40
        assert_eq!(v[6], 0.2); // 2 deps / 10
        assert_eq!(v[11], 1.0); // assignee present
        assert_eq!(v[12], 0.0); // no deadline
        assert!(v[TASK_FEATURES.len()..].iter().all(|x| *x == 0.0));
    }

    #[test]
    fn unknown_and_malformed_values_encode_as_zero() {
        let enc = FeatureEncoder::new(VectorType::Status);
        let v = enc.encode(&json!({
            "status": "hibernating",
            "health": 3,
            "progress": "lots",
            "cpu_usage": -40,
            "error_count": 1e9,
        }));
        assert!(v.iter().all(|x| *x == 0.0 || *x == 1.0));
        assert_eq!(v[0], 0.0);
        assert_eq!(v[1], 0.0);
        assert_eq!(v[2], 0.0);
        assert_eq!(v[8], 0.0);
        assert_eq!(v[6], 1.0); // clamped
    }

    #[test]
    fn non_object_is_zero_vector() {
        let enc = FeatureEncoder::new(VectorType::Message);
        assert_eq!(enc.encode(&json!("hello")), vec![0.0; VECTOR_DIM]);
    }

    #[test]
    fn message_flags_and_lengths() {
        let enc = FeatureEncoder::new(VectorType::Message);
        let v = enc.encode(&json!({
            "message_type": "broadcast",
            "priority": "urgent",
            "content": "all agents report status",
            "requires_ack": "yes",
            "reply_to": "",
        }));
        assert_eq!(v[0], 0.4);
        assert_eq!(v[1], 1.0);
        assert_eq!(v[5], 24.0 / 2_000.0);
        assert_eq!(v[6], 4.0 / 300.0);
        assert_eq!(v[10], 1.0);
        assert_eq!(v[11], 0.0);
    }

    #[test]
    fn build_record_uses_supplied_id_tags_and_scalars() {
        let enc = FeatureEncoder::new(VectorType::Task);
        let r = enc.build_record("agent-2", &task(), "task_integration");

        assert_eq!(r.id(), "task_build_index");
        assert_eq!(r.metadata.vector_type, VectorType::Task);
        assert_eq!(r.metadata.agent_id, "agent-2");
        assert_eq!(r.metadata.source, "task_integration");
        assert_eq!(r.metadata.dimensions, VECTOR_DIM);
        assert!(r.validate(VECTOR_DIM).is_ok());

        assert_eq!(r.metadata.tags.len(), 2);
        assert!(r.metadata.tags.contains("vectors"));
        assert_eq!(r.metadata.properties.get("progress").map(String::as_str), Some("40"));
        assert!(!r.metadata.properties.contains_key("dependencies"));
    }

    #[test]
    fn build_record_generates_prefixed_ids() {
        let enc = FeatureEncoder::new(VectorType::Status);
        let a = enc.build_record("agent-1", &json!({"status": "idle"}), "status");
        let b = enc.build_record("agent-1", &json!({"status": "idle"}), "status");
        assert!(a.id().starts_with("status_"));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.vector_data, b.vector_data);
    }
}

use thiserror::Error;

use crate::model::VectorStatus;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode record: {0}")]
    Encode(String),

    #[error("corrupt data at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("vector not found: {0}")]
    NotFound(String),

    #[error("invalid status transition for {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: String,
        from: VectorStatus,
        to: VectorStatus,
    },

    #[error("poisoned lock: {0}")]
    LockPoisoned(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = StoreError::DimensionMismatch { expected: 32, actual: 7 };
        assert_eq!(err.to_string(), "dimension mismatch: expected 32, got 7");

        let err = StoreError::InvalidTransition {
            id: "task_1".into(),
            from: VectorStatus::Deleted,
            to: VectorStatus::Active,
        };
        assert!(err.to_string().contains("task_1"));
        assert!(err.to_string().contains("Deleted -> Active"));
    }

    #[test]
    fn io_errors_convert() {
        fn fails() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(StoreError::Io(_))));
    }
}

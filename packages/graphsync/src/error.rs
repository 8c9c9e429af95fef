//! Error types for vector evaluation and tree reconciliation

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Access violation: {0}")]
    AccessViolation(String),

    #[error("Fetching records failed applying {step} to {value}: {source}")]
    EvaluationFailure {
        step: String,
        value: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Invalid vector: {0}")]
    InvalidVector(String),

    #[error("Decode shape mismatch at '{key}': {reason}")]
    DecodeShapeMismatch { key: String, reason: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MessagePack encode error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode error: {0}")]
    MsgpackDecode(#[from] rmp_serde::decode::Error),
}

impl SyncError {
    /// Get error code for wire protocol
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::AccessViolation(_) => "ACCESS_VIOLATION",
            SyncError::EvaluationFailure { .. } => "EVALUATION_FAILURE",
            SyncError::InvalidVector(_) => "INVALID_VECTOR",
            SyncError::DecodeShapeMismatch { .. } => "DECODE_SHAPE_MISMATCH",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Whether the error aborts a whole encode batch.
    ///
    /// Shape mismatches are only produced while decoding and are logged
    /// rather than propagated.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SyncError::DecodeShapeMismatch { .. })
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(SyncError::AccessViolation("x".into()).code(), "ACCESS_VIOLATION");
        assert_eq!(SyncError::InvalidVector("x".into()).code(), "INVALID_VECTOR");
        assert_eq!(SyncError::Store("x".into()).code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_evaluation_failure_message_has_context() {
        let err = SyncError::EvaluationFailure {
            step: "title".to_string(),
            value: "Todo#3".to_string(),
            source: anyhow::anyhow!("boom"),
        };
        let msg = err.to_string();
        assert!(msg.contains("title"));
        assert!(msg.contains("Todo#3"));
        assert!(msg.contains("boom"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_shape_mismatch_not_fatal() {
        let err = SyncError::DecodeShapeMismatch {
            key: "foo".to_string(),
            reason: "unknown".to_string(),
        };
        assert!(!err.is_fatal());
    }
}

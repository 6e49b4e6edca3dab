//! Tracking kernel — error taxonomy.
//!
//! Structural failures propagate immediately. Validation failures are
//! either aggregated into one error or reported per row, depending on
//! `SaveSettings`.

use thiserror::Error;

/// One per-row validation failure: (error code, message).
pub type ValidationMessage = (i32, String);

/// All kernel failures.
#[derive(Debug, Error)]
pub enum OrmError {
    /// A required input was missing.
    #[error("ArgumentNull: {0}")]
    ArgumentNull(&'static str),

    /// No service could identify or track the object.
    #[error("ObjectTrackingIssue: {0}")]
    ObjectTrackingIssue(String),

    /// Misconfiguration: unknown type, unresolvable wrapper, missing property.
    #[error("InvalidOperation: {0}")]
    InvalidOperation(String),

    /// Same-key object re-registered with differing values.
    #[error("MergeConflict: {type_name}.{field} differs from the tracked value")]
    MergeConflict { type_name: String, field: String },

    /// Delete blocked by live children.
    #[error("ConstraintViolation: {0}")]
    ConstraintViolation(String),

    /// Aggregate of per-row validation failures.
    #[error("ValidationFailure: {summary} ({} row(s))", failures.len())]
    Validation {
        summary: String,
        failures: Vec<ValidationMessage>,
    },

    /// Cooperative timeout exceeded during retrieval.
    #[error("TimedOut: {0}")]
    TimedOut(String),

    /// Raised by a persistence collaborator.
    #[error("Persistence: {0}")]
    Persistence(String),

    /// Malformed input at the serialization boundary.
    #[error("Serialization: {0}")]
    Serialization(String),
}

impl OrmError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        OrmError::InvalidOperation(msg.into())
    }

    pub fn tracking(msg: impl Into<String>) -> Self {
        OrmError::ObjectTrackingIssue(msg.into())
    }

    /// True for errors raised by the cooperative timeout watcher.
    pub fn is_timeout(&self) -> bool {
        matches!(self, OrmError::TimedOut(_))
    }
}

impl From<serde_json::Error> for OrmError {
    fn from(err: serde_json::Error) -> Self {
        OrmError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_conflict_names_type_and_field() {
        let err = OrmError::MergeConflict {
            type_name: "Order".to_string(),
            field: "total".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "MergeConflict: Order.total differs from the tracked value"
        );
    }

    #[test]
    fn test_validation_counts_rows() {
        let err = OrmError::Validation {
            summary: "Multiple validation failures.".to_string(),
            failures: vec![(-1, "a".to_string()), (-2, "b".to_string())],
        };
        assert!(err.to_string().contains("2 row(s)"));
        assert!(!err.is_timeout());
    }
}

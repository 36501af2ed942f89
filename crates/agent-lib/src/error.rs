//! Input validation errors
//!
//! Everything past validation is total: store, aggregator and detector
//! operations do not fail on well-formed input.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{entity} is missing required field `{field}`")]
    MissingField {
        entity: &'static str,
        field: &'static str,
    },

    #[error("{entity} has invalid `{field}`: {reason}")]
    InvalidValue {
        entity: &'static str,
        field: &'static str,
        reason: String,
    },
}

impl ValidationError {
    pub fn entity(&self) -> &'static str {
        match self {
            ValidationError::MissingField { entity, .. }
            | ValidationError::InvalidValue { entity, .. } => entity,
        }
    }
}

/// Reject empty or whitespace-only identifiers
pub(crate) fn require(
    value: &str,
    entity: &'static str,
    field: &'static str,
) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::MissingField { entity, field })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_rejects_blank() {
        let err = require("  ", "node", "name").unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingField {
                entity: "node",
                field: "name"
            }
        );
        assert_eq!(err.to_string(), "node is missing required field `name`");
        assert!(require("web", "node", "name").is_ok());
    }
}

//! Structured validation results and non-fatal integrity warnings.

use serde::{Deserialize, Serialize};

use crate::error::LearningError;

/// Outcome of an explicit structural check on a record, pattern, insight or metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self { is_valid: true, errors: Vec::new(), warnings: Vec::new() }
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
        self.is_valid = false;
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Record `msg` as an error unless `cond` holds.
    pub fn require(&mut self, cond: bool, msg: impl Into<String>) {
        if !cond {
            self.error(msg);
        }
    }

    /// Convert into a `Result`, mapping an invalid report to [`LearningError::Validation`].
    pub fn into_result(self, subject: impl Into<String>) -> Result<Vec<String>, LearningError> {
        if self.is_valid {
            Ok(self.warnings)
        } else {
            Err(LearningError::validation(subject, self.errors))
        }
    }
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-fatal inconsistency detected during an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityWarning {
    pub subject: String,
    pub message: String,
}

impl std::fmt::Display for IntegrityWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.subject, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_report_is_valid() {
        let r = ValidationReport::new();
        assert!(r.is_valid);
        assert!(r.errors.is_empty());
    }

    #[test]
    fn test_error_invalidates() {
        let mut r = ValidationReport::new();
        r.warn("just a warning");
        assert!(r.is_valid);
        r.require(false, "broken");
        assert!(!r.is_valid);
        assert_eq!(r.errors, vec!["broken".to_string()]);
    }

    #[test]
    fn test_default_matches_new() {
        let r = ValidationReport::default();
        assert_eq!(r, ValidationReport::new());
        assert!(r.is_valid);
        assert!(r.into_result("x").unwrap().is_empty());
    }

    #[test]
    fn test_into_result() {
        let mut r = ValidationReport::new();
        r.warn("w");
        assert_eq!(r.clone().into_result("x").unwrap(), vec!["w".to_string()]);
        r.error("e");
        assert!(matches!(r.into_result("x"), Err(LearningError::Validation { .. })));
    }
}

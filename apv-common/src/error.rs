//! Common error types for apv

use std::path::PathBuf;
use thiserror::Error;

use crate::measurement::Unit;

/// Common result type for apv operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the apv crates
#[derive(Error, Debug)]
pub enum Error {
    /// A quantity's unit disagrees with the unit declared for its metric,
    /// or two measurements of different units were combined
    #[error("Unit mismatch for {metric}: expected {expected}, found {found}")]
    UnitMismatch {
        metric: String,
        expected: Unit,
        found: Unit,
    },

    /// A fraction combinator received numerator and denominator groups that
    /// do not line up one-to-one
    #[error(
        "Mismatched pairing: {numerator} has {numerators} measurements, {denominator} has {denominators}"
    )]
    MismatchedPairing {
        numerator: String,
        denominator: String,
        numerators: usize,
        denominators: usize,
    },

    /// Weighted average with a total weight of zero
    #[error("Division by zero: total weight for {metric} is zero")]
    DivisionByZero { metric: String },

    /// A partial denominator could not be turned back into a denominator
    /// because its fraction is exactly 1
    #[error("Undefined denominator for {metric} at position {index}: fraction is 1")]
    UndefinedDenominator { metric: String, index: usize },

    /// Serialized measurements could not be located, read or parsed
    #[error("Measurement storage error: {context}")]
    MeasurementStorage {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The job of the final unit is required for cumulative metrics
    #[error("Final job file not found: {}", .0.display())]
    MissingFinalJob(PathBuf),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Wrap an I/O or parse failure as a measurement storage error
    pub fn storage(
        context: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Error::MeasurementStorage {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Arithmetic failures a merge can skip for a single metric without
    /// invalidating the rest of the aggregate
    pub fn is_undefined_arithmetic(&self) -> bool {
        matches!(
            self,
            Error::DivisionByZero { .. } | Error::UndefinedDenominator { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_storage_error_keeps_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = Error::storage("reading /tmp/missing.json", io);

        assert!(err.to_string().contains("/tmp/missing.json"));
        let source = err.source().expect("storage error has a source");
        assert!(source.to_string().contains("no such file"));
    }

    #[test]
    fn test_undefined_arithmetic_classification() {
        assert!(Error::DivisionByZero { metric: "a.b".into() }.is_undefined_arithmetic());
        assert!(Error::UndefinedDenominator { metric: "a.b".into(), index: 0 }
            .is_undefined_arithmetic());
        assert!(!Error::MismatchedPairing {
            numerator: "a.frac".into(),
            denominator: "a.num".into(),
            numerators: 2,
            denominators: 1,
        }
        .is_undefined_arithmetic());
    }
}

//! Typed error kinds for the storage engine.
//!
//! Most of the crate returns `eyre::Result` with context attached via
//! `wrap_err`, matching the rest of the I/O stack. The `EngineError` enum
//! exists so call sites that need to branch on a failure class (missing
//! object, truncated header, full cache) can downcast the report instead of
//! string-matching.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Underlying device or backend I/O failure.
    #[error("i/o error: {0}")]
    Io(String),

    /// Bad magic, unknown version, or truncated/overlapping structure.
    #[error("format error: {0}")]
    Format(String),

    /// The named object does not exist on the backend.
    #[error("object not found: {0}")]
    NotFound(String),

    /// The read cache has no free slot to admit into.
    #[error("read cache exhausted")]
    Exhausted,

    /// Shutdown raced a blocking wait.
    #[error("operation cancelled by shutdown")]
    Cancelled,
}

/// True if the error chain of `report` bottoms out in `EngineError::NotFound`.
pub fn is_not_found(report: &eyre::Report) -> bool {
    matches!(
        report.downcast_ref::<EngineError>(),
        Some(EngineError::NotFound(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downcast_through_report() {
        let report = eyre::Report::new(EngineError::NotFound("vol.00000007".into()));
        assert!(is_not_found(&report));

        let report = eyre::Report::new(EngineError::Exhausted);
        assert!(!is_not_found(&report));
        assert_eq!(
            report.downcast_ref::<EngineError>(),
            Some(&EngineError::Exhausted)
        );
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            EngineError::Format("short header".into()).to_string(),
            "format error: short header"
        );
        assert_eq!(EngineError::Exhausted.to_string(), "read cache exhausted");
    }
}

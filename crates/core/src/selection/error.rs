//! Error types for selection tree evaluation.
//!
//! Only two classes exist, both fatal for the current evaluation pass:
//! internal/logic errors signal a malformed or miscompiled tree, and
//! not-implemented errors mark documented gaps. Neither is retried;
//! callers treat an error from `evaluate` as terminating the analysis.

use thiserror::Error;

/// Fatal evaluation error.
#[derive(Debug, Clone, Error)]
pub enum EvalError {
    /// An invariant of the compiled tree was violated. Indicates a bug in
    /// tree construction, not bad user input.
    #[error("internal selection error: {0}")]
    Internal(String),
    /// A documented gap in the evaluator was hit on this call path.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
}

impl EvalError {
    pub fn internal(message: impl Into<String>) -> Self {
        EvalError::Internal(message.into())
    }
}

/// Result alias used throughout the evaluator.
pub type EvalResult<T = ()> = Result<T, EvalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = EvalError::internal("mismatching value types");
        assert_eq!(
            e.to_string(),
            "internal selection error: mismatching value types"
        );
        let e = EvalError::NotImplemented("position subexpressions");
        assert_eq!(e.to_string(), "not implemented: position subexpressions");
    }
}

use thiserror::Error;

/// Typed error hierarchy for sheetmind.
///
/// Use at module boundaries (crawler, analytics engine, tools, conversation
/// store, config). Internal/leaf functions can continue using
/// `anyhow::Result`; the `Internal` variant allows seamless conversion via
/// the `?` operator.
#[derive(Debug, Error)]
pub enum SheetmindError {
    /// Bad input shape, bad range, unsupported field/feature, pipeline
    /// policy violation. Carries a machine-readable code and a
    /// human-readable message. Never retried.
    #[error("{code}: {message}")]
    Validation { code: &'static str, message: String },

    /// Entity missing or owned by another user. Both cases collapse to
    /// not-found so existence never leaks across tenants.
    #[error("{0} not found")]
    NotFound(String),

    /// An external collaborator (sheet source, document store, model) is
    /// unavailable or rejected the request. Fatal to the current operation,
    /// retryable by the sync worker.
    #[error("External service error: {0}")]
    External(String),

    /// A data-query tool rejected its invocation. Fed back to the model as
    /// a tool result rather than surfaced to the caller.
    #[error("Tool error: {0}")]
    Tool(String),

    /// Misconfiguration detected at startup. The process refuses to start.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SheetmindError {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    /// Whether the sync worker should re-enqueue the task that hit this
    /// error. Validation and not-found failures will fail identically on
    /// every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::External(_) | Self::Internal(_) => true,
            Self::Validation { .. } | Self::NotFound(_) | Self::Tool(_) | Self::Config(_) => false,
        }
    }

    /// The stable validation code, if this is a validation error.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::Validation { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Validation codes shared between the analytics engine, the pipeline
/// validator and the data-query tools. Kept as plain constants so tool
/// results and HTTP bodies carry identical strings.
pub mod codes {
    pub const FEATURE_UNSUPPORTED: &str = "FEATURE_UNSUPPORTED";
    pub const FIELD_UNSUPPORTED: &str = "FIELD_UNSUPPORTED";
    pub const BAD_RANGE: &str = "BAD_RANGE";
    pub const BAD_LIMIT: &str = "BAD_LIMIT";
    pub const FORBIDDEN_STAGE: &str = "FORBIDDEN_STAGE";
    pub const FORBIDDEN_LOOKUP: &str = "FORBIDDEN_LOOKUP";
    pub const MAPPING_ERROR: &str = "MAPPING_ERROR";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_not_retryable() {
        let err = SheetmindError::validation(codes::BAD_RANGE, "date_from > date_to");
        assert!(!err.is_retryable());
        assert_eq!(err.code(), Some(codes::BAD_RANGE));
        assert_eq!(err.to_string(), "BAD_RANGE: date_from > date_to");
    }

    #[test]
    fn external_errors_are_retryable() {
        assert!(SheetmindError::External("sheet unreachable".into()).is_retryable());
        assert!(!SheetmindError::NotFound("connection".into()).is_retryable());
    }
}

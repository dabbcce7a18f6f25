//! Error types shared by the provider adapter contract (C3) and the retry
//! policy (C2). See `spec.md` §7 ERROR HANDLING DESIGN for the taxonomy this
//! enum follows: configuration errors raise to the caller unconditionally,
//! transient errors are retried per [`crate::retry::RetryPolicy`], and
//! provider-transport errors (auth, bad request, content policy) never are.

/// Errors that can occur while talking to an LLM provider through the
/// [`crate::provider::ProviderAdapter`] contract.
#[derive(Debug, thiserror::Error)]
pub enum LLMError {
    /// Transport-level failure (connection reset/refused, DNS failure, or a
    /// generic HTTP-equivalent error with no more specific classification).
    #[error("transport error: {0}")]
    Transport(String),

    /// Authentication/authorization failure. Never retryable.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Malformed or rejected request (HTTP-equivalent 400). Never retryable.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The requested resource (model, endpoint) does not exist. Never retryable.
    #[error("not found: {0}")]
    NotFound(String),

    /// The provider refused the request on content-policy grounds. Never retryable.
    #[error("content policy violation: {0}")]
    ContentPolicy(String),

    /// Rate limit / quota exceeded. Carries a parsed Retry-After hint, if any.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_ms: Option<u64>,
    },

    /// Server-side overload or 5xx-equivalent failure. Retryable.
    #[error("server error: {0}")]
    ServerOverloaded(String),

    /// A generic provider-reported error not covered by a more specific variant.
    #[error("provider error: {0}")]
    Provider(String),

    /// The provider's response could not be parsed into the expected shape.
    #[error("response format error: {message} (raw: {raw_response})")]
    ResponseFormat {
        message: String,
        raw_response: String,
    },

    /// JSON (de)serialization failure.
    #[error("json error: {0}")]
    Json(String),

    /// The in-flight request was cancelled via the run's cancellation token.
    #[error("aborted")]
    Aborted,
}

impl LLMError {
    /// Classifies this error per §4.2: retryable iff it is rate-limiting,
    /// overload/5xx, or a bare transport failure (connection reset, DNS,
    /// timeout). Authentication, permission, bad-request, not-found, and
    /// content-policy errors are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LLMError::Transport(_) | LLMError::RateLimited { .. } | LLMError::ServerOverloaded(_)
        )
    }

    /// Retry-After hint carried by the error, if the provider supplied one.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            LLMError::RateLimited { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }
}

impl From<serde_json::Error> for LLMError {
    fn from(err: serde_json::Error) -> Self {
        LLMError::Json(format!("{err} at line {} column {}", err.line(), err.column()))
    }
}

/// Error raised by [`crate::model::ModelId::parse`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelIdError {
    #[error("model identifier is empty")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_retryable_errors() {
        assert!(LLMError::Transport("reset".into()).is_retryable());
        assert!(LLMError::ServerOverloaded("503".into()).is_retryable());
        assert!(
            LLMError::RateLimited {
                message: "too many requests".into(),
                retry_after_ms: Some(2_000),
            }
            .is_retryable()
        );
    }

    #[test]
    fn classifies_non_retryable_errors() {
        assert!(!LLMError::Auth("bad key".into()).is_retryable());
        assert!(!LLMError::InvalidRequest("bad json".into()).is_retryable());
        assert!(!LLMError::NotFound("no such model".into()).is_retryable());
        assert!(!LLMError::ContentPolicy("blocked".into()).is_retryable());
    }

    #[test]
    fn retry_after_only_on_rate_limited() {
        let e = LLMError::RateLimited {
            message: "slow down".into(),
            retry_after_ms: Some(500),
        };
        assert_eq!(e.retry_after_ms(), Some(500));
        assert_eq!(LLMError::Auth("x".into()).retry_after_ms(), None);
    }
}

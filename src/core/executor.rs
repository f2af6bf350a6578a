//! The external call contract consumed by the request processor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::EstimationError;

/// Token usage reported by the provider for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens billed.
    pub input_tokens: u64,
    /// Completion tokens billed.
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Create a usage record.
    #[must_use]
    pub const fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Input plus output tokens.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Typed response of an external call.
///
/// `usage` is optional: providers that omit usage metadata are handled by
/// recording the estimate instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallResponse<T> {
    /// Call output.
    pub output: T,
    /// Provider-reported usage, when present.
    pub usage: Option<TokenUsage>,
}

impl<T> CallResponse<T> {
    /// Response with usage metadata.
    pub const fn with_usage(output: T, usage: TokenUsage) -> Self {
        Self {
            output,
            usage: Some(usage),
        }
    }

    /// Response without usage metadata.
    pub const fn without_usage(output: T) -> Self {
        Self {
            output,
            usage: None,
        }
    }
}

/// Failure of an external call.
#[derive(Debug, Error)]
pub enum CallError {
    /// The provider rejected the call because a rate limit was hit. Retried.
    #[error("rate limited by provider: {message}")]
    RateLimited {
        /// Provider message.
        message: String,
    },
    /// Any other failure. Propagated to the caller.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl CallError {
    /// Build a rate-limit rejection.
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
        }
    }

    /// Build a generic failure from a message.
    pub fn failed(message: impl std::fmt::Display) -> Self {
        Self::Failed(anyhow::anyhow!("{message}"))
    }

    /// Whether this is a provider rate-limit rejection.
    #[must_use]
    pub const fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// A quota-limited external API call.
///
/// The processor estimates the cost of `payload` from its character count,
/// reserves a slot, waits, and then invokes [`ExternalCall::call`].
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use reservation_scheduler::core::{CallError, CallResponse, ExternalCall, TokenUsage};
///
/// #[derive(Clone)]
/// struct Summarize;
///
/// #[async_trait]
/// impl ExternalCall<String, String> for Summarize {
///     async fn call(&self, prompt: &String) -> Result<CallResponse<String>, CallError> {
///         Ok(CallResponse::with_usage(prompt.to_uppercase(), TokenUsage::new(120, 40)))
///     }
/// }
/// ```
#[async_trait]
pub trait ExternalCall<P, T>: Send + Sync + Clone + 'static
where
    P: Serialize + Send + Sync + 'static,
    T: Send + 'static,
{
    /// Character count used by the length heuristic.
    ///
    /// Defaults to the length of the payload's JSON encoding.
    fn prompt_chars(&self, payload: &P) -> Result<usize, EstimationError> {
        serde_json::to_string(payload)
            .map(|s| s.chars().count())
            .map_err(|e| EstimationError(e.to_string()))
    }

    /// Perform the call.
    async fn call(&self, payload: &P) -> Result<CallResponse<T>, CallError>;
}

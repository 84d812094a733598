//! Completion calls through the gate, with bounded exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use reportloom_backend::{CompletionBackend, CompletionRequest};
use reportloom_shared::{ReportLoomError, Result, RetryConfig};

use crate::gate::CallGate;

/// Backoff schedule for transient backend failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// No waiting between attempts.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

/// A completion backend behind the run's [`CallGate`].
#[derive(Clone)]
pub struct ModelClient {
    backend: Arc<dyn CompletionBackend>,
    gate: CallGate,
    retry: RetryPolicy,
}

impl ModelClient {
    pub fn new(backend: Arc<dyn CompletionBackend>, gate: CallGate, retry: RetryPolicy) -> Self {
        Self {
            backend,
            gate,
            retry,
        }
    }

    pub fn model_id(&self) -> &str {
        self.backend.model_id()
    }

    /// One completion, retried on transient failure.
    pub async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.complete_with(request, |text| Ok(text.to_string())).await
    }

    /// One completion whose reply must pass `parse`.
    ///
    /// A reply that fails to parse counts as a transient failure and is
    /// retried like a transport error. Each attempt takes its own permit.
    pub async fn complete_with<T, P>(&self, request: &CompletionRequest, parse: P) -> Result<T>
    where
        P: Fn(&str) -> Result<T>,
    {
        let mut attempt = 0u32;
        loop {
            let result = self
                .gate
                .run(self.backend.complete(request))
                .await
                .and_then(|text| parse(&text));

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient backend failure, retrying"
                    );
                    self.gate.sleep(delay).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for ModelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelClient")
            .field("model", &self.backend.model_id())
            .field("gate", &self.gate)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Reject blank replies so they are retried.
pub(crate) fn non_empty(text: &str) -> Result<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        Err(ReportLoomError::parse("empty completion"))
    } else {
        Ok(trimmed.to_string())
    }
}

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, warn};

use crate::error::{AgentError, ProviderError};
use crate::llm::{ChatModel, ModelCompletion, ModelMessage, ModelToolDefinition};

/// Bounded exponential backoff plus a consecutive-failure circuit breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per call, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Upper bound on a single provider call.
    pub call_timeout: Duration,
    /// Consecutive failed attempts (across calls) that open the breaker.
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            call_timeout: Duration::from_secs(120),
            breaker_threshold: 12,
            breaker_cooldown: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0 for the first retry).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(i32::MAX as u32) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Wraps a [`ChatModel`] with per-call timeout, retry and circuit breaking.
///
/// The client holds no per-episode state: cost is returned with each
/// completion and summed by the caller.
pub struct ModelClient {
    model: Arc<dyn ChatModel>,
    policy: RetryPolicy,
    breaker: Mutex<BreakerState>,
}

impl std::fmt::Debug for ModelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelClient")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ModelClient {
    pub fn new(model: Arc<dyn ChatModel>, policy: RetryPolicy) -> Self {
        Self {
            model,
            policy,
            breaker: Mutex::new(BreakerState::default()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Requests the next assistant turn, returning it with its cost.
    pub async fn complete(
        &self,
        messages: &[ModelMessage],
        tools: &[ModelToolDefinition],
        temperature: f32,
    ) -> Result<(ModelCompletion, f64), AgentError> {
        self.ensure_closed()?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match timeout(
                self.policy.call_timeout,
                self.model.invoke(messages, tools, temperature),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(
                    self.policy.call_timeout.as_millis() as u64,
                )),
            };

            let err = match outcome {
                Ok(completion) => {
                    self.record_success();
                    let cost = completion.cost.unwrap_or(0.0);
                    debug!(attempt, cost, "model call succeeded");
                    return Ok((completion, cost));
                }
                Err(err) => err,
            };

            let opened_for = self.record_failure();

            if !err.is_transient() {
                return Err(AgentError::Provider(err));
            }
            if attempt >= self.policy.max_attempts {
                return Err(AgentError::RetriesExhausted {
                    attempts: attempt,
                    last: err,
                });
            }
            if let Some(cooldown) = opened_for {
                warn!(
                    error = %err,
                    cooldown_ms = cooldown.as_millis() as u64,
                    "model circuit breaker opened"
                );
                return Err(AgentError::CircuitOpen {
                    retry_in_ms: cooldown.as_millis() as u64,
                });
            }

            let delay = self.policy.delay_for(attempt - 1);
            warn!(
                error = %err,
                attempt,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "transient model failure, retrying"
            );
            sleep(delay).await;
        }
    }

    fn ensure_closed(&self) -> Result<(), AgentError> {
        let mut state = self.lock_breaker();
        if let Some(until) = state.open_until {
            let now = Instant::now();
            if now < until {
                return Err(AgentError::CircuitOpen {
                    retry_in_ms: (until - now).as_millis() as u64,
                });
            }
            // Half-open: the failure count is kept, so one more failure reopens.
            state.open_until = None;
        }
        Ok(())
    }

    fn record_success(&self) {
        let mut state = self.lock_breaker();
        state.consecutive_failures = 0;
        state.open_until = None;
    }

    /// Returns the cooldown if this failure opened the breaker.
    fn record_failure(&self) -> Option<Duration> {
        let mut state = self.lock_breaker();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.consecutive_failures >= self.policy.breaker_threshold.max(1) {
            state.open_until = Some(Instant::now() + self.policy.breaker_cooldown);
            return Some(self.policy.breaker_cooldown);
        }
        None
    }

    fn lock_breaker(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.breaker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

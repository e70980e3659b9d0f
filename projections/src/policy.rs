//! Error handling policy evaluator.
//!
//! Handler failures are not branched on by error type. Each attempt is
//! classified into a [`HandlerOutcome`], and a pure evaluator turns the outcome
//! into the next [`PolicyDecision`]:
//!
//! ```text
//!   attempt ─▶ classify ─▶ Success ─────────────▶ Complete
//!                       ├▶ RetryableFailure ────▶ Retry { delay }
//!                       └▶ TerminalFailure ─────▶ Skip | Stop
//! ```
//!
//! A failure is retryable only under [`ErrorStrategy::Retry`] and only while
//! `attempt < max_retry_attempts`. A terminal failure resolves to the
//! strategy itself (`Skip`/`Stop`) or, for `Retry`, to the fallback.
//!
//! Backoff delays double per attempt and are capped:
//! `delay(attempt) = min(initial * 2^(attempt - 1), max)`.

use foldline_core::error::{ProjectionError, Result};
use foldline_core::options::{ErrorHandlingOptions, ErrorStrategy, FallbackStrategy};
use std::time::Duration;

/// Outcome of one handler invocation attempt.
#[derive(Debug)]
pub enum HandlerOutcome {
    /// The handler succeeded
    Success,
    /// The handler failed and may be retried
    RetryableFailure(ProjectionError),
    /// The handler failed and no attempts remain
    TerminalFailure(ProjectionError),
}

impl HandlerOutcome {
    /// The failure, if the attempt failed.
    #[must_use]
    pub const fn error(&self) -> Option<&ProjectionError> {
        match self {
            Self::Success => None,
            Self::RetryableFailure(error) | Self::TerminalFailure(error) => Some(error),
        }
    }
}

/// What the worker does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Mark the event processed
    Complete,
    /// Wait, then retry the same event
    Retry {
        /// Backoff before the next attempt
        delay: Duration,
    },
    /// Mark the event processed without applying it
    Skip,
    /// Halt the partition; the event is not marked processed
    Stop,
}

/// Applies a projection's [`ErrorHandlingOptions`].
#[derive(Debug, Clone)]
pub struct ErrorPolicy {
    options: ErrorHandlingOptions,
}

impl ErrorPolicy {
    /// Create a policy from validated options.
    #[must_use]
    pub const fn new(options: ErrorHandlingOptions) -> Self {
        Self { options }
    }

    /// The underlying options.
    #[must_use]
    pub const fn options(&self) -> &ErrorHandlingOptions {
        &self.options
    }

    /// Classify the result of attempt number `attempt` (1-based).
    #[must_use]
    pub fn classify(&self, result: Result<()>, attempt: u32) -> HandlerOutcome {
        match result {
            Ok(()) => HandlerOutcome::Success,
            Err(error)
                if self.options.strategy == ErrorStrategy::Retry
                    && attempt < self.options.max_retry_attempts =>
            {
                HandlerOutcome::RetryableFailure(error)
            }
            Err(error) => HandlerOutcome::TerminalFailure(error),
        }
    }

    /// Decide the next action after attempt number `attempt`.
    #[must_use]
    pub fn decide(&self, outcome: &HandlerOutcome, attempt: u32) -> PolicyDecision {
        match outcome {
            HandlerOutcome::Success => PolicyDecision::Complete,
            HandlerOutcome::RetryableFailure(_) => PolicyDecision::Retry {
                delay: self.retry_delay(attempt),
            },
            HandlerOutcome::TerminalFailure(_) => self.terminal_decision(),
        }
    }

    /// Decision for a failure that is never retried, such as a key function
    /// failure. Under `Retry` this is the fallback strategy.
    #[must_use]
    pub const fn terminal_decision(&self) -> PolicyDecision {
        match self.options.strategy {
            ErrorStrategy::Skip => PolicyDecision::Skip,
            ErrorStrategy::Stop => PolicyDecision::Stop,
            ErrorStrategy::Retry => match self.options.fallback_strategy {
                FallbackStrategy::Skip => PolicyDecision::Skip,
                FallbackStrategy::Stop => PolicyDecision::Stop,
            },
        }
    }

    /// Backoff before retrying after attempt number `attempt` failed.
    #[must_use]
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1_u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.options
            .initial_retry_delay
            .checked_mul(factor)
            .map_or(self.options.max_retry_delay, |delay| {
                delay.min(self.options.max_retry_delay)
            })
    }
}

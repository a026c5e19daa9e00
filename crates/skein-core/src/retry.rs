//! Retry scheduling
//!
//! Computes the delay for each retry attempt of a Try node from its
//! policy: base delay, backoff strategy, and bounded uniform jitter.
//! The jitter RNG is seeded from (workflow id, try position, attempt) so
//! that replaying an advancement produces the same schedule.

use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use crate::dsl::{BackoffKind, RetryDefinition};
use crate::error::WorkflowError;
use crate::tree::Position;

/// Upper bound applied to exponential backoff, absent a policy limit
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 3_600_000;

/// Deterministic jitter seed for one (instance, try position, attempt)
pub fn jitter_seed(workflow_id: Uuid, position: &Position, attempt: u32) -> u64 {
    let mut hasher = std::hash::DefaultHasher::new();
    workflow_id.hash(&mut hasher);
    position.to_string().hash(&mut hasher);
    attempt.hash(&mut hasher);
    hasher.finish()
}

/// Delay before the retry with the given attempt index (0-based)
///
/// Backoff:
/// - constant: the configured delay, unchanged
/// - linear: delay x (1 + attempt)
/// - exponential: delay (in seconds) raised to (1 + attempt), clamped to
///   `max_backoff_ms`
///
/// Jitter then adds a uniform amount in [0, jitter].
pub fn delay_for_attempt(
    policy: &RetryDefinition,
    attempt: u32,
    seed: u64,
    max_backoff_ms: u64,
    at: &Position,
) -> Result<chrono::Duration, WorkflowError> {
    let base_ms = policy
        .delay
        .to_millis()
        .map_err(|e| WorkflowError::configuration(at, e.to_string()))?;

    let backoff = policy
        .backoff
        .as_ref()
        .map(|b| b.kind())
        .unwrap_or(BackoffKind::Constant);

    let computed_ms = match backoff {
        BackoffKind::Constant => base_ms,
        BackoffKind::Linear => base_ms.saturating_mul(u64::from(attempt) + 1),
        BackoffKind::Exponential => {
            let secs = (base_ms as f64 / 1000.0).powi(attempt as i32 + 1);
            let ms = secs * 1000.0;
            if ms.is_finite() && ms >= 0.0 {
                ms as u64
            } else {
                max_backoff_ms
            }
        }
    };
    let clamped_ms = computed_ms.min(max_backoff_ms);

    let jitter_ms = match &policy.jitter {
        None => 0,
        Some(j) => {
            let bound = j
                .to_millis()
                .map_err(|e| WorkflowError::configuration(at, e.to_string()))?;
            if bound == 0 {
                0
            } else {
                StdRng::seed_from_u64(seed).gen_range(0..=bound)
            }
        }
    };

    Ok(chrono::Duration::milliseconds(
        (clamped_ms + jitter_ms) as i64,
    ))
}

/// Whether another retry may be scheduled
///
/// `attempt` is the number of retries already consumed;
/// `first_attempt_at` anchors the total-duration limit.
pub fn attempts_remaining(
    policy: &RetryDefinition,
    attempt: u32,
    first_attempt_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    at: &Position,
) -> Result<bool, WorkflowError> {
    if let Some(limit) = &policy.limit {
        if let Some(count) = limit.attempt.as_ref().and_then(|a| a.count) {
            if attempt >= count {
                return Ok(false);
            }
        }
        if let (Some(max), Some(started)) = (&limit.duration, first_attempt_at) {
            let max = max
                .to_chrono()
                .map_err(|e| WorkflowError::configuration(at, e.to_string()))?;
            if now - started >= max {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

//! Backoff scheduling for requests whose search found nothing usable.
//!
//! # Overview
//!
//! The delay before the next automatic search doubles with every attempt and
//! is capped:
//!
//! ```text
//! delay_hours = min(base_delay_hours * 2^retry_count, max_delay_days * 24)
//! ```
//!
//! Once `retry_count` reaches `max_retries` the request escalates instead: it
//! stays `not_found`, is flagged for attention, and loses its `next_retry_at`
//! so no sweep picks it up again.
//!
//! # Example
//!
//! ```
//! use bookfetch_core::retry::RetryPolicy;
//!
//! let policy = RetryPolicy {
//!     base_delay_hours: 24,
//!     max_delay_days: 7,
//!     max_retries: 5,
//! };
//! assert_eq!(policy.delay_hours(0), 24);
//! assert_eq!(policy.delay_hours(3), 168);
//! ```

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::AcquisitionError;
use crate::events::{EventBus, LifecycleEvent};
use crate::store::{RequestStatus, Store};

/// Default base delay before the first retry.
pub const DEFAULT_BASE_DELAY_HOURS: u32 = 24;

/// Default cap on any single retry delay.
pub const DEFAULT_MAX_DELAY_DAYS: u32 = 7;

/// Default number of scheduled retries before escalation.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Backoff parameters read from settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_hours: u32,
    pub max_delay_days: u32,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_hours: DEFAULT_BASE_DELAY_HOURS,
            max_delay_days: DEFAULT_MAX_DELAY_DAYS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    /// Hours to wait after a miss at `retry_count`; saturates instead of overflowing.
    #[must_use]
    pub fn delay_hours(&self, retry_count: i64) -> u64 {
        let cap = u64::from(self.max_delay_days).saturating_mul(24);
        let exponent = u32::try_from(retry_count.max(0)).unwrap_or(u32::MAX);
        let factor = 2u64.checked_pow(exponent).unwrap_or(u64::MAX);
        u64::from(self.base_delay_hours)
            .saturating_mul(factor)
            .min(cap)
    }

    /// [`RetryPolicy::delay_hours`] as a duration.
    #[must_use]
    pub fn delay_for(&self, retry_count: i64) -> TimeDelta {
        i64::try_from(self.delay_hours(retry_count))
            .ok()
            .and_then(TimeDelta::try_hours)
            .unwrap_or(TimeDelta::MAX)
    }
}

/// What [`RetryScheduler::schedule_retry`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Another automatic search is due at `next_retry_at`.
    Scheduled {
        retry_count: i64,
        next_retry_at: DateTime<Utc>,
    },
    /// Retries are exhausted; the request now needs a human.
    Escalated { retry_count: i64 },
    /// The request is terminal and was left untouched.
    Skipped { status: RequestStatus },
}

/// Decides between another backoff and escalation, under the request lock.
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    store: Store,
    policy: RetryPolicy,
    events: EventBus,
}

impl RetryScheduler {
    /// Creates a scheduler over `store`.
    #[must_use]
    pub fn new(store: Store, policy: RetryPolicy, events: EventBus) -> Self {
        Self {
            store,
            policy,
            events,
        }
    }

    /// The active policy.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Schedules the next retry of a request, or escalates it.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::RequestNotFound`] for an unknown id, or
    /// [`AcquisitionError::Store`] if the update fails (nothing is applied).
    pub async fn schedule_retry(&self, request_id: i64) -> Result<RetryOutcome, AcquisitionError> {
        self.schedule_retry_at(request_id, Utc::now()).await
    }

    /// [`RetryScheduler::schedule_retry`] with an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`RetryScheduler::schedule_retry`].
    #[instrument(skip(self))]
    pub async fn schedule_retry_at(
        &self,
        request_id: i64,
        now: DateTime<Utc>,
    ) -> Result<RetryOutcome, AcquisitionError> {
        let mut locked = self.store.lock_request(request_id).await?;

        let status = locked.request().status;
        if status.is_terminal() {
            info!(request_id, status = %status, "terminal request not rescheduled");
            return Ok(RetryOutcome::Skipped { status });
        }

        let max_retries = i64::from(self.policy.max_retries);
        let request = locked.request_mut();
        request.status = RequestStatus::NotFound;

        let outcome = if request.retry_count >= max_retries {
            request.retry_count += 1;
            request.next_retry_at = None;
            request.attention_needed = true;
            request.issue_description = Some(format!(
                "No downloadable release found after {} searches; automatic retries exhausted",
                request.retry_count
            ));
            RetryOutcome::Escalated {
                retry_count: request.retry_count,
            }
        } else {
            let next_retry_at = now
                .checked_add_signed(self.policy.delay_for(request.retry_count))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            request.retry_count += 1;
            request.next_retry_at = Some(next_retry_at);
            RetryOutcome::Scheduled {
                retry_count: request.retry_count,
                next_retry_at,
            }
        };

        let before = locked.original().clone();
        let saved = locked.commit().await?;
        self.events.publish_changes(&before, &saved);

        match outcome {
            RetryOutcome::Scheduled {
                retry_count,
                next_retry_at,
            } => {
                info!(request_id, retry_count, next_retry_at = %next_retry_at, "retry scheduled");
                self.events.publish(LifecycleEvent::RetryScheduled {
                    request_id,
                    retry_count,
                    next_retry_at,
                });
            }
            RetryOutcome::Escalated { retry_count } => {
                warn!(request_id, retry_count, "retries exhausted; request needs attention");
                self.events.publish(LifecycleEvent::RetriesExhausted {
                    request_id,
                    retry_count,
                });
            }
            RetryOutcome::Skipped { .. } => {}
        }

        Ok(outcome)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn policy(base: u32, cap_days: u32, max: u32) -> RetryPolicy {
        RetryPolicy {
            base_delay_hours: base,
            max_delay_days: cap_days,
            max_retries: max,
        }
    }

    #[test]
    fn test_delay_doubles_per_attempt() {
        let policy = policy(24, 30, 5);
        assert_eq!(policy.delay_hours(0), 24);
        assert_eq!(policy.delay_hours(1), 48);
        assert_eq!(policy.delay_hours(2), 96);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = policy(24, 7, 5);
        assert_eq!(policy.delay_hours(3), 168);
        assert_eq!(policy.delay_hours(10), 168);
    }

    #[test]
    fn test_delay_is_monotonic_and_bounded() {
        let policy = policy(3, 2, 5);
        let mut previous = 0;
        for count in 0..80 {
            let delay = policy.delay_hours(count);
            assert!(delay >= previous, "delay decreased at count {count}");
            assert!(delay <= 48);
            previous = delay;
        }
    }

    #[test]
    fn test_huge_retry_count_saturates() {
        let policy = policy(u32::MAX, u32::MAX, 5);
        assert_eq!(policy.delay_hours(i64::MAX), u64::from(u32::MAX) * 24);
        assert!(policy.delay_for(i64::MAX) > TimeDelta::zero());
    }

    #[test]
    fn test_negative_count_treated_as_zero() {
        assert_eq!(policy(24, 7, 5).delay_hours(-3), 24);
    }

    #[test]
    fn test_policy_deserializes_with_defaults() {
        let parsed: RetryPolicy = toml::from_str("max_retries = 2").unwrap();
        assert_eq!(parsed.max_retries, 2);
        assert_eq!(parsed.base_delay_hours, DEFAULT_BASE_DELAY_HOURS);
        assert_eq!(parsed.max_delay_days, DEFAULT_MAX_DELAY_DAYS);
    }
}

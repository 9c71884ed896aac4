use crate::error::CoreError;
use crate::store::ErrorType;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Retry limit and backoff for failed transactions.
///
/// Implementations must return intervals that never decrease as
/// `retry_index` grows.
pub trait RetryScheme: Send + Sync {
    fn retry_limit(&self, direction: Direction, error: ErrorType) -> u32;
    fn waiting_interval_ms(
        &self,
        direction: Direction,
        retry_index: u32,
        error: ErrorType,
    ) -> u64;
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    pub backoff_schedule_ms: Vec<u64>,
    pub incoming_retry_limit: u32,
    pub outgoing_retry_limit: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_schedule_ms: vec![0, 60 * 1000, 5 * 60 * 1000, 10 * 60 * 1000, 30 * 60 * 1000],
            incoming_retry_limit: 5,
            outgoing_retry_limit: 5,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.backoff_schedule_ms.is_empty() {
            return Err(CoreError::Validation("backoff_schedule_empty".to_string()));
        }
        if self
            .backoff_schedule_ms
            .windows(2)
            .any(|pair| pair[1] < pair[0])
        {
            return Err(CoreError::Validation("backoff_schedule_decreasing".to_string()));
        }
        if self.incoming_retry_limit == 0 || self.outgoing_retry_limit == 0 {
            return Err(CoreError::Validation("retry_limit_zero".to_string()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct DefaultRetryScheme {
    policy: RetryPolicy,
}

impl DefaultRetryScheme {
    pub fn new(policy: RetryPolicy) -> Result<Self, CoreError> {
        policy.validate()?;
        Ok(Self { policy })
    }
}

impl Default for DefaultRetryScheme {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
        }
    }
}

impl RetryScheme for DefaultRetryScheme {
    fn retry_limit(&self, direction: Direction, _error: ErrorType) -> u32 {
        match direction {
            Direction::Incoming => self.policy.incoming_retry_limit,
            Direction::Outgoing => self.policy.outgoing_retry_limit,
        }
    }

    fn waiting_interval_ms(
        &self,
        _direction: Direction,
        retry_index: u32,
        _error: ErrorType,
    ) -> u64 {
        let schedule = &self.policy.backoff_schedule_ms;
        let last = schedule.len().saturating_sub(1);
        let idx = (retry_index as usize).min(last);
        schedule.get(idx).copied().unwrap_or(0)
    }
}

//! Retry schedule used by the realtime connect loop.
//!
//! A schedule is an ordered, non-empty list of waits. Attempt `k` of a
//! connection cycle waits `delays[min(k, len - 1)]`, so the last entry repeats
//! forever once the list is exhausted.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Ordered backoff delays applied before successive connection attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetrySchedule {
    delays: Vec<Duration>,
}

impl RetrySchedule {
    /// Builds a schedule from explicit delays.
    ///
    /// Returns [`RetryScheduleError::Empty`] when `delays` has no entries.
    pub fn new(delays: Vec<Duration>) -> Result<Self, RetryScheduleError> {
        if delays.is_empty() {
            return Err(RetryScheduleError::Empty);
        }
        Ok(Self { delays })
    }

    /// Single-entry schedule that polls at a constant interval.
    pub fn constant(interval: Duration) -> Self {
        Self {
            delays: vec![interval],
        }
    }

    /// Parses a comma-separated list of millisecond values, e.g. `"0,5000,15000"`.
    pub fn from_millis_list(list: &str) -> Result<Self, RetryScheduleError> {
        let mut delays = Vec::new();
        for entry in list.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let millis: u64 = entry
                .parse()
                .map_err(|_| RetryScheduleError::InvalidEntry(entry.to_string()))?;
            delays.push(Duration::from_millis(millis));
        }
        Self::new(delays)
    }

    /// Returns the wait applied before the given 0-based attempt of a cycle.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let index = attempt.min(self.delays.len() - 1);
        self.delays[index]
    }

    /// Number of distinct entries in the schedule.
    pub fn len(&self) -> usize {
        self.delays.len()
    }

    /// Always `false`; kept for API symmetry with [`RetrySchedule::len`].
    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }

    /// Entries in attempt order.
    pub fn as_slice(&self) -> &[Duration] {
        &self.delays
    }
}

impl Default for RetrySchedule {
    /// Immediate first attempt, then 5s, 15s, 30s and 1m.
    fn default() -> Self {
        Self {
            delays: vec![
                Duration::ZERO,
                Duration::from_secs(5),
                Duration::from_secs(15),
                Duration::from_secs(30),
                Duration::from_secs(60),
            ],
        }
    }
}

impl FromStr for RetrySchedule {
    type Err = RetryScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_millis_list(s)
    }
}

/// Errors produced while building a [`RetrySchedule`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RetryScheduleError {
    /// The schedule must contain at least one entry.
    #[error("retry schedule must contain at least one entry")]
    Empty,

    /// A list entry was not a non-negative integer number of milliseconds.
    #[error("invalid retry schedule entry: {0:?}")]
    InvalidEntry(String),
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{RetrySchedule, RetryScheduleError};

    fn secs(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_secs).collect()
    }

    #[test]
    fn empty_schedule_is_rejected() {
        assert_eq!(RetrySchedule::new(Vec::new()), Err(RetryScheduleError::Empty));
    }

    #[test]
    fn delay_clamps_to_last_entry() {
        let schedule = RetrySchedule::new(secs(&[0, 5, 15])).expect("schedule");
        let observed: Vec<_> = (0..6).map(|k| schedule.delay_for_attempt(k)).collect();
        assert_eq!(observed, secs(&[0, 5, 15, 15, 15, 15]));
    }

    #[test]
    fn single_entry_schedule_polls_at_constant_interval() {
        let schedule = RetrySchedule::constant(Duration::from_secs(3));
        assert_eq!(schedule.delay_for_attempt(0), Duration::from_secs(3));
        assert_eq!(schedule.delay_for_attempt(42), Duration::from_secs(3));
    }

    #[test]
    fn default_schedule_starts_immediately() {
        let schedule = RetrySchedule::default();
        assert_eq!(schedule.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(schedule.delay_for_attempt(usize::MAX), Duration::from_secs(60));
    }

    #[test]
    fn parses_millisecond_lists() {
        let schedule: RetrySchedule = " 0, 250 ,1000,".parse().expect("parse schedule");
        assert_eq!(
            schedule.as_slice(),
            &[
                Duration::ZERO,
                Duration::from_millis(250),
                Duration::from_millis(1000)
            ]
        );
    }

    #[test]
    fn rejects_malformed_entries() {
        assert_eq!(
            RetrySchedule::from_millis_list("0,-5"),
            Err(RetryScheduleError::InvalidEntry("-5".to_string()))
        );
        assert_eq!(
            RetrySchedule::from_millis_list(" , "),
            Err(RetryScheduleError::Empty)
        );
    }
}

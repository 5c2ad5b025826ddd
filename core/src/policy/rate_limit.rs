//! Per-user sliding-window rate limiter.
//!
//! Operation counts are kept in buckets keyed by the minute-truncated
//! timestamp. Buckets older than [`WINDOW_RETENTION_MINUTES`] are pruned on
//! every check, and users that have been idle that long are evicted from
//! their shard, so memory stays proportional to recently active users.

use crate::ids::UserId;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, PoisonError};

/// How long minute buckets and idle users are retained.
pub const WINDOW_RETENTION_MINUTES: i64 = 2;

const SHARD_COUNT: usize = 16;

/// A shard is swept of idle users once it tracks more than this many.
const SHARD_SWEEP_THRESHOLD: usize = 1_024;

/// Recent activity of one user.
#[derive(Debug, Default, Clone)]
struct UserWindow {
    /// `(minute, count)` pairs, at most `WINDOW_RETENTION_MINUTES + 1` long
    buckets: Vec<(i64, u32)>,
    last_operation: Option<DateTime<Utc>>,
}

impl UserWindow {
    fn prune(&mut self, current_minute: i64) {
        self.buckets
            .retain(|(minute, _)| current_minute - minute <= WINDOW_RETENTION_MINUTES);
    }

    fn count_in(&self, minute: i64) -> u32 {
        self.buckets
            .iter()
            .find(|(m, _)| *m == minute)
            .map_or(0, |(_, count)| *count)
    }

    fn record(&mut self, minute: i64, at: DateTime<Utc>) {
        if let Some((_, count)) = self.buckets.iter_mut().find(|(m, _)| *m == minute) {
            *count += 1;
        } else {
            self.buckets.push((minute, 1));
        }
        self.last_operation = Some(at);
    }

    fn is_idle(&self, now: DateTime<Utc>) -> bool {
        self.last_operation
            .is_none_or(|last| now - last > chrono::Duration::minutes(WINDOW_RETENTION_MINUTES))
    }
}

/// Snapshot of a user's window handed to the admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Operations recorded in the current minute
    pub count_this_minute: u32,
    /// Time of the last admitted operation
    pub last_operation: Option<DateTime<Utc>>,
}

/// Concurrent per-user operation tracker.
///
/// Sharded so that checks for different users rarely contend on the same lock.
#[derive(Debug)]
pub struct RateLimiter {
    shards: Box<[Mutex<HashMap<UserId, UserWindow>>]>,
}

impl RateLimiter {
    /// Creates an empty limiter.
    #[must_use]
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { shards }
    }

    fn shard(&self, user_id: UserId) -> &Mutex<HashMap<UserId, UserWindow>> {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        // Truncation is fine: only the low bits select a shard.
        #[allow(clippy::cast_possible_truncation)]
        let index = hasher.finish() as usize % self.shards.len();
        &self.shards[index]
    }

    /// Runs `admit` against the user's current window and records the
    /// operation only if it returns `Ok`.
    ///
    /// # Errors
    ///
    /// Propagates whatever `admit` rejects with.
    pub fn check_and_record<E>(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
        admit: impl FnOnce(WindowState) -> Result<(), E>,
    ) -> Result<(), E> {
        let minute = minute_key(now);
        let mut shard = self.shard(user_id).lock().unwrap_or_else(PoisonError::into_inner);

        if shard.len() > SHARD_SWEEP_THRESHOLD {
            shard.retain(|_, window| !window.is_idle(now));
        }

        let window = shard.entry(user_id).or_default();
        window.prune(minute);

        admit(WindowState {
            count_this_minute: window.count_in(minute),
            last_operation: window.last_operation,
        })?;

        window.record(minute, now);
        Ok(())
    }

    /// Removes every user idle for longer than the retention window.
    ///
    /// Returns the number of users evicted.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                let mut shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
                let before = shard.len();
                shard.retain(|_, window| !window.is_idle(now));
                before - shard.len()
            })
            .sum()
    }

    /// Number of users currently tracked.
    #[must_use]
    pub fn tracked_users(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Minute-truncated timestamp used as the bucket key.
#[must_use]
pub fn minute_key(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(60)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, h, m, s).unwrap()
    }

    fn admit_up_to(max: u32) -> impl Fn(WindowState) -> Result<(), ()> {
        move |state| if state.count_this_minute >= max { Err(()) } else { Ok(()) }
    }

    #[test]
    fn rejected_attempts_are_not_counted() {
        let limiter = RateLimiter::new();
        let user = UserId::new(1);
        assert!(limiter.check_and_record(user, at(0, 0, 0), admit_up_to(1)).is_ok());
        assert!(limiter.check_and_record(user, at(0, 0, 1), admit_up_to(1)).is_err());
        assert!(limiter.check_and_record(user, at(0, 0, 2), admit_up_to(1)).is_err());
        assert!(limiter.check_and_record(user, at(0, 1, 0), admit_up_to(1)).is_ok());
    }

    #[test]
    fn old_buckets_are_pruned() {
        let limiter = RateLimiter::new();
        let user = UserId::new(7);
        for minute in 0..10 {
            limiter
                .check_and_record(user, at(0, minute, 0), admit_up_to(5))
                .unwrap();
        }
        let shard = limiter.shard(user).lock().unwrap();
        let window = shard.get(&user).unwrap();
        assert!(window.buckets.len() <= (WINDOW_RETENTION_MINUTES + 1) as usize);
    }

    #[test]
    fn sweep_evicts_idle_users() {
        let limiter = RateLimiter::new();
        for id in 0..50 {
            limiter
                .check_and_record(UserId::new(id), at(0, 0, 0), admit_up_to(5))
                .unwrap();
        }
        limiter
            .check_and_record(UserId::new(999), at(0, 4, 0), admit_up_to(5))
            .unwrap();
        assert_eq!(limiter.tracked_users(), 51);
        assert_eq!(limiter.sweep(at(0, 4, 30)), 50);
        assert_eq!(limiter.tracked_users(), 1);
    }
}

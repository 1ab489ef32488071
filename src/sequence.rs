//! Optimistic sequence generation over conditional-write primitives.
//!
//! A counter is stored under its [`RowKey`] and always holds the next value
//! to hand out. [`SequenceGenerator::next_value`] reads the counter together
//! with a fencing token, then either creates it (absent) or replaces it
//! conditioned on that token. A failed conditional write means another
//! caller won the race; the loop re-reads and tries again, up to the
//! configured retry cap.
//!
//! ```text
//! ABSENT ──create(initial + increment)──▶ PRESENT(initial + increment)   returns initial
//! PRESENT(v, t) ──replace(v + increment, t)──▶ PRESENT(v + increment)    returns v
//! ```

use tracing::{trace, warn};

use crate::key::RowKey;
use crate::storage::StorageError;

/// Conditional-write primitives a backend offers for counters.
pub trait CounterBackend {
    /// Opaque fencing token returned by `read` and presented on write.
    type Token;

    /// Current counter value, or `None` if the counter does not exist yet.
    fn read(&self, key: &RowKey) -> Result<(Option<i64>, Self::Token), StorageError>;

    /// Creates the counter holding `value` if it is still absent.
    ///
    /// Returns `false` if another writer created it first.
    fn create(&self, key: &RowKey, token: Self::Token, value: i64) -> Result<bool, StorageError>;

    /// Replaces the counter with `value` if `token` is still current.
    ///
    /// Returns `false` if the counter changed since `token` was read.
    fn replace(&self, key: &RowKey, token: Self::Token, value: i64) -> Result<bool, StorageError>;
}

/// Default cap on optimistic attempts per call.
pub const DEFAULT_MAX_RETRIES: u32 = 1_000;

/// Drives the optimistic create-or-replace loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGenerator {
    max_retries: u32,
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl SequenceGenerator {
    #[must_use]
    pub const fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the value assigned to this caller and advances the counter.
    ///
    /// # Errors
    /// - [`StorageError::ContentionExceeded`] once `max_retries` attempts
    ///   have all lost their race
    /// - [`StorageError::BackendError`] if the counter would overflow
    /// - any error the backend raises, unchanged
    pub fn next_value<B: CounterBackend + ?Sized>(
        &self,
        backend: &B,
        key: &RowKey,
        increment: i64,
        initial: i64,
    ) -> Result<i64, StorageError> {
        for attempt in 1..=self.max_retries {
            let (current, token) = backend.read(key)?;
            let handed_out = current.unwrap_or(initial);
            let next = handed_out.checked_add(increment).ok_or_else(|| {
                StorageError::BackendError(format!(
                    "sequence {key} overflows adding {increment} to {handed_out}"
                ))
            })?;

            let won = match current {
                None => backend.create(key, token, next)?,
                Some(_) => backend.replace(key, token, next)?,
            };
            if won {
                return Ok(handed_out);
            }
            trace!(%key, attempt, "sequence write lost its race, retrying");
        }

        warn!(%key, attempts = self.max_retries, "sequence retry cap reached");
        Err(StorageError::ContentionExceeded {
            key: key.to_string(),
            attempts: self.max_retries,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;

    use super::*;

    /// Single-threaded counter store that can be told to lose the next
    /// few races.
    #[derive(Default)]
    struct FlakyCounters {
        values: RefCell<HashMap<RowKey, (i64, u64)>>,
        lose_next: Cell<u32>,
    }

    impl FlakyCounters {
        fn losing(times: u32) -> Self {
            let counters = Self::default();
            counters.lose_next.set(times);
            counters
        }

        fn lose(&self) -> bool {
            let remaining = self.lose_next.get();
            if remaining > 0 {
                self.lose_next.set(remaining - 1);
                true
            } else {
                false
            }
        }
    }

    impl CounterBackend for FlakyCounters {
        type Token = u64;

        fn read(&self, key: &RowKey) -> Result<(Option<i64>, u64), StorageError> {
            Ok(match self.values.borrow().get(key) {
                Some(&(value, version)) => (Some(value), version),
                None => (None, 0),
            })
        }

        fn create(&self, key: &RowKey, _token: u64, value: i64) -> Result<bool, StorageError> {
            if self.lose() {
                return Ok(false);
            }
            let mut values = self.values.borrow_mut();
            if values.contains_key(key) {
                return Ok(false);
            }
            values.insert(key.clone(), (value, 1));
            Ok(true)
        }

        fn replace(&self, key: &RowKey, token: u64, value: i64) -> Result<bool, StorageError> {
            if self.lose() {
                return Ok(false);
            }
            let mut values = self.values.borrow_mut();
            match values.get_mut(key) {
                Some(entry) if entry.1 == token => {
                    *entry = (value, token + 1);
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
    }

    #[test]
    fn test_first_call_returns_initial() {
        let counters = FlakyCounters::default();
        let generator = SequenceGenerator::default();
        let key = RowKey::sequence("seq");

        assert_eq!(generator.next_value(&counters, &key, 1, 5).unwrap(), 5);
        assert_eq!(generator.next_value(&counters, &key, 1, 5).unwrap(), 6);
        assert_eq!(counters.values.borrow()[&key].0, 7);
    }

    #[test]
    fn test_increment_is_applied_per_call() {
        let counters = FlakyCounters::default();
        let generator = SequenceGenerator::default();
        let key = RowKey::sequence("seq");

        let values: Vec<i64> = (0..3)
            .map(|_| generator.next_value(&counters, &key, 10, 100).unwrap())
            .collect();
        assert_eq!(values, [100, 110, 120]);
    }

    #[test]
    fn test_lost_races_are_retried() {
        let counters = FlakyCounters::losing(3);
        let generator = SequenceGenerator::new(4);
        let key = RowKey::sequence("seq");

        assert_eq!(generator.next_value(&counters, &key, 1, 0).unwrap(), 0);
    }

    #[test]
    fn test_retry_cap_surfaces_contention() {
        let counters = FlakyCounters::losing(10);
        let generator = SequenceGenerator::new(3);
        let key = RowKey::sequence("seq");

        let err = generator.next_value(&counters, &key, 1, 0).unwrap_err();
        assert!(matches!(
            err,
            StorageError::ContentionExceeded { attempts: 3, .. }
        ));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_overflow_is_an_error() {
        let counters = FlakyCounters::default();
        let generator = SequenceGenerator::default();
        let key = RowKey::sequence("seq");

        assert_eq!(generator.next_value(&counters, &key, 1, i64::MAX - 1).unwrap(), i64::MAX - 1);
        assert!(matches!(
            generator.next_value(&counters, &key, 1, 0),
            Err(StorageError::BackendError(_))
        ));
    }

    #[test]
    fn test_counters_are_independent() {
        let counters = FlakyCounters::default();
        let generator = SequenceGenerator::default();
        let a = RowKey::new("seq", ["name"], ["a"]);
        let b = RowKey::new("seq", ["name"], ["b"]);

        assert_eq!(generator.next_value(&counters, &a, 1, 0).unwrap(), 0);
        assert_eq!(generator.next_value(&counters, &a, 1, 0).unwrap(), 1);
        assert_eq!(generator.next_value(&counters, &b, 1, 0).unwrap(), 0);
    }
}

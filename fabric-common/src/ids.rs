//! Time and identifier helpers.

use std::time::Instant;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rand::Rng;
use uuid::Uuid;

static PROCESS_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Wall-clock now. All persisted timestamps go through this.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Milliseconds since process start. Monotonic, immune to clock steps;
/// use for measuring intervals, never for persistence.
pub fn monotonic_ms() -> u128 {
    PROCESS_EPOCH.elapsed().as_millis()
}

/// A fresh v4 UUID, used for request ids, delivery tokens and envelope ids.
pub fn uuid_v4() -> Uuid {
    Uuid::new_v4()
}

/// A random integer in `[low, high)`.
pub fn random_int(low: u64, high: u64) -> u64 {
    rand::thread_rng().gen_range(low..high)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_never_goes_backwards() {
        let a = monotonic_ms();
        let b = monotonic_ms();
        assert!(b >= a);
    }

    #[test]
    fn random_int_respects_bounds() {
        for _ in 0..100 {
            let n = random_int(5, 10);
            assert!((5..10).contains(&n));
        }
    }

    #[test]
    fn uuids_are_unique() {
        assert_ne!(uuid_v4(), uuid_v4());
    }
}

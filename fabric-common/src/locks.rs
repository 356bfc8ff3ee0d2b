//! The distributed-lock contract.
//!
//! The real lock service lives outside the fabric (Redis-style TTL locks);
//! this is the interface workers use, plus an in-process implementation
//! with the same observable semantics. Every lock carries a fencing value:
//! releasing a lock that has expired and been re-acquired by someone else
//! returns `false` instead of stealing it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::Error;
use crate::ids;

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// A held lock. The value is the fencing token proving ownership.
#[derive(Debug, Clone)]
pub struct Lock {
    pub resource: String,
    pub value: String,
}

#[async_trait]
pub trait LockService: Send + Sync {
    /// Try to take the lock. `None` means somebody else holds it; callers
    /// must not wait, they throw and let their retry policy reattempt.
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<Option<Lock>, Error>;

    /// Release a held lock. Returns false if the lock already expired or
    /// was re-acquired; the caller logs that (a duplicate side effect is
    /// possible) but must not fail its own operation over it.
    async fn release(&self, lock: &Lock) -> Result<bool, Error>;
}

struct HeldLock {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MemoryLockService {
    locks: Mutex<HashMap<String, HeldLock>>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<Option<Lock>, Error> {
        let mut locks = self.locks.lock().expect("lock service mutex poisoned");
        let now = Instant::now();

        if let Some(held) = locks.get(resource) {
            if held.expires_at > now {
                return Ok(None);
            }
        }

        let value = ids::uuid_v4().to_string();
        locks.insert(
            resource.to_owned(),
            HeldLock {
                value: value.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(Some(Lock {
            resource: resource.to_owned(),
            value,
        }))
    }

    async fn release(&self, lock: &Lock) -> Result<bool, Error> {
        let mut locks = self.locks.lock().expect("lock service mutex poisoned");
        match locks.get(&lock.resource) {
            Some(held) if held.value == lock.value => {
                locks.remove(&lock.resource);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

//! Creation lock serializing instance-creation attempts.
//!
//! At most one non-stale holder exists at a time. Holders older than the
//! staleness threshold are purged before each acquisition attempt, so a
//! crashed or wedged attempt can never block creation forever.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{InstanceError, InstanceResult};

#[derive(Debug, Clone)]
pub struct ClearedLock {
    pub token: String,
    pub age_secs: u64,
}

#[derive(Clone)]
pub struct CreationLock {
    holders: Arc<Mutex<HashMap<String, Instant>>>,
    stale_after: Duration,
}

impl CreationLock {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            holders: Arc::new(Mutex::new(HashMap::new())),
            stale_after,
        }
    }

    /// Acquire the lock for `token`. The returned lease releases it on drop.
    pub fn try_acquire(&self, token: impl Into<String>) -> InstanceResult<CreationLease> {
        let token = token.into();
        let mut holders = self.holders.lock();
        purge_stale_locked(&mut holders, self.stale_after);

        if let Some(oldest) = holders.values().min() {
            let held_for = oldest.elapsed().as_secs_f64().ceil() as u64;
            return Err(InstanceError::LockBusy {
                wait_seconds: held_for.max(1),
            });
        }

        holders.insert(token.clone(), Instant::now());
        tracing::debug!(token = %token, "Creation lock acquired");

        Ok(CreationLease {
            lock: self.clone(),
            token,
        })
    }

    pub fn release(&self, token: &str) {
        if self.holders.lock().remove(token).is_some() {
            tracing::debug!(token = %token, "Creation lock released");
        }
    }

    /// Drop holders older than `max_age`. Returns how many were removed.
    pub fn purge_stale(&self, max_age: Duration) -> usize {
        purge_stale_locked(&mut self.holders.lock(), max_age)
    }

    /// Operator escape hatch: drop every holder regardless of age.
    pub fn clear_all(&self) -> Vec<ClearedLock> {
        let mut holders = self.holders.lock();
        let cleared = holders
            .drain()
            .map(|(token, acquired)| ClearedLock {
                token,
                age_secs: acquired.elapsed().as_secs(),
            })
            .collect::<Vec<_>>();

        if !cleared.is_empty() {
            tracing::warn!(count = cleared.len(), "Cleared all creation locks");
        }
        cleared
    }

    pub fn active_count(&self) -> usize {
        self.holders.lock().len()
    }
}

fn purge_stale_locked(holders: &mut HashMap<String, Instant>, max_age: Duration) -> usize {
    let before = holders.len();
    holders.retain(|token, acquired| {
        let keep = acquired.elapsed() <= max_age;
        if !keep {
            tracing::warn!(
                token = %token,
                age_secs = acquired.elapsed().as_secs(),
                "Purging stale creation lock"
            );
        }
        keep
    });
    before - holders.len()
}

/// Proof of holding the creation lock. Released when dropped.
pub struct CreationLease {
    lock: CreationLock,
    token: String,
}

impl CreationLease {
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for CreationLease {
    fn drop(&mut self) {
        self.lock.release(&self.token);
    }
}

//! Per-mirror mutual exclusion.
//!
//! The registry hands out one fair async mutex per [`MirrorKey`], created on
//! first use and kept for the life of the process.  Only the get-or-create
//! step touches the shared map, under a plain `std` mutex that is never held
//! across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use super::path::MirrorKey;
use crate::error::ProxyError;

/// Exclusive right to mutate one mirror.  Released on drop.
#[derive(Debug)]
pub struct MirrorGuard {
    key: MirrorKey,
    _guard: OwnedMutexGuard<()>,
}

impl MirrorGuard {
    pub fn key(&self) -> &MirrorKey {
        &self.key
    }
}

impl Drop for MirrorGuard {
    fn drop(&mut self) {
        debug!(key = %self.key, "mirror lock released");
    }
}

/// Process-wide table of per-mirror locks.
#[derive(Debug, Default)]
pub struct MirrorLockRegistry {
    locks: Mutex<HashMap<MirrorKey, Arc<AsyncMutex<()>>>>,
}

impl MirrorLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the lock for `key`, creating it if this is the first request.
    fn handle(&self, key: &MirrorKey) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    /// Block until the mirror is free and take it.
    pub async fn acquire(&self, key: &MirrorKey) -> MirrorGuard {
        let lock = self.handle(key);
        let guard = match Arc::clone(&lock).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!(%key, "mirror busy; waiting for lock");
                lock.lock_owned().await
            }
        };
        debug!(%key, "mirror lock acquired");
        MirrorGuard {
            key: key.clone(),
            _guard: guard,
        }
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    ///
    /// Returns `(guard, contended)` where `contended` tells whether the lock
    /// had to be waited for.
    pub async fn acquire_timeout(
        &self,
        key: &MirrorKey,
        timeout: Duration,
    ) -> Result<(MirrorGuard, bool), ProxyError> {
        let lock = self.handle(key);
        if let Ok(guard) = Arc::clone(&lock).try_lock_owned() {
            debug!(%key, "mirror lock acquired");
            return Ok((
                MirrorGuard {
                    key: key.clone(),
                    _guard: guard,
                },
                false,
            ));
        }

        debug!(%key, ?timeout, "mirror busy; waiting for lock");
        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => {
                debug!(%key, "mirror lock acquired after wait");
                Ok((
                    MirrorGuard {
                        key: key.clone(),
                        _guard: guard,
                    },
                    true,
                ))
            }
            Err(_) => {
                warn!(%key, ?timeout, "timed out waiting for mirror lock");
                Err(ProxyError::Timeout {
                    key: key.to_string(),
                    after: timeout,
                })
            }
        }
    }

    /// Number of distinct mirrors a lock has ever been created for.
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

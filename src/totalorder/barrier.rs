use ahash::AHashMap;
use log::{trace, warn};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::errors::{Result, SeshatError};
use crate::key::CacheKey;
use crate::tx::GlobalTransaction;

#[derive(Default)]
struct Claims {
    keys: AHashMap<CacheKey, GlobalTransaction>,
    /// Held by a transaction that clears the cache and so touches every key.
    everything: Option<GlobalTransaction>,
    claimed_at: AHashMap<GlobalTransaction, Instant>,
}

impl Claims {
    fn blocker(
        &self,
        gtx: GlobalTransaction,
        keys: &[CacheKey],
        everything: bool,
    ) -> Option<GlobalTransaction> {
        if let Some(holder) = self.everything.filter(|holder| *holder != gtx) {
            return Some(holder);
        }
        if everything {
            return self.keys.values().find(|holder| **holder != gtx).copied();
        }
        keys.iter()
            .find_map(|key| self.keys.get(key).filter(|holder| **holder != gtx))
            .copied()
    }

    fn release(&mut self, gtx: GlobalTransaction) -> bool {
        let before = self.keys.len();
        self.keys.retain(|_, holder| *holder != gtx);
        let mut released = before != self.keys.len();
        if self.everything == Some(gtx) {
            self.everything = None;
            released = true;
        }
        self.claimed_at.remove(&gtx);
        released
    }
}

/// Claims on keys by validated transactions that have not finished yet.
///
/// A delivered prepare must not validate against a key while an earlier
/// transaction that already validated against it is still waiting for its
/// commit, otherwise it would read the version from before that commit.
/// Deliveries are processed in order, so claims are granted in order too.
/// Claims on keys by validated transactions that have not finished yet.
///
/// A delivered prepare must not validate against a key while an earlier
/// transaction that already validated against it is still waiting for its
/// commit, otherwise it would read the version from before that commit.
/// Deliveries are processed in order, so claims are granted in order too.
///
/// A claim older than the abandonment bound belongs to a transaction whose
/// commit or rollback never arrived. It is released when it blocks a later
/// transaction.
pub(crate) struct KeyBarrier {
    claims: Mutex<Claims>,
    released: Condvar,
    abandon_after: Duration,
}

impl KeyBarrier {
    pub(crate) fn new(abandon_after: Duration) -> Self {
        Self {
            claims: Mutex::new(Claims::default()),
            released: Condvar::new(),
            abandon_after,
        }
    }

    /// Blocks until no other transaction holds any of `keys`, then claims them.
    ///
    /// Returns the abandoned transactions whose claims were released on the way.
    pub(crate) fn acquire(
        &self,
        gtx: GlobalTransaction,
        keys: &[CacheKey],
        everything: bool,
        deadline: Instant,
    ) -> Result<Vec<GlobalTransaction>> {
        let mut claims = self.claims.lock();
        let mut abandoned = Vec::new();
        loop {
            let Some(holder) = claims.blocker(gtx, keys, everything) else {
                break;
            };
            let now = Instant::now();
            let expires_at = claims
                .claimed_at
                .get(&holder)
                .map(|claimed_at| *claimed_at + self.abandon_after);
            if expires_at.is_some_and(|expires_at| expires_at <= now) {
                warn!(
                    "{} held its keys for more than {:?}, releasing them for {}",
                    holder, self.abandon_after, gtx
                );
                claims.release(holder);
                abandoned.push(holder);
                self.released.notify_all();
                continue;
            }
            if now >= deadline {
                return Err(SeshatError::Timeout(format!(
                    "{} still waiting for {} to release its keys",
                    gtx, holder
                )));
            }
            trace!("{} waiting for {} to finish", gtx, holder);
            let wake_at = expires_at.map_or(deadline, |expires_at| expires_at.min(deadline));
            self.released.wait_until(&mut claims, wake_at);
        }

        for key in keys {
            claims.keys.insert(key.clone(), gtx);
        }
        if everything {
            claims.everything = Some(gtx);
        }
        claims.claimed_at.insert(gtx, Instant::now());
        Ok(abandoned)
    }

    /// Drops every claim of `gtx`.
    pub(crate) fn release(&self, gtx: GlobalTransaction) {
        if self.claims.lock().release(gtx) {
            self.released.notify_all();
        }
    }

    pub(crate) fn holder_of(&self, key: &CacheKey) -> Option<GlobalTransaction> {
        self.claims.lock().keys.get(key).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn soon(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    fn barrier() -> KeyBarrier {
        KeyBarrier::new(Duration::from_secs(60))
    }

    #[test]
    fn test_second_claim_waits_for_release() {
        let barrier = Arc::new(barrier());
        let first = GlobalTransaction::new(1, 1);
        let second = GlobalTransaction::new(2, 1);
        let key = CacheKey::from("a");

        barrier
            .acquire(first, &[key.clone()], false, soon(100))
            .unwrap();

        let waiter = {
            let barrier = Arc::clone(&barrier);
            let key = key.clone();
            thread::spawn(move || barrier.acquire(second, &[key], false, soon(5_000)))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(barrier.holder_of(&key), Some(first));

        barrier.release(first);
        waiter.join().unwrap().unwrap();
        assert_eq!(barrier.holder_of(&key), Some(second));
    }

    #[test]
    fn test_claim_times_out() {
        let barrier = barrier();
        let key = CacheKey::from("a");
        barrier
            .acquire(GlobalTransaction::new(1, 1), &[key.clone()], false, soon(100))
            .unwrap();
        let result = barrier.acquire(GlobalTransaction::new(1, 2), &[key], false, soon(20));
        assert!(matches!(result, Err(SeshatError::Timeout(_))));
    }

    #[test]
    fn test_disjoint_keys_do_not_wait() {
        let barrier = barrier();
        barrier
            .acquire(GlobalTransaction::new(1, 1), &[CacheKey::from("a")], false, soon(10))
            .unwrap();
        barrier
            .acquire(GlobalTransaction::new(1, 2), &[CacheKey::from("b")], false, soon(10))
            .unwrap();
    }

    #[test]
    fn test_clearing_transaction_waits_for_every_claim() {
        let barrier = barrier();
        barrier
            .acquire(GlobalTransaction::new(1, 1), &[CacheKey::from("a")], false, soon(10))
            .unwrap();
        let result = barrier.acquire(GlobalTransaction::new(1, 2), &[], true, soon(20));
        assert!(matches!(result, Err(SeshatError::Timeout(_))));
    }

    #[test]
    fn test_abandoned_claim_is_released() {
        let barrier = KeyBarrier::new(Duration::from_millis(100));
        let stuck = GlobalTransaction::new(1, 1);
        let next = GlobalTransaction::new(2, 1);
        let key = CacheKey::from("a");
        barrier
            .acquire(stuck, &[key.clone()], false, soon(10))
            .unwrap();

        let started = Instant::now();
        let abandoned = barrier
            .acquire(next, &[key.clone()], false, soon(5_000))
            .unwrap();
        assert_eq!(abandoned, vec![stuck]);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(barrier.holder_of(&key), Some(next));

        // Releasing the abandoned transaction later does not touch the new claim.
        barrier.release(stuck);
        assert_eq!(barrier.holder_of(&key), Some(next));
    }
}

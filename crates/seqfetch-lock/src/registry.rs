use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::LockError;

const DEFAULT_SHARDS: usize = 16;
const MAX_SHARDS: usize = 256;

/// State of one pending-or-finished load.
enum LockState<T, E> {
    Pending,
    Done(T),
    Failed(LockError<E>),
}

/// A single key's load lock, shared by the owner and all waiters.
struct LoadLock<T, E> {
    state: Mutex<LockState<T, E>>,
    ready: Condvar,
    waiters: AtomicUsize,
}

impl<T: Clone, E: Clone> LoadLock<T, E> {
    fn new() -> Self {
        Self {
            state: Mutex::new(LockState::Pending),
            ready: Condvar::new(),
            waiters: AtomicUsize::new(0),
        }
    }

    fn complete(&self, outcome: LockState<T, E>) {
        let mut state = self.state.lock().expect("load lock poisoned");
        if matches!(*state, LockState::Pending) {
            *state = outcome;
        }
        drop(state);
        self.ready.notify_all();
    }

    fn observe(state: &LockState<T, E>) -> Option<Result<T, LockError<E>>> {
        match state {
            LockState::Pending => None,
            LockState::Done(value) => Some(Ok(value.clone())),
            LockState::Failed(err) => Some(Err(err.clone())),
        }
    }
}

type Shard<K, T, E> = Mutex<HashMap<K, Arc<LoadLock<T, E>>>>;

/// Sharded map from key to pending load lock.
///
/// The number of shards is a power of two; a key's shard is chosen by hash,
/// so each shard mutex is only held for the instant it takes to look up or
/// insert an entry, never while a fetch runs.
pub struct LoadLockRegistry<K, T, E> {
    shards: Box<[Shard<K, T, E>]>,
    hasher: RandomState,
}

impl<K, T, E> LoadLockRegistry<K, T, E>
where
    K: Eq + Hash + Clone + fmt::Debug,
    T: Clone,
    E: Clone,
{
    /// Create a registry with the given number of shards, rounded up to a
    /// power of two.
    pub fn with_shards(shards: usize) -> Self {
        let count = shards.clamp(1, MAX_SHARDS).next_power_of_two();
        Self {
            shards: (0..count).map(|_| Mutex::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
        }
    }

    /// Size the registry from a backend concurrency hint.
    ///
    /// A hint of `0` (no synchronization needed) gets the default shard
    /// count; otherwise four shards per concurrent operation.
    pub fn for_concurrency(hint: usize) -> Self {
        if hint == 0 {
            Self::with_shards(DEFAULT_SHARDS)
        } else {
            Self::with_shards(hint.saturating_mul(4))
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, key: &K) -> &Shard<K, T, E> {
        let index = (self.hasher.hash_one(key) as usize) & (self.shards.len() - 1);
        &self.shards[index]
    }

    /// Become the owner of `key`'s load, or a waiter on the current owner.
    pub fn acquire(&self, key: K) -> Acquired<'_, K, T, E> {
        let mut shard = self.shard(&key).lock().expect("lock shard poisoned");
        if let Some(lock) = shard.get(&key) {
            lock.waiters.fetch_add(1, Ordering::SeqCst);
            debug!(?key, "waiting on in-flight load");
            return Acquired::Waiter(WaitHandle {
                lock: Arc::clone(lock),
            });
        }
        let lock = Arc::new(LoadLock::new());
        shard.insert(key.clone(), Arc::clone(&lock));
        debug!(?key, "load lock acquired");
        Acquired::Owner(OwnerGuard {
            registry: self,
            key,
            lock,
            finished: false,
        })
    }

    /// Run `load` under `key`'s lock, or wait for whoever is already
    /// running it.
    pub fn run<F>(&self, key: K, load: F) -> Result<T, LockError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        match self.acquire(key) {
            Acquired::Owner(guard) => match load() {
                Ok(value) => {
                    guard.publish(value.clone());
                    Ok(value)
                }
                Err(err) => {
                    guard.fail(err.clone());
                    Err(LockError::Failed(err))
                }
            },
            Acquired::Waiter(handle) => handle.wait(),
        }
    }

    /// Returns `true` if a load for `key` is currently in flight.
    pub fn is_pending(&self, key: &K) -> bool {
        self.shard(key)
            .lock()
            .expect("lock shard poisoned")
            .contains_key(key)
    }

    /// Number of loads currently in flight.
    pub fn pending_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().expect("lock shard poisoned").len())
            .sum()
    }

    /// Remove `key`'s entry, but only if it still refers to `lock`.
    fn release(&self, key: &K, lock: &Arc<LoadLock<T, E>>) {
        let mut shard = self.shard(key).lock().expect("lock shard poisoned");
        if shard.get(key).is_some_and(|current| Arc::ptr_eq(current, lock)) {
            shard.remove(key);
        }
    }
}

impl<K, T, E> fmt::Debug for LoadLockRegistry<K, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadLockRegistry")
            .field("shards", &self.shards.len())
            .finish()
    }
}

/// What [`LoadLockRegistry::acquire`] hands back.
pub enum Acquired<'a, K, T, E>
where
    K: Eq + Hash + Clone + fmt::Debug,
    T: Clone,
    E: Clone,
{
    /// This caller must perform the load and publish its outcome.
    Owner(OwnerGuard<'a, K, T, E>),
    /// Another caller is loading; wait for its outcome.
    Waiter(WaitHandle<T, E>),
}

impl<K, T, E> Acquired<'_, K, T, E>
where
    K: Eq + Hash + Clone + fmt::Debug,
    T: Clone,
    E: Clone,
{
    pub fn is_owner(&self) -> bool {
        matches!(self, Self::Owner(_))
    }
}

/// Ownership of one key's load.
///
/// Dropping the guard without calling [`publish`](Self::publish) or
/// [`fail`](Self::fail) releases every waiter with
/// [`LockError::Abandoned`].
pub struct OwnerGuard<'a, K, T, E>
where
    K: Eq + Hash + Clone + fmt::Debug,
    T: Clone,
    E: Clone,
{
    registry: &'a LoadLockRegistry<K, T, E>,
    key: K,
    lock: Arc<LoadLock<T, E>>,
    finished: bool,
}

impl<K, T, E> OwnerGuard<'_, K, T, E>
where
    K: Eq + Hash + Clone + fmt::Debug,
    T: Clone,
    E: Clone,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Number of callers currently waiting on this load.
    pub fn waiters(&self) -> usize {
        self.lock.waiters.load(Ordering::SeqCst)
    }

    /// Hand `value` to every waiter and release the key.
    pub fn publish(mut self, value: T) {
        self.finish(LockState::Done(value));
    }

    /// Hand `err` to every waiter and release the key.
    pub fn fail(mut self, err: E) {
        self.finish(LockState::Failed(LockError::Failed(err)));
    }

    fn finish(&mut self, outcome: LockState<T, E>) {
        self.finished = true;
        self.lock.complete(outcome);
        self.registry.release(&self.key, &self.lock);
    }
}

impl<K, T, E> Drop for OwnerGuard<'_, K, T, E>
where
    K: Eq + Hash + Clone + fmt::Debug,
    T: Clone,
    E: Clone,
{
    fn drop(&mut self) {
        if !self.finished {
            warn!(key = ?self.key, "load owner dropped without publishing");
            self.finish(LockState::Failed(LockError::Abandoned));
        }
    }
}

/// A waiter's view of someone else's load.
pub struct WaitHandle<T, E> {
    lock: Arc<LoadLock<T, E>>,
}

impl<T: Clone, E: Clone> WaitHandle<T, E> {
    /// Block until the owner publishes.
    pub fn wait(self) -> Result<T, LockError<E>> {
        let state = self.lock.state.lock().expect("load lock poisoned");
        let state = self
            .lock
            .ready
            .wait_while(state, |s| matches!(s, LockState::Pending))
            .expect("load lock poisoned");
        LoadLock::observe(&state).unwrap_or(Err(LockError::Abandoned))
    }

    /// Block until the owner publishes or `timeout` elapses.
    pub fn wait_timeout(self, timeout: Duration) -> Result<T, LockError<E>> {
        let state = self.lock.state.lock().expect("load lock poisoned");
        let (state, _) = self
            .lock
            .ready
            .wait_timeout_while(state, timeout, |s| matches!(s, LockState::Pending))
            .expect("load lock poisoned");
        LoadLock::observe(&state).unwrap_or(Err(LockError::Timeout(timeout)))
    }
}

impl<T, E> Drop for WaitHandle<T, E> {
    fn drop(&mut self) {
        self.lock.waiters.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Barrier;
    use std::thread;

    type Registry = LoadLockRegistry<u64, String, String>;

    // -----------------------------------------------------------------------
    // Ownership
    // -----------------------------------------------------------------------

    #[test]
    fn first_caller_owns_second_waits() {
        let reg = Registry::with_shards(4);
        let first = reg.acquire(1);
        let second = reg.acquire(1);
        assert!(first.is_owner());
        assert!(!second.is_owner());
        assert!(reg.is_pending(&1));

        let Acquired::Owner(guard) = first else {
            unreachable!()
        };
        assert_eq!(guard.waiters(), 1);
        guard.publish("value".into());
        let Acquired::Waiter(handle) = second else {
            unreachable!()
        };
        assert_eq!(handle.wait().unwrap(), "value");
        assert!(!reg.is_pending(&1));
    }

    #[test]
    fn unrelated_keys_do_not_wait() {
        let reg = Registry::with_shards(1);
        let a = reg.acquire(1);
        let b = reg.acquire(2);
        assert!(a.is_owner());
        assert!(b.is_owner());
        assert_eq!(reg.pending_count(), 2);
    }

    #[test]
    fn released_key_starts_fresh() {
        let reg = Registry::with_shards(4);
        let Acquired::Owner(guard) = reg.acquire(9) else {
            unreachable!()
        };
        guard.fail("connection reset".into());
        assert!(reg.acquire(9).is_owner());
    }

    #[test]
    fn dropped_owner_abandons_waiters() {
        let reg = Registry::with_shards(4);
        let owner = reg.acquire(5);
        let Acquired::Waiter(handle) = reg.acquire(5) else {
            unreachable!()
        };
        drop(owner);
        assert_eq!(handle.wait().unwrap_err(), LockError::Abandoned);
        assert!(!reg.is_pending(&5));
    }

    #[test]
    fn waiter_times_out() {
        let reg = Registry::with_shards(4);
        let _owner = reg.acquire(5);
        let Acquired::Waiter(handle) = reg.acquire(5) else {
            unreachable!()
        };
        let err = handle.wait_timeout(Duration::from_millis(20)).unwrap_err();
        assert_eq!(err, LockError::Timeout(Duration::from_millis(20)));
    }

    #[test]
    fn shard_sizing() {
        assert_eq!(Registry::for_concurrency(0).shard_count(), 16);
        assert_eq!(Registry::for_concurrency(1).shard_count(), 4);
        assert_eq!(Registry::for_concurrency(3).shard_count(), 16);
        assert_eq!(Registry::with_shards(0).shard_count(), 1);
        assert_eq!(Registry::with_shards(10_000).shard_count(), 256);
    }

    // -----------------------------------------------------------------------
    // Concurrency
    // -----------------------------------------------------------------------

    #[test]
    fn concurrent_run_loads_once() {
        let reg = Arc::new(Registry::with_shards(8));
        let calls = Arc::new(AtomicU32::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = Arc::clone(&reg);
                let calls = Arc::clone(&calls);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    reg.run(42, || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(50));
                        Ok("loaded".to_string())
                    })
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap().unwrap(), "loaded");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(reg.pending_count(), 0);
    }

    #[test]
    fn concurrent_waiters_share_failure_then_retry_fresh() {
        let reg = Arc::new(Registry::with_shards(8));
        let Acquired::Owner(guard) = reg.acquire(7) else {
            unreachable!()
        };

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let Acquired::Waiter(handle) = reg.acquire(7) else {
                    unreachable!()
                };
                thread::spawn(move || handle.wait())
            })
            .collect();

        guard.fail("connection refused".into());
        for w in waiters {
            assert_eq!(
                w.join().unwrap().unwrap_err(),
                LockError::Failed("connection refused".to_string())
            );
        }
        let fresh = reg.run(7, || Ok("second try".to_string()));
        assert_eq!(fresh.unwrap(), "second try");
    }

    #[test]
    fn panicking_owner_releases_waiters() {
        let reg = Arc::new(Registry::with_shards(8));
        let entered = Arc::new(Barrier::new(2));
        let proceed = Arc::new(Barrier::new(2));

        let owner = {
            let reg = Arc::clone(&reg);
            let entered = Arc::clone(&entered);
            let proceed = Arc::clone(&proceed);
            thread::spawn(move || {
                let _ = reg.run(3, || {
                    entered.wait();
                    proceed.wait();
                    panic!("decoder blew up");
                });
            })
        };

        entered.wait();
        let Acquired::Waiter(handle) = reg.acquire(3) else {
            panic!("owner still holds the key");
        };
        proceed.wait();
        assert!(owner.join().is_err());
        assert_eq!(handle.wait().unwrap_err(), LockError::Abandoned);
        assert!(!reg.is_pending(&3));
    }
}

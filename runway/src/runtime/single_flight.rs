//! Single-flight RunKey registry.
//!
//! A claim makes a run the current holder of its key and cancels whichever
//! run held it before. Every claim on a key shares one dispatch gate, so at
//! most one dispatch per key is in flight regardless of who holds the key.
//!
//! With a [`KeyLockDir`] the same holds across processes: the holder is
//! also recorded on disk, older holders elsewhere cancel themselves when
//! they see it change, and the dispatch gate is backed by a file lock.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use super::cancel::CancelToken;
use super::key_lock::{GateLock, KeyLockDir};
use crate::run::{RunId, RunKey};

type Slots = Arc<Mutex<HashMap<RunKey, Slot>>>;

struct Slot {
    holder: Option<Holder>,
    gate: Arc<AsyncMutex<()>>,
}

struct Holder {
    generation: u64,
    run_id: RunId,
    token: CancelToken,
}

/// Tracks the current holder of each RunKey.
#[derive(Default)]
pub struct RunRegistry {
    slots: Slots,
    next_generation: AtomicU64,
    lock_dir: Option<KeyLockDir>,
}

impl fmt::Debug for RunRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunRegistry")
            .field("keys", &self.slots.lock().len())
            .field("lock_dir", &self.lock_dir.as_ref().map(KeyLockDir::root))
            .finish()
    }
}

impl RunRegistry {
    /// Registry coordinating runs within this process only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry coordinating with every process sharing `lock_dir`.
    pub fn with_lock_dir(lock_dir: KeyLockDir) -> Self {
        Self {
            lock_dir: Some(lock_dir),
            ..Self::default()
        }
    }

    pub fn lock_dir(&self) -> Option<&KeyLockDir> {
        self.lock_dir.as_ref()
    }

    /// Make `run_id` the holder of `key`, cancelling the previous holder.
    ///
    /// With a lock directory the holder in another process is cancelled on
    /// its next poll, and this claim is watched for the same. Watching
    /// needs a Tokio runtime.
    ///
    /// # Errors
    ///
    /// I/O errors from the lock directory. Nothing is claimed then.
    pub fn claim(&self, key: RunKey, run_id: RunId) -> io::Result<RunClaim> {
        let remote_previous = match &self.lock_dir {
            Some(dir) => dir.claim(&key, run_id)?,
            None => None,
        };

        let token = CancelToken::new();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);

        let mut slots = self.slots.lock();
        let slot = slots.entry(key.clone()).or_insert_with(|| Slot {
            holder: None,
            gate: Arc::new(AsyncMutex::new(())),
        });
        let superseded = slot
            .holder
            .replace(Holder {
                generation,
                run_id,
                token: token.clone(),
            })
            .map(|previous| {
                previous.token.cancel();
                previous.run_id
            })
            .or(remote_previous);
        let gate = Arc::clone(&slot.gate);
        drop(slots);

        if let Some(previous) = superseded {
            tracing::info!(run_key = %key, %previous, by = %run_id, "superseding in-flight run");
        }

        let watcher = self.lock_dir.as_ref().and_then(|dir| {
            let runtime = tokio::runtime::Handle::try_current().ok()?;
            Some(runtime.spawn(dir.clone().watch(key.clone(), run_id, token.clone())))
        });

        Ok(RunClaim {
            key,
            run_id,
            generation,
            token,
            gate,
            superseded,
            slots: Arc::clone(&self.slots),
            lock_dir: self.lock_dir.clone(),
            watcher,
        })
    }

    /// Current holder of `key`.
    pub fn holder(&self, key: &RunKey) -> Option<RunId> {
        self.slots
            .lock()
            .get(key)
            .and_then(|slot| slot.holder.as_ref().map(|holder| holder.run_id))
    }

    /// Keys with a live holder.
    pub fn active_keys(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.holder.is_some())
            .count()
    }

    /// Keys with any bookkeeping left, held or not.
    pub fn tracked_keys(&self) -> usize {
        self.slots.lock().len()
    }
}

/// A run's hold on its key. Releases the key on drop if still the holder.
pub struct RunClaim {
    key: RunKey,
    run_id: RunId,
    generation: u64,
    token: CancelToken,
    gate: Arc<AsyncMutex<()>>,
    superseded: Option<RunId>,
    slots: Slots,
    lock_dir: Option<KeyLockDir>,
    watcher: Option<JoinHandle<()>>,
}

/// Exclusive right to dispatch for one key, in this process and, with a
/// lock directory, in every process sharing it.
#[derive(Debug)]
pub struct DispatchGate {
    _local: OwnedMutexGuard<()>,
    _shared: Option<GateLock>,
}

impl fmt::Debug for RunClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunClaim")
            .field("key", &self.key)
            .field("run_id", &self.run_id)
            .field("generation", &self.generation)
            .field("cancelled", &self.token.is_cancelled())
            .field("superseded", &self.superseded)
            .finish()
    }
}

impl RunClaim {
    pub fn key(&self) -> &RunKey {
        &self.key
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Whether a newer run has taken this key over.
    ///
    /// Reads the shared holder directly, so a takeover by another process
    /// is seen here before the watcher's next poll.
    pub fn is_superseded(&self) -> bool {
        if self.token.is_cancelled() {
            return true;
        }
        let Some(dir) = &self.lock_dir else {
            return false;
        };
        match dir.holder(&self.key) {
            Ok(Some(holder)) if holder != self.run_id => {
                self.token.cancel();
                true
            }
            Ok(_) => false,
            Err(err) => {
                tracing::warn!(run_key = %self.key, "reading key holder failed: {err}");
                false
            }
        }
    }

    /// The run this claim took the key over from, if any.
    pub fn superseded(&self) -> Option<RunId> {
        self.superseded
    }

    /// Wait for this key's dispatch gate.
    ///
    /// # Errors
    ///
    /// I/O errors from the lock directory.
    pub async fn dispatch_gate(&self) -> io::Result<DispatchGate> {
        let local = Arc::clone(&self.gate).lock_owned().await;
        let shared = match &self.lock_dir {
            Some(dir) => Some(dir.lock_gate(&self.key).await?),
            None => None,
        };
        Ok(DispatchGate {
            _local: local,
            _shared: shared,
        })
    }
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        if let Some(dir) = &self.lock_dir
            && let Err(err) = dir.release(&self.key, self.run_id)
        {
            tracing::warn!(run_key = %self.key, "releasing key holder failed: {err}");
        }

        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&self.key) else {
            return;
        };
        if slot
            .holder
            .as_ref()
            .is_some_and(|holder| holder.generation == self.generation)
        {
            slot.holder = None;
        }
        // the map and this claim are the only references left
        if slot.holder.is_none() && Arc::strong_count(&slot.gate) <= 2 {
            slots.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key() -> RunKey {
        RunKey::new("ci", "refs/heads/main")
    }

    #[test]
    fn second_claim_cancels_first() {
        let registry = RunRegistry::new();
        let first_id = RunId::new();
        let first = registry.claim(key(), first_id).unwrap();
        assert!(first.superseded().is_none());

        let second_id = RunId::new();
        let second = registry.claim(key(), second_id).unwrap();
        assert!(first.is_superseded());
        assert!(!second.is_superseded());
        assert_eq!(second.superseded(), Some(first_id));
        assert_eq!(registry.holder(&key()), Some(second_id));
    }

    #[test]
    fn different_keys_are_independent() {
        let registry = RunRegistry::new();
        let a = registry.claim(RunKey::new("ci", "main"), RunId::new()).unwrap();
        let b = registry.claim(RunKey::new("ci", "feature"), RunId::new()).unwrap();
        assert!(!a.is_superseded());
        assert!(!b.is_superseded());
        assert_eq!(registry.active_keys(), 2);
    }

    #[test]
    fn dropping_superseded_claim_keeps_new_holder() {
        let registry = RunRegistry::new();
        let first = registry.claim(key(), RunId::new()).unwrap();
        let second_id = RunId::new();
        let second = registry.claim(key(), second_id).unwrap();

        drop(first);
        assert_eq!(registry.holder(&key()), Some(second_id));

        drop(second);
        assert_eq!(registry.holder(&key()), None);
        assert_eq!(registry.tracked_keys(), 0);
    }

    #[test]
    fn entry_survives_while_older_claim_lives() {
        let registry = RunRegistry::new();
        let first = registry.claim(key(), RunId::new()).unwrap();
        let second = registry.claim(key(), RunId::new()).unwrap();

        drop(second);
        assert_eq!(registry.holder(&key()), None);
        assert_eq!(registry.tracked_keys(), 1);

        drop(first);
        assert_eq!(registry.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn claims_on_one_key_share_the_gate() {
        let registry = RunRegistry::new();
        let first = registry.claim(key(), RunId::new()).unwrap();
        let second = registry.claim(key(), RunId::new()).unwrap();

        let guard = first.dispatch_gate().await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(20), second.dispatch_gate()).await;
        assert!(blocked.is_err(), "gate must be exclusive per key");

        drop(guard);
        let _guard = tokio::time::timeout(Duration::from_millis(100), second.dispatch_gate())
            .await
            .expect("gate should be free")
            .unwrap();
    }

    #[tokio::test]
    async fn other_keys_do_not_wait_on_the_gate() {
        let registry = RunRegistry::new();
        let a = registry.claim(RunKey::new("ci", "main"), RunId::new()).unwrap();
        let b = registry.claim(RunKey::new("ci", "feature"), RunId::new()).unwrap();

        let _guard = a.dispatch_gate().await.unwrap();
        tokio::time::timeout(Duration::from_millis(100), b.dispatch_gate())
            .await
            .expect("independent keys must not block each other")
            .unwrap();
    }

    #[tokio::test]
    async fn claims_in_separate_registries_supersede_through_lock_dir() {
        let dir = tempfile::tempdir().unwrap();
        let lock_dir = KeyLockDir::new(dir.path()).with_poll_interval(Duration::from_millis(10));
        let here = RunRegistry::with_lock_dir(lock_dir.clone());
        let there = RunRegistry::with_lock_dir(lock_dir.clone());

        let first_id = RunId::new();
        let first = here.claim(key(), first_id).unwrap();
        assert!(first.superseded().is_none());

        let second_id = RunId::new();
        let second = there.claim(key(), second_id).unwrap();
        assert_eq!(second.superseded(), Some(first_id));
        assert_eq!(lock_dir.holder(&key()).unwrap(), Some(second_id));

        tokio::time::timeout(Duration::from_secs(2), first.token().cancelled())
            .await
            .expect("older claim should see the takeover");
        assert!(first.is_superseded());
        assert!(!second.is_superseded());

        drop(first);
        assert_eq!(lock_dir.holder(&key()).unwrap(), Some(second_id));
        drop(second);
        assert_eq!(lock_dir.holder(&key()).unwrap(), None);
    }

    #[tokio::test]
    async fn takeover_is_visible_before_the_next_poll() {
        let dir = tempfile::tempdir().unwrap();
        let lock_dir = KeyLockDir::new(dir.path()).with_poll_interval(Duration::from_secs(3600));
        let here = RunRegistry::with_lock_dir(lock_dir.clone());
        let there = RunRegistry::with_lock_dir(lock_dir);

        let first = here.claim(key(), RunId::new()).unwrap();
        let _second = there.claim(key(), RunId::new()).unwrap();
        assert!(first.is_superseded());
        assert!(first.token().is_cancelled());
    }

    #[tokio::test]
    async fn dispatch_gate_is_exclusive_across_registries() {
        let dir = tempfile::tempdir().unwrap();
        let lock_dir = KeyLockDir::new(dir.path()).with_poll_interval(Duration::from_millis(10));
        let here = RunRegistry::with_lock_dir(lock_dir.clone());
        let there = RunRegistry::with_lock_dir(lock_dir);

        let first = here.claim(key(), RunId::new()).unwrap();
        let second = there.claim(key(), RunId::new()).unwrap();

        let gate = first.dispatch_gate().await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(100), second.dispatch_gate()).await;
        assert!(blocked.is_err(), "gate must be exclusive across registries");

        drop(gate);
        tokio::time::timeout(Duration::from_secs(2), second.dispatch_gate())
            .await
            .expect("gate should be free")
            .unwrap();
    }
}

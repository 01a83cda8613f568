//! File-backed RunKey holders shared between processes.
//!
//! Every key maps to three files under the lock directory, named by a
//! digest of the key:
//!
//! - `<digest>.holder` names the run currently holding the key. A claim
//!   overwrites it; an older run notices on its next poll and cancels
//!   itself.
//! - `<digest>.gate` is locked exclusively for the whole of a dispatch.
//! - `<digest>.meta` serializes read-modify-write of the holder file.
//!
//! Locks are OS advisory locks on open files, so a crashed process never
//! leaves a key locked.

use std::fs::{self, File, OpenOptions, TryLockError};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::cancel::CancelToken;
use crate::run::{RunId, RunKey};

/// How often a holder re-reads its key, and how often a queued dispatch
/// retries the gate.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Per-user default location of the lock directory.
pub fn default_lock_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::runtime_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("runway")
        .join("locks")
}

/// Directory of per-key holder and gate files.
#[derive(Clone, Debug)]
pub struct KeyLockDir {
    root: PathBuf,
    poll_interval: Duration,
}

impl KeyLockDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn path(&self, key: &RunKey, extension: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.workflow().as_bytes());
        hasher.update([0u8]);
        hasher.update(key.git_ref().as_bytes());
        let digest = hasher.finalize();
        self.root
            .join(format!("{}.{extension}", hex::encode(&digest[..16])))
    }

    fn open(&self, key: &RunKey, extension: &str) -> io::Result<File> {
        fs::create_dir_all(&self.root)?;
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.path(key, extension))
    }

    fn with_meta_lock<T>(
        &self,
        key: &RunKey,
        f: impl FnOnce(&Path) -> io::Result<T>,
    ) -> io::Result<T> {
        let meta = self.open(key, "meta")?;
        meta.lock()?;
        let result = f(&self.path(key, "holder"));
        meta.unlock()?;
        result
    }

    /// Record `run_id` as the holder of `key`.
    ///
    /// Returns the run it replaced, which may live in another process.
    pub fn claim(&self, key: &RunKey, run_id: RunId) -> io::Result<Option<RunId>> {
        self.with_meta_lock(key, |holder| {
            let previous = read_holder(holder)?;
            let staged = holder.with_extension(format!("holder.{run_id}"));
            fs::write(&staged, format!("{run_id}\n"))?;
            fs::rename(&staged, holder)?;
            Ok(previous.filter(|previous| *previous != run_id))
        })
    }

    /// Clear `key` if `run_id` still holds it. Returns whether it did.
    pub fn release(&self, key: &RunKey, run_id: RunId) -> io::Result<bool> {
        self.with_meta_lock(key, |holder| {
            if read_holder(holder)? != Some(run_id) {
                return Ok(false);
            }
            fs::remove_file(holder)?;
            Ok(true)
        })
    }

    /// Run currently holding `key`, in any process.
    pub fn holder(&self, key: &RunKey) -> io::Result<Option<RunId>> {
        read_holder(&self.path(key, "holder"))
    }

    /// Wait for the dispatch gate of `key`. Held until the returned lock
    /// is dropped.
    pub async fn lock_gate(&self, key: &RunKey) -> io::Result<GateLock> {
        let file = self.open(key, "gate")?;
        loop {
            match file.try_lock() {
                Ok(()) => return Ok(GateLock { _file: file }),
                Err(TryLockError::WouldBlock) => tokio::time::sleep(self.poll_interval).await,
                Err(TryLockError::Error(err)) => return Err(err),
            }
        }
    }

    /// Cancel `token` once another run replaces `run_id` as holder of
    /// `key`. Returns when the token is cancelled either way.
    pub async fn watch(self, key: RunKey, run_id: RunId, token: CancelToken) {
        let path = self.path(&key, "holder");
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(raw) => match parse_run_id(&raw) {
                    Some(holder) if holder != run_id => {
                        tracing::info!(run_key = %key, previous = %run_id, by = %holder, "superseded by another process");
                        token.cancel();
                        return;
                    }
                    _ => {}
                },
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => tracing::warn!(run_key = %key, "reading key holder failed: {err}"),
            }
        }
    }
}

/// Exclusive hold on a key's dispatch gate across processes.
#[derive(Debug)]
pub struct GateLock {
    _file: File,
}

fn read_holder(path: &Path) -> io::Result<Option<RunId>> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(parse_run_id(&raw)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

fn parse_run_id(raw: &str) -> Option<RunId> {
    Uuid::parse_str(raw.trim()).ok().map(RunId)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> RunKey {
        RunKey::new("ci", "refs/heads/main")
    }

    fn lock_dir(dir: &tempfile::TempDir) -> KeyLockDir {
        KeyLockDir::new(dir.path()).with_poll_interval(Duration::from_millis(10))
    }

    #[test]
    fn claim_reports_previous_holder() {
        let dir = tempfile::tempdir().unwrap();
        let locks = lock_dir(&dir);
        let first = RunId::new();
        let second = RunId::new();

        assert_eq!(locks.claim(&key(), first).unwrap(), None);
        assert_eq!(locks.claim(&key(), second).unwrap(), Some(first));
        assert_eq!(locks.holder(&key()).unwrap(), Some(second));
    }

    #[test]
    fn release_only_clears_own_claim() {
        let dir = tempfile::tempdir().unwrap();
        let locks = lock_dir(&dir);
        let first = RunId::new();
        let second = RunId::new();
        locks.claim(&key(), first).unwrap();
        locks.claim(&key(), second).unwrap();

        assert!(!locks.release(&key(), first).unwrap());
        assert_eq!(locks.holder(&key()).unwrap(), Some(second));
        assert!(locks.release(&key(), second).unwrap());
        assert_eq!(locks.holder(&key()).unwrap(), None);
    }

    #[test]
    fn keys_that_render_alike_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let locks = lock_dir(&dir);
        let a = RunKey::new("ci-x", "main");
        let b = RunKey::new("ci", "x-main");
        assert_eq!(a.to_string(), b.to_string());

        let run = RunId::new();
        locks.claim(&a, run).unwrap();
        assert_eq!(locks.holder(&b).unwrap(), None);
    }

    #[test]
    fn garbage_holder_file_reads_as_unheld() {
        let dir = tempfile::tempdir().unwrap();
        let locks = lock_dir(&dir);
        fs::write(locks.path(&key(), "holder"), "not a run id").unwrap();
        assert_eq!(locks.holder(&key()).unwrap(), None);
    }

    #[tokio::test]
    async fn gate_is_exclusive_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let here = lock_dir(&dir);
        let there = lock_dir(&dir);

        let held = here.lock_gate(&key()).await.unwrap();
        let blocked =
            tokio::time::timeout(Duration::from_millis(100), there.lock_gate(&key())).await;
        assert!(blocked.is_err(), "second handle must wait for the gate");

        drop(held);
        tokio::time::timeout(Duration::from_secs(2), there.lock_gate(&key()))
            .await
            .expect("gate should be released")
            .unwrap();
    }

    #[tokio::test]
    async fn watcher_cancels_when_holder_changes() {
        let dir = tempfile::tempdir().unwrap();
        let locks = lock_dir(&dir);
        let first = RunId::new();
        locks.claim(&key(), first).unwrap();

        let token = CancelToken::new();
        let watcher = tokio::spawn(locks.clone().watch(key(), first, token.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!token.is_cancelled());

        locks.claim(&key(), RunId::new()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), token.cancelled())
            .await
            .expect("older holder should be cancelled");
        watcher.await.unwrap();
    }
}

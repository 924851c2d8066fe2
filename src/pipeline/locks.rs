// ABOUTME: Per-service exclusive locks so a service never has two runs in flight.
// ABOUTME: In-process mutexes, plus `{service}.lock` files when records are shared on disk.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

use crate::types::{RunId, ServiceName};

/// A lock file from another host older than this is treated as abandoned.
const STALE_AFTER_HOURS: i64 = 1;

/// How often a queued run retries a lock file held by another process.
const RETRY_INTERVAL: Duration = Duration::from_millis(500);

fn hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

/// Information about who holds a service lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Hostname of the machine running the pipeline.
    pub holder: String,
    pub pid: u32,
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn new(run: &RunId) -> Self {
        Self {
            holder: hostname(),
            pid: std::process::id(),
            run_id: run.clone(),
            started_at: Utc::now(),
        }
    }

    /// Whether the holder is known to be gone.
    ///
    /// On this host that means its process has exited. Other hosts cannot be
    /// checked, so their locks expire after an hour.
    pub fn is_stale(&self) -> bool {
        if cfg!(target_os = "linux") && self.holder == hostname() {
            return !Path::new("/proc").join(self.pid.to_string()).exists();
        }
        (Utc::now() - self.started_at).num_hours() >= STALE_AFTER_HOURS
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock is held by another run")]
    Held(Option<LockInfo>),

    #[error("lock file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A lock file written by this process, removed on drop while it still names our run.
#[derive(Debug)]
struct LockFile {
    path: PathBuf,
    run: RunId,
}

impl LockFile {
    /// Create `{service}.lock` in `dir`, breaking it first if its holder is stale.
    ///
    /// Returns the lock and the stale holder it replaced, if any.
    async fn acquire(
        dir: &Path,
        service: &ServiceName,
        run: &RunId,
    ) -> Result<(Self, Option<LockInfo>), LockError> {
        let path = dir.join(format!("{}.lock", service));
        let io_error = |source: std::io::Error| LockError::Io {
            path: path.clone(),
            source,
        };

        tokio::fs::create_dir_all(dir).await.map_err(|source| LockError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let info = serde_json::to_vec(&LockInfo::new(run)).map_err(|e| io_error(e.into()))?;

        if Self::publish(&path, &info, run).await.map_err(io_error)? {
            return Ok((Self::held(path, run), None));
        }

        let existing = Self::read(&path).await;
        match &existing {
            Some(holder) if !holder.is_stale() => return Err(LockError::Held(existing)),
            Some(holder) => tracing::warn!(
                "Breaking stale lock on {} held by {} (pid {}) since {}",
                service,
                holder.holder,
                holder.pid,
                holder.started_at
            ),
            None => tracing::warn!("Lock info for {} unreadable, breaking lock", service),
        }

        // Another process may have broken and retaken it since we looked.
        let current = Self::read(&path).await;
        if current != existing {
            return Err(LockError::Held(current));
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(e)),
        }

        if Self::publish(&path, &info, run).await.map_err(io_error)? {
            Ok((Self::held(path, run), existing))
        } else {
            Err(LockError::Held(Self::read(&path).await))
        }
    }

    fn held(path: PathBuf, run: &RunId) -> Self {
        Self {
            path,
            run: run.clone(),
        }
    }

    /// Atomically create `path` holding `info`. False when it already exists.
    ///
    /// The content is staged and hard-linked into place, so readers never see
    /// an empty lock.
    async fn publish(path: &Path, info: &[u8], run: &RunId) -> std::io::Result<bool> {
        let staged = path.with_extension(format!("lock.{}", run));
        tokio::fs::write(&staged, info).await?;
        let linked = tokio::fs::hard_link(&staged, path).await;
        if let Err(e) = tokio::fs::remove_file(&staged).await {
            tracing::debug!("Could not remove {}: {}", staged.display(), e);
        }
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn read(path: &Path) -> Option<LockInfo> {
        let bytes = tokio::fs::read(path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let ours = std::fs::read(&self.path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<LockInfo>(&bytes).ok())
            .is_some_and(|info| info.run_id == self.run);
        if ours && let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("Could not release {}: {}", self.path.display(), e);
        }
    }
}

#[derive(Default)]
struct Slot {
    lock: Arc<tokio::sync::Mutex<()>>,
    holder: Option<LockInfo>,
}

type Slots = Arc<Mutex<HashMap<ServiceName, Slot>>>;

/// The lock map shared by every run of one pipeline.
#[derive(Clone, Default)]
pub struct ServiceLocks {
    slots: Slots,
    dir: Option<PathBuf>,
}

/// A held service lock; released on drop.
pub struct ServiceGuard {
    guard: Option<OwnedMutexGuard<()>>,
    file: Option<LockFile>,
    replaced: Option<LockInfo>,
    service: ServiceName,
    slots: Slots,
}

impl std::fmt::Debug for ServiceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceGuard")
            .field("service", &self.service)
            .field("file", &self.file)
            .finish()
    }
}

impl ServiceGuard {
    /// The stale lock this guard broke to get in, if any.
    pub fn replaced(&self) -> Option<&LockInfo> {
        self.replaced.as_ref()
    }
}

impl Drop for ServiceGuard {
    fn drop(&mut self) {
        self.file.take();
        let mut slots = self.slots.lock();
        let idle = match slots.get_mut(&self.service) {
            Some(slot) => {
                slot.holder = None;
                self.guard.take();
                // Waiters hold a clone of the mutex until they claim it.
                Arc::strong_count(&slot.lock) == 1
            }
            None => false,
        };
        if idle {
            slots.remove(&self.service);
        }
    }
}

impl ServiceLocks {
    /// Locks visible to this process only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks that also take `{service}.lock` in `dir`, excluding every process using it.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            slots: Slots::default(),
            dir: Some(dir.into()),
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn slot_lock(&self, service: &ServiceName) -> Arc<tokio::sync::Mutex<()>> {
        let mut slots = self.slots.lock();
        Arc::clone(&slots.entry(service.clone()).or_default().lock)
    }

    fn claim(&self, service: &ServiceName, run: &RunId, guard: OwnedMutexGuard<()>) -> ServiceGuard {
        if let Some(slot) = self.slots.lock().get_mut(service) {
            slot.holder = Some(LockInfo::new(run));
        }
        ServiceGuard {
            guard: Some(guard),
            file: None,
            replaced: None,
            service: service.clone(),
            slots: Arc::clone(&self.slots),
        }
    }

    async fn lock_file(&self, held: &mut ServiceGuard, run: &RunId) -> Result<(), LockError> {
        if let Some(dir) = &self.dir {
            let (file, replaced) = LockFile::acquire(dir, &held.service, run).await?;
            held.file = Some(file);
            held.replaced = replaced;
        }
        Ok(())
    }

    /// Take the lock now or report who holds it.
    pub async fn try_acquire(&self, service: &ServiceName, run: &RunId) -> Result<ServiceGuard, LockError> {
        let guard = self
            .slot_lock(service)
            .try_lock_owned()
            .map_err(|_| LockError::Held(self.holder(service)))?;
        let mut held = self.claim(service, run, guard);
        self.lock_file(&mut held, run).await?;
        Ok(held)
    }

    /// Wait for the lock, polling the lock file while another process holds it.
    pub async fn acquire(&self, service: &ServiceName, run: &RunId) -> Result<ServiceGuard, LockError> {
        let guard = self.slot_lock(service).lock_owned().await;
        let mut held = self.claim(service, run, guard);
        loop {
            match self.lock_file(&mut held, run).await {
                Ok(()) => return Ok(held),
                Err(LockError::Held(holder)) => {
                    if let Some(holder) = holder {
                        tracing::debug!(
                            "{} is locked by run {} on {}; retrying",
                            service,
                            holder.run_id,
                            holder.holder
                        );
                    }
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Holder of the in-process lock.
    pub fn holder(&self, service: &ServiceName) -> Option<LockInfo> {
        self.slots.lock().get(service).and_then(|slot| slot.holder.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn web() -> ServiceName {
        ServiceName::new("web").unwrap()
    }

    fn lock_path(dir: &TempDir) -> PathBuf {
        dir.path().join("web.lock")
    }

    #[tokio::test]
    async fn second_claim_sees_the_holder() {
        let locks = ServiceLocks::new();
        let first = RunId::new("first");
        let _guard = locks.try_acquire(&web(), &first).await.unwrap();

        let err = locks.try_acquire(&web(), &RunId::new("second")).await.unwrap_err();
        let LockError::Held(Some(holder)) = err else {
            panic!("expected a recorded holder, got {:?}", err);
        };
        assert_eq!(holder.run_id, first);
        assert_eq!(holder.pid, std::process::id());
    }

    #[tokio::test]
    async fn other_services_are_independent() {
        let locks = ServiceLocks::new();
        let _web = locks.try_acquire(&web(), &RunId::new("a")).await.unwrap();
        let api = ServiceName::new("api").unwrap();
        assert!(locks.try_acquire(&api, &RunId::new("b")).await.is_ok());
    }

    #[tokio::test]
    async fn dropping_the_guard_releases() {
        let locks = ServiceLocks::new();
        drop(locks.try_acquire(&web(), &RunId::new("a")).await.unwrap());
        assert!(locks.holder(&web()).is_none());
        assert!(locks.try_acquire(&web(), &RunId::new("b")).await.is_ok());
    }

    #[tokio::test]
    async fn released_slots_are_forgotten() {
        let locks = ServiceLocks::new();
        let guard = locks.try_acquire(&web(), &RunId::new("a")).await.unwrap();
        assert_eq!(locks.slots.lock().len(), 1);

        drop(guard);
        assert!(locks.slots.lock().is_empty());
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let locks = ServiceLocks::new();
        let guard = locks.try_acquire(&web(), &RunId::new("a")).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let guard = locks.acquire(&web(), &RunId::new("b")).await.unwrap();
                (guard.service.clone(), locks.holder(&web()).map(|h| h.run_id))
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // The waiter holds the slot, so releasing must not drop it.
        drop(guard);
        let (service, holder) = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(service, web());
        assert_eq!(holder, Some(RunId::new("b")));
        assert!(locks.slots.lock().is_empty());
    }

    #[tokio::test]
    async fn lock_file_excludes_other_lock_maps() {
        let dir = TempDir::new().unwrap();
        let first = ServiceLocks::in_dir(dir.path());
        let second = ServiceLocks::in_dir(dir.path());

        let guard = first.try_acquire(&web(), &RunId::new("a")).await.unwrap();
        assert!(lock_path(&dir).exists());

        let err = second.try_acquire(&web(), &RunId::new("b")).await.unwrap_err();
        let LockError::Held(Some(holder)) = err else {
            panic!("expected the file holder, got {:?}", err);
        };
        assert_eq!(holder.run_id, RunId::new("a"));

        drop(guard);
        assert!(!lock_path(&dir).exists());
        let guard = second.try_acquire(&web(), &RunId::new("b")).await.unwrap();
        assert!(guard.replaced().is_none());
    }

    #[tokio::test]
    async fn stale_lock_file_is_broken() {
        let dir = TempDir::new().unwrap();
        let stale = LockInfo {
            pid: u32::MAX,
            started_at: Utc::now() - chrono::Duration::hours(2),
            ..LockInfo::new(&RunId::new("crashed"))
        };
        std::fs::write(lock_path(&dir), serde_json::to_vec(&stale).unwrap()).unwrap();

        let locks = ServiceLocks::in_dir(dir.path());
        let guard = locks.try_acquire(&web(), &RunId::new("fresh")).await.unwrap();

        assert_eq!(guard.replaced(), Some(&stale));
        let written: LockInfo = serde_json::from_slice(&std::fs::read(lock_path(&dir)).unwrap()).unwrap();
        assert_eq!(written.run_id, RunId::new("fresh"));
    }

    #[tokio::test]
    async fn corrupt_lock_file_is_broken() {
        let dir = TempDir::new().unwrap();
        std::fs::write(lock_path(&dir), "{half a lock").unwrap();

        let locks = ServiceLocks::in_dir(dir.path());
        let guard = locks.try_acquire(&web(), &RunId::new("fresh")).await.unwrap();
        assert!(guard.replaced().is_none());
        assert!(lock_path(&dir).exists());
    }

    #[tokio::test]
    async fn releasing_leaves_a_lock_retaken_by_someone_else() {
        let dir = TempDir::new().unwrap();
        let locks = ServiceLocks::in_dir(dir.path());
        let guard = locks.try_acquire(&web(), &RunId::new("a")).await.unwrap();

        let other = LockInfo::new(&RunId::new("other"));
        std::fs::write(lock_path(&dir), serde_json::to_vec(&other).unwrap()).unwrap();
        drop(guard);

        assert!(lock_path(&dir).exists());
    }

    #[test]
    fn fresh_lock_is_not_stale() {
        assert!(!LockInfo::new(&RunId::new("r1")).is_stale());
    }

    #[test]
    fn old_lock_from_another_host_is_stale() {
        let mut info = LockInfo::new(&RunId::new("r1"));
        info.holder = "build-03.internal.example".to_string();
        info.started_at = Utc::now() - chrono::Duration::hours(2);
        assert!(info.is_stale());
    }
}

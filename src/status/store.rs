// ABOUTME: Key-value persistence for service records.
// ABOUTME: In-memory for tests and embedding, JSON files under a state directory for the CLI.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::{ServiceRecord, StatusError};
use crate::types::ServiceName;

/// Opaque repository for service records.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn load(&self, service: &ServiceName) -> Result<Option<ServiceRecord>, StatusError>;
    async fn save(&self, record: &ServiceRecord) -> Result<(), StatusError>;
    async fn delete(&self, service: &ServiceName) -> Result<(), StatusError>;

    /// Directory other processes share these records through, if any.
    ///
    /// Service lock files live here so that runs in different processes
    /// exclude each other exactly as far as they share records.
    fn lock_dir(&self) -> Option<&Path> {
        None
    }
}

#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    records: Mutex<HashMap<ServiceName, ServiceRecord>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn load(&self, service: &ServiceName) -> Result<Option<ServiceRecord>, StatusError> {
        Ok(self.records.lock().get(service).cloned())
    }

    async fn save(&self, record: &ServiceRecord) -> Result<(), StatusError> {
        self.records
            .lock()
            .insert(record.service.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, service: &ServiceName) -> Result<(), StatusError> {
        self.records.lock().remove(service);
        Ok(())
    }
}

/// One `{service}.json` file per service.
#[derive(Debug, Clone)]
pub struct FileStatusStore {
    dir: PathBuf,
}

impl FileStatusStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, service: &ServiceName) -> PathBuf {
        self.dir.join(format!("{}.json", service))
    }
}

#[async_trait]
impl StatusStore for FileStatusStore {
    async fn load(&self, service: &ServiceName) -> Result<Option<ServiceRecord>, StatusError> {
        match tokio::fs::read(self.path(service)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, record: &ServiceRecord) -> Result<(), StatusError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec_pretty(record)?;
        // Write then rename so readers never see a half-written record.
        let path = self.path(&record.service);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, service: &ServiceName) -> Result<(), StatusError> {
        match tokio::fs::remove_file(self.path(service)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn lock_dir(&self) -> Option<&Path> {
        Some(&self.dir)
    }
}

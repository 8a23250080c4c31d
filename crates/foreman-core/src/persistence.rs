//! Cross-run storage of result envelopes for resumption.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::sync::RwLock;

use crate::envelope::ResultEnvelope;
use crate::error::{ForemanError, ForemanResult};

/// Stores the latest envelope per task id.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Save `envelope`, replacing any earlier attempt of the same task.
    ///
    /// # Errors
    ///
    /// [`ForemanError::InvalidConfig`] if the envelope carries no `task_id`.
    async fn save(&self, envelope: &ResultEnvelope) -> ForemanResult<()>;

    /// The latest saved attempt for `task_id`, if any.
    async fn load(&self, task_id: &str) -> ForemanResult<Option<ResultEnvelope>>;
}

fn task_id_of(envelope: &ResultEnvelope) -> ForemanResult<&str> {
    envelope
        .task_id
        .as_deref()
        .ok_or_else(|| ForemanError::InvalidConfig("cannot store an envelope without task_id".into()))
}

/// In-memory store, for tests and single-process embedding.
#[derive(Debug, Clone, Default)]
pub struct MemoryAttemptStore {
    attempts: Arc<RwLock<HashMap<String, ResultEnvelope>>>,
}

impl MemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttemptStore for MemoryAttemptStore {
    async fn save(&self, envelope: &ResultEnvelope) -> ForemanResult<()> {
        let task_id = task_id_of(envelope)?.to_string();
        self.attempts.write().await.insert(task_id, envelope.clone());
        Ok(())
    }

    async fn load(&self, task_id: &str) -> ForemanResult<Option<ResultEnvelope>> {
        Ok(self.attempts.read().await.get(task_id).cloned())
    }
}

/// One JSON file per task under `<root>/attempts/`.
///
/// File names are the hex SHA-256 of the task id, so arbitrary ids are safe
/// to use. Writes go to a temp file in the same directory and are renamed
/// into place.
#[derive(Debug, Clone)]
pub struct FsAttemptStore {
    dir: PathBuf,
}

impl FsAttemptStore {
    /// Create a store rooted at `root`. Creates `root/attempts/` if needed.
    pub fn new(root: impl AsRef<Path>) -> ForemanResult<Self> {
        let dir = root.as_ref().join("attempts");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, task_id: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(task_id.as_bytes()));
        self.dir.join(format!("{digest}.json"))
    }
}

#[async_trait]
impl AttemptStore for FsAttemptStore {
    async fn save(&self, envelope: &ResultEnvelope) -> ForemanResult<()> {
        let path = self.path_for(task_id_of(envelope)?);
        let bytes = serde_json::to_vec_pretty(envelope)?;
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || -> ForemanResult<()> {
            let mut tmp = NamedTempFile::new_in(&dir)?;
            tmp.write_all(&bytes)?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| ForemanError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }

    async fn load(&self, task_id: &str) -> ForemanResult<Option<ResultEnvelope>> {
        let path = self.path_for(task_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

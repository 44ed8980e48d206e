use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::core::error::PipelineError;
use crate::core::job::{Job, JobStatus, PipelineStage, StoryRequest};

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_store_folder")]
    pub folder: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            folder: default_store_folder(),
        }
    }
}

fn default_store_folder() -> String {
    "jobs".to_string()
}

/// Durable job records keyed by correlation id.
///
/// Ids are write-once: `create` on an existing id fails with
/// `PipelineError::DuplicateId` and leaves the stored job untouched.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, id: &str, input: StoryRequest) -> Result<Job, PipelineError>;
    async fn get(&self, id: &str) -> Result<Option<Job>, PipelineError>;
    async fn update(&self, id: &str, stage: PipelineStage, output: Value) -> Result<Job, PipelineError>;
    async fn set_status(
        &self,
        id: &str,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<Job, PipelineError>;
}

pub async fn open_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-memory job store");
            Ok(Arc::new(MemoryJobStore::new()))
        }
        StoreBackend::File => {
            info!("Using file job store at {}", config.folder);
            Ok(Arc::new(FileJobStore::new(&config.folder).await?))
        }
    }
}

// --- Memory ---

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn modify(&self, id: &str, f: impl FnOnce(&mut Job)) -> Result<Job, PipelineError> {
        let mut jobs = self.jobs.write().map_err(PipelineError::store)?;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))?;
        f(job);
        Ok(job.clone())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, id: &str, input: StoryRequest) -> Result<Job, PipelineError> {
        let mut jobs = self.jobs.write().map_err(PipelineError::store)?;
        if jobs.contains_key(id) {
            return Err(PipelineError::DuplicateId(id.to_string()));
        }
        let job = Job::new(id, input);
        jobs.insert(id.to_string(), job.clone());
        Ok(job)
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, PipelineError> {
        let jobs = self.jobs.read().map_err(PipelineError::store)?;
        Ok(jobs.get(id).cloned())
    }

    async fn update(&self, id: &str, stage: PipelineStage, output: Value) -> Result<Job, PipelineError> {
        self.modify(id, |job| {
            job.record(stage, output);
        })
    }

    async fn set_status(
        &self,
        id: &str,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<Job, PipelineError> {
        self.modify(id, |job| job.set_status(status, error))
    }
}

// --- File ---

/// One pretty-printed JSON document per job under `folder`.
///
/// Writes to the same job are serialized through a per-id lock; different
/// jobs never contend.
pub struct FileJobStore {
    folder: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileJobStore {
    pub async fn new(folder: impl AsRef<Path>) -> anyhow::Result<Self> {
        let folder = folder.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&folder).await?;
        Ok(Self {
            folder,
            locks: Mutex::new(HashMap::new()),
        })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.folder.join(format!("{}.json", file_stem(id)))
    }

    /// Entries nobody else holds are pruned here, so the map tracks only
    /// jobs with a write in flight.
    fn lock_for(&self, id: &str) -> Result<Arc<tokio::sync::Mutex<()>>, PipelineError> {
        let mut locks = self.locks.lock().map_err(PipelineError::store)?;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Ok(locks.entry(id.to_string()).or_default().clone())
    }

    async fn read_job(&self, id: &str) -> Result<Option<Job>, PipelineError> {
        let path = self.path_for(id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| PipelineError::Store(format!("corrupt job file {}: {}", path.display(), e))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PipelineError::store(e)),
        }
    }

    async fn write_job(&self, job: &Job) -> Result<(), PipelineError> {
        let path = self.path_for(&job.id);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(job).map_err(PipelineError::store)?;
        tokio::fs::write(&tmp, content).await.map_err(PipelineError::store)?;
        tokio::fs::rename(&tmp, &path).await.map_err(PipelineError::store)?;
        Ok(())
    }

    async fn modify(&self, id: &str, f: impl FnOnce(&mut Job)) -> Result<Job, PipelineError> {
        let lock = self.lock_for(id)?;
        let _guard = lock.lock().await;

        let mut job = self
            .read_job(id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))?;
        f(&mut job);
        self.write_job(&job).await?;
        Ok(job)
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn create(&self, id: &str, input: StoryRequest) -> Result<Job, PipelineError> {
        let lock = self.lock_for(id)?;
        let _guard = lock.lock().await;

        let path = self.path_for(id);
        if tokio::fs::try_exists(&path).await.map_err(PipelineError::store)? {
            return Err(PipelineError::DuplicateId(id.to_string()));
        }

        // The record only appears under its final name once fully written;
        // `hard_link` refuses to replace an existing file.
        let job = Job::new(id, input);
        let content = serde_json::to_vec_pretty(&job).map_err(PipelineError::store)?;
        let staged = path.with_extension("json.new");
        let linked = match tokio::fs::write(&staged, content).await {
            Ok(()) => tokio::fs::hard_link(&staged, &path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = tokio::fs::remove_file(&staged).await {
            debug!("Could not remove {}: {}", staged.display(), e);
        }

        match linked {
            Ok(()) => {
                debug!("Created job file {}", path.display());
                Ok(job)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(PipelineError::DuplicateId(id.to_string())),
            Err(e) => Err(PipelineError::store(e)),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, PipelineError> {
        self.read_job(id).await
    }

    async fn update(&self, id: &str, stage: PipelineStage, output: Value) -> Result<Job, PipelineError> {
        self.modify(id, |job| {
            job.record(stage, output);
        })
        .await
    }

    async fn set_status(
        &self,
        id: &str,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<Job, PipelineError> {
        self.modify(id, |job| job.set_status(status, error)).await
    }
}

/// Maps an external id onto a file name; anything outside `[A-Za-z0-9_-]`
/// is hex-escaped so distinct ids never collide.
fn file_stem(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for b in id.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("~{:02x}", b));
        }
    }
    out
}

//! Ingestion: extract, chunk, embed and index a document, either inline or as
//! a background job on the rayon pool.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::chunker::Chunker;
use crate::config::Settings;
use crate::database::VectorIndex;
use crate::embedder::{embed_chunks, Embedder};
use crate::error::{Error, ExtractError, Result};
use crate::extract::{display_name, extract_document};
use crate::vector_entry::{EmbeddedChunk, FileType};

/// Extract → chunk → embed for one document.
pub struct DocumentProcessor {
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
}

impl DocumentProcessor {
    pub fn new(chunker: Chunker, embedder: Arc<dyn Embedder>, batch_size: usize) -> Self {
        Self {
            chunker,
            embedder,
            batch_size: batch_size.max(1),
        }
    }

    pub fn from_settings(settings: &Settings, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let chunker = Chunker::new(settings.chunk_config())?;
        Ok(Self::new(chunker, embedder, settings.embedding_batch_size))
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Embedded chunks for `bytes`, ready for [`VectorIndex::add`]. A document
    /// without text yields no chunks.
    pub fn process_document(&self, bytes: &[u8], file_name: &str) -> Result<Vec<EmbeddedChunk>> {
        let document = extract_document(bytes, file_name)?;
        let chunks = self.chunker.chunk(&document.text, &document.info);
        if chunks.is_empty() {
            info!("No text to index in {}", file_name);
            return Ok(Vec::new());
        }

        let embedded = embed_chunks(self.embedder.as_ref(), chunks, self.batch_size)?;
        debug!("Processed {} into {} chunks", file_name, embedded.len());
        Ok(embedded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed { chunks: usize },
    Failed { reason: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed { .. } | JobStatus::Failed { .. })
    }
}

static JOB_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identifies one submission. Unique for the life of the process, so two
/// uploads of the same file name never share a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    fn next() -> Self {
        JobId(JOB_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Receives status transitions of ingestion jobs.
pub trait StatusSink: Send + Sync {
    fn report(&self, job: JobId, document: &str, status: JobStatus);
}

/// Writes every transition to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn report(&self, job: JobId, document: &str, status: JobStatus) {
        match status {
            JobStatus::Failed { reason } => error!("{} {}: failed: {}", job, document, reason),
            JobStatus::Completed { chunks } => {
                info!("{} {}: completed, {} chunks", job, document, chunks)
            }
            other => debug!("{} {}: {:?}", job, document, other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRecord {
    pub job: JobId,
    pub document: String,
    pub status: JobStatus,
}

/// Latest status per job, queryable while jobs run.
#[derive(Debug, Default)]
pub struct StatusBoard {
    jobs: Mutex<HashMap<JobId, JobRecord>>,
    changed: Condvar,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, job: JobId) -> Option<JobStatus> {
        self.lock().get(&job).map(|record| record.status.clone())
    }

    /// The most recent submission of `document`.
    pub fn latest(&self, document: &str) -> Option<JobRecord> {
        self.lock()
            .values()
            .filter(|record| record.document == document)
            .max_by_key(|record| record.job)
            .cloned()
    }

    /// Every job seen, oldest first.
    pub fn snapshot(&self) -> Vec<JobRecord> {
        let mut all: Vec<JobRecord> = self.lock().values().cloned().collect();
        all.sort_by_key(|record| record.job);
        all
    }

    /// Block until `job` reaches `Completed` or `Failed`, or `timeout`
    /// elapses. Returns the last status seen.
    pub fn wait_for(&self, job: JobId, timeout: Duration) -> Option<JobStatus> {
        let deadline = Instant::now() + timeout;
        let mut jobs = self.lock();
        loop {
            let current = jobs.get(&job).map(|record| record.status.clone());
            if current.as_ref().map_or(false, JobStatus::is_terminal) {
                return current;
            }
            let now = Instant::now();
            if now >= deadline {
                return current;
            }
            jobs = match self.changed.wait_timeout(jobs, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, JobRecord>> {
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StatusSink for StatusBoard {
    fn report(&self, job: JobId, document: &str, status: JobStatus) {
        self.lock().insert(
            job,
            JobRecord {
                job,
                document: document.to_string(),
                status,
            },
        );
        self.changed.notify_all();
    }
}

/// Forwards every transition to each inner sink.
pub struct FanOut(pub Vec<Arc<dyn StatusSink>>);

impl StatusSink for FanOut {
    fn report(&self, job: JobId, document: &str, status: JobStatus) {
        for sink in &self.0 {
            sink.report(job, document, status.clone());
        }
    }
}

static STAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// An uploaded file written to the staging directory. The file is removed
/// when this value is dropped.
#[derive(Debug)]
pub struct StagedUpload {
    path: PathBuf,
}

impl StagedUpload {
    pub fn create(dir: &Path, file_name: &str, bytes: &[u8]) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let name = display_name(Path::new(file_name));
        let unique = format!(
            "{}-{}-{}",
            std::process::id(),
            STAGE_COUNTER.fetch_add(1, Ordering::Relaxed),
            name
        );
        let path = dir.join(unique);
        fs::write(&path, bytes)?;
        debug!("Staged upload at {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedUpload {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed staged upload {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Could not remove staged upload {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

/// Accepts documents and indexes them, reporting progress to a [`StatusSink`].
pub struct Ingestor {
    processor: Arc<DocumentProcessor>,
    index: Arc<VectorIndex>,
    sink: Arc<dyn StatusSink>,
    upload_dir: PathBuf,
    max_file_size: u64,
}

impl Ingestor {
    pub fn new(
        processor: Arc<DocumentProcessor>,
        index: Arc<VectorIndex>,
        sink: Arc<dyn StatusSink>,
        upload_dir: impl Into<PathBuf>,
        max_file_size: u64,
    ) -> Self {
        Self {
            processor,
            index,
            sink,
            upload_dir: upload_dir.into(),
            max_file_size,
        }
    }

    /// Validate and stage `bytes`, then index them on the rayon pool. Format
    /// and size problems are returned here; everything after staging is
    /// reported through the sink under the returned id.
    pub fn submit(&self, bytes: Vec<u8>, file_name: &str) -> Result<JobId> {
        self.validate(bytes.len() as u64, file_name)?;
        let staged = StagedUpload::create(&self.upload_dir, file_name, &bytes)?;
        drop(bytes);
        let job = JobId::next();
        self.sink.report(job, file_name, JobStatus::Pending);

        let processor = Arc::clone(&self.processor);
        let index = Arc::clone(&self.index);
        let sink = Arc::clone(&self.sink);
        let name = file_name.to_string();
        rayon::spawn(move || {
            sink.report(job, &name, JobStatus::Processing);
            let outcome = fs::read(staged.path())
                .map_err(Error::from)
                .and_then(|bytes| index_document(&processor, &index, &bytes, &name));
            drop(staged);
            sink.report(job, &name, terminal_status(&outcome));
        });
        Ok(job)
    }

    /// Index `bytes` on the calling thread. Returns the number of chunks added.
    pub fn ingest_now(&self, bytes: &[u8], file_name: &str) -> Result<usize> {
        self.validate(bytes.len() as u64, file_name)?;
        let job = JobId::next();
        self.sink.report(job, file_name, JobStatus::Pending);
        self.sink.report(job, file_name, JobStatus::Processing);
        let outcome = index_document(&self.processor, &self.index, bytes, file_name);
        self.sink.report(job, file_name, terminal_status(&outcome));
        outcome
    }

    fn validate(&self, size: u64, file_name: &str) -> Result<()> {
        if !FileType::is_supported(file_name) {
            let ext = Path::new(file_name)
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
                .unwrap_or_default();
            return Err(ExtractError::UnsupportedFormat(ext).into());
        }
        if size > self.max_file_size {
            return Err(Error::FileTooLarge {
                size,
                max: self.max_file_size,
            });
        }
        Ok(())
    }
}

fn index_document(
    processor: &DocumentProcessor,
    index: &VectorIndex,
    bytes: &[u8],
    file_name: &str,
) -> Result<usize> {
    let embedded = processor.process_document(bytes, file_name)?;
    let added = index.add(embedded)?;
    info!("Indexed {} chunks from {}", added, file_name);
    Ok(added)
}

fn terminal_status(outcome: &Result<usize>) -> JobStatus {
    match outcome {
        Ok(chunks) => JobStatus::Completed { chunks: *chunks },
        Err(e) => JobStatus::Failed {
            reason: e.to_string(),
        },
    }
}

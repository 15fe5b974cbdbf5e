//! On-disk layout of a vector index.
//!
//! Three files always travel together:
//!
//! - `index.bin`: the flat vector rows, memory-mapped on load
//! - `metadata.bin`: bincode-encoded chunk metadata, position-aligned with the rows
//! - `config.json`: dimension, metric, entry count and SHA-256 digests of the other two
//!
//! Writes go to `*.tmp` siblings first. Once all three are on disk a `COMMIT`
//! marker is published and the temporaries are renamed into place. A marker
//! found on open means the temporaries are complete and are rolled forward;
//! without one they are leftovers of an aborted write and are deleted.
//!
//! Removing the index is a transaction too. The live files are renamed to
//! `*.old` siblings, then a `CLEAR` marker is published and the set-aside
//! files are deleted. Set-aside files without a marker are restored on open.

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::flat_index::{DistanceMetric, FlatL2Index};
use crate::vector_entry::Chunk;

pub const INDEX_FILE: &str = "index.bin";
pub const METADATA_FILE: &str = "metadata.bin";
pub const CONFIG_FILE: &str = "config.json";
const COMMIT_MARKER: &str = "COMMIT";
const CLEAR_MARKER: &str = "CLEAR";
const TMP_SUFFIX: &str = ".tmp";
const ASIDE_SUFFIX: &str = ".old";
const FILES: [&str; 3] = [INDEX_FILE, METADATA_FILE, CONFIG_FILE];

pub const STORAGE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PersistedConfig {
    pub format_version: u32,
    pub dimension: usize,
    pub distance_metric: DistanceMetric,
    pub entry_count: usize,
    pub index_sha256: String,
    pub metadata_sha256: String,
}

/// Everything read back from a consistent set of index files.
#[derive(Debug)]
pub struct Snapshot {
    pub config: PersistedConfig,
    pub index: FlatL2Index,
    pub metadata: Vec<Chunk>,
}

#[derive(Debug, Clone)]
pub struct IndexFiles {
    dir: PathBuf,
}

impl IndexFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    pub fn index_exists(&self) -> bool {
        self.index_path().exists()
    }

    fn tmp_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}{TMP_SUFFIX}"))
    }

    fn aside_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}{ASIDE_SUFFIX}"))
    }

    fn marker_path(&self) -> PathBuf {
        self.dir.join(COMMIT_MARKER)
    }

    fn clear_marker_path(&self) -> PathBuf {
        self.dir.join(CLEAR_MARKER)
    }

    /// Finish or undo a removal or commit interrupted by a crash.
    pub fn recover(&self) -> Result<(), StoreError> {
        if self.clear_marker_path().exists() {
            self.finish_clear();
        } else {
            for name in FILES {
                let aside = self.aside_path(name);
                if !aside.exists() {
                    continue;
                }
                let target = self.dir.join(name);
                if target.exists() {
                    warn!("Discarding stale {}", aside.display());
                    if let Err(e) = remove_if_exists(&aside) {
                        warn!("Could not remove set-aside file: {}", e);
                    }
                } else {
                    fs::rename(&aside, &target).map_err(|e| StoreError::persistence(&target, e))?;
                    info!("Restored {} after interrupted removal", target.display());
                }
            }
        }
        remove_if_exists(&self.tmp_path(CLEAR_MARKER))?;

        let marker = self.marker_path();
        if marker.exists() {
            for name in FILES {
                let tmp = self.tmp_path(name);
                if tmp.exists() {
                    let target = self.dir.join(name);
                    fs::rename(&tmp, &target).map_err(|e| StoreError::persistence(&target, e))?;
                }
            }
            remove_if_exists(&marker)?;
            info!("Rolled forward interrupted commit in {}", self.dir.display());
        } else {
            for name in FILES {
                let tmp = self.tmp_path(name);
                if tmp.exists() {
                    warn!("Discarding incomplete write {}", tmp.display());
                    remove_if_exists(&tmp)?;
                }
            }
            remove_if_exists(&self.tmp_path(COMMIT_MARKER))?;
        }
        Ok(())
    }

    /// Read and cross-check the three files. `None` when none of them exist.
    pub fn load(&self) -> Result<Option<Snapshot>, StoreError> {
        let present: Vec<bool> = FILES.iter().map(|name| self.dir.join(name).exists()).collect();
        if present.iter().all(|p| !p) {
            return Ok(None);
        }
        if !present.iter().all(|p| *p) {
            return Err(StoreError::Corrupt(format!(
                "incomplete index in {}: expected {}, {} and {}",
                self.dir.display(),
                INDEX_FILE,
                METADATA_FILE,
                CONFIG_FILE
            )));
        }

        let config_path = self.config_path();
        let config_json =
            fs::read_to_string(&config_path).map_err(|e| StoreError::persistence(&config_path, e))?;
        let config: PersistedConfig = serde_json::from_str(&config_json)
            .map_err(|e| StoreError::Corrupt(format!("unreadable {CONFIG_FILE}: {e}")))?;
        if config.format_version != STORAGE_FORMAT_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported storage format version {}",
                config.format_version
            )));
        }

        let index_path = self.index_path();
        let file = File::open(&index_path).map_err(|e| StoreError::persistence(&index_path, e))?;
        // Safety: the file is only replaced by rename, never modified in place.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| StoreError::persistence(&index_path, e))?;
        verify_digest(INDEX_FILE, &mmap, &config.index_sha256)?;
        let index = FlatL2Index::from_bytes(&mmap)?;

        let metadata_path = self.metadata_path();
        let metadata_bytes =
            fs::read(&metadata_path).map_err(|e| StoreError::persistence(&metadata_path, e))?;
        verify_digest(METADATA_FILE, &metadata_bytes, &config.metadata_sha256)?;
        let metadata: Vec<Chunk> = bincode::deserialize(&metadata_bytes)
            .map_err(|e| StoreError::Corrupt(format!("unreadable {METADATA_FILE}: {e}")))?;

        if index.dimension() != config.dimension {
            return Err(StoreError::Corrupt(format!(
                "{} has dimension {} but {} records {}",
                INDEX_FILE,
                index.dimension(),
                CONFIG_FILE,
                config.dimension
            )));
        }
        if index.len() != config.entry_count || metadata.len() != config.entry_count {
            return Err(StoreError::Corrupt(format!(
                "entry counts disagree: {} vectors, {} metadata entries, {} recorded",
                index.len(),
                metadata.len(),
                config.entry_count
            )));
        }

        debug!(
            "Loaded {} entries (dimension {}) from {}",
            config.entry_count,
            config.dimension,
            self.dir.display()
        );
        Ok(Some(Snapshot {
            config,
            index,
            metadata,
        }))
    }

    /// Replace the on-disk index with `index` + `metadata` as one transaction.
    /// Any failure before the commit marker is published leaves the previous
    /// files untouched.
    pub fn commit(
        &self,
        index: &FlatL2Index,
        metadata: &[&Chunk],
        distance_metric: DistanceMetric,
    ) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).map_err(|e| StoreError::persistence(&self.dir, e))?;

        let index_bytes = index.to_bytes();
        let metadata_bytes =
            bincode::serialize(metadata).map_err(|e| StoreError::Encoding(e.to_string()))?;
        let config = PersistedConfig {
            format_version: STORAGE_FORMAT_VERSION,
            dimension: index.dimension(),
            distance_metric,
            entry_count: metadata.len(),
            index_sha256: sha256_hex(&index_bytes),
            metadata_sha256: sha256_hex(&metadata_bytes),
        };
        let config_bytes =
            serde_json::to_vec_pretty(&config).map_err(|e| StoreError::Encoding(e.to_string()))?;

        let staged = [
            (INDEX_FILE, index_bytes.as_slice()),
            (METADATA_FILE, metadata_bytes.as_slice()),
            (CONFIG_FILE, config_bytes.as_slice()),
        ];

        if let Err(e) = self
            .stage(&staged)
            .and_then(|()| self.publish_marker(COMMIT_MARKER))
        {
            self.discard_staged();
            return Err(e);
        }

        for name in FILES {
            let target = self.dir.join(name);
            fs::rename(self.tmp_path(name), &target).map_err(|e| StoreError::persistence(&target, e))?;
        }
        remove_if_exists(&self.marker_path())?;

        debug!(
            "Committed {} entries to {}",
            config.entry_count,
            self.dir.display()
        );
        Ok(())
    }

    /// Remove the index files as one transaction. On error the previous
    /// files are back in place.
    pub fn remove_all(&self) -> Result<(), StoreError> {
        self.finish_clear();
        self.discard_staged();

        let mut moved = Vec::new();
        for name in FILES {
            let live = self.dir.join(name);
            if !live.exists() {
                continue;
            }
            if let Err(e) = fs::rename(&live, self.aside_path(name)) {
                self.restore_aside(&moved);
                return Err(StoreError::persistence(&live, e));
            }
            moved.push(name);
        }
        if moved.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.publish_marker(CLEAR_MARKER) {
            if let Err(e) = remove_if_exists(&self.tmp_path(CLEAR_MARKER)) {
                warn!("Could not remove staged marker: {}", e);
            }
            self.restore_aside(&moved);
            return Err(e);
        }
        self.finish_clear();
        debug!("Removed index files from {}", self.dir.display());
        Ok(())
    }

    /// Delete set-aside files of a published removal. The marker stays until
    /// all of them are gone.
    fn finish_clear(&self) {
        let marker = self.clear_marker_path();
        if !marker.exists() {
            return;
        }
        let mut clean = true;
        for name in FILES {
            if let Err(e) = remove_if_exists(&self.aside_path(name)) {
                warn!("Could not remove set-aside file: {}", e);
                clean = false;
            }
        }
        if clean {
            if let Err(e) = remove_if_exists(&marker) {
                warn!("Could not remove {}: {}", marker.display(), e);
            }
        }
    }

    fn restore_aside(&self, moved: &[&str]) {
        for name in moved {
            let live = self.dir.join(name);
            if let Err(e) = fs::rename(self.aside_path(name), &live) {
                warn!("Could not restore {}: {}", live.display(), e);
            }
        }
    }

    fn stage(&self, staged: &[(&str, &[u8])]) -> Result<(), StoreError> {
        for (name, bytes) in staged {
            let tmp = self.tmp_path(name);
            write_synced(&tmp, bytes).map_err(|e| StoreError::persistence(&tmp, e))?;
        }
        Ok(())
    }

    fn publish_marker(&self, name: &str) -> Result<(), StoreError> {
        let tmp = self.tmp_path(name);
        let marker = self.dir.join(name);
        write_synced(&tmp, name.as_bytes()).map_err(|e| StoreError::persistence(&tmp, e))?;
        fs::rename(&tmp, &marker).map_err(|e| StoreError::persistence(&marker, e))
    }

    fn discard_staged(&self) {
        for name in FILES.iter().copied().chain(std::iter::once(COMMIT_MARKER)) {
            let tmp = self.tmp_path(name);
            if let Err(e) = remove_if_exists(&tmp) {
                warn!("Could not remove staged file: {}", e);
            }
        }
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::persistence(path, e)),
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn verify_digest(name: &str, bytes: &[u8], expected: &str) -> Result<(), StoreError> {
    let actual = sha256_hex(bytes);
    if actual != expected {
        return Err(StoreError::Corrupt(format!(
            "{name} digest {actual} does not match recorded {expected}"
        )));
    }
    Ok(())
}

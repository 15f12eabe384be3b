//! Versioned feature storage engine

use fjall::{Config, PartitionCreateOptions, PersistMode, TxKeyspace, TxPartitionHandle};
use geostore_core::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub mod bucket;
pub mod chain;
pub mod entry;
pub mod factory;
pub mod memory;
pub mod storage;

pub use bucket::*;
pub use entry::*;
pub use factory::*;
pub use memory::*;
pub use storage::*;

/// Settings shared by every bucket of a storage
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Keyspace directory for the fjall backend
    pub data_dir: PathBuf,
    /// Upper bound on a single bucket operation
    pub operation_timeout: Option<Duration>,
    /// SRID for buckets created without one
    pub default_srid: i32,
}

impl StorageConfig {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        StorageConfig {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    pub fn with_default_srid(mut self, srid: i32) -> Self {
        self.default_srid = srid;
        self
    }

    /// Deadline for an operation starting now
    pub fn deadline(&self) -> Option<Instant> {
        self.operation_timeout.map(|timeout| Instant::now() + timeout)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            data_dir: PathBuf::from("./data"),
            operation_timeout: None,
            default_srid: WGS84,
        }
    }
}

/// Storage engine wrapping the transactional fjall keyspace.
///
/// Clones share the keyspace; buckets hold a clone and fail with
/// `StorageClosed` once [`StorageEngine::close`] has run.
#[derive(Clone)]
pub struct StorageEngine {
    keyspace: Arc<TxKeyspace>,
    config: Arc<StorageConfig>,
    closed: Arc<AtomicBool>,
}

impl StorageEngine {
    /// Open the keyspace under `config.data_dir`
    pub fn new(config: StorageConfig) -> Result<Self> {
        let keyspace = Arc::new(
            Config::new(&config.data_dir)
                .open_transactional()
                .map_err(|e| GeoStoreError::storage("failed to open keyspace", e))?,
        );

        Ok(StorageEngine {
            keyspace,
            config: Arc::new(config),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Create temporary storage engine for testing
    #[cfg(any(test, feature = "test-utils"))]
    pub fn temp() -> Result<(Self, tempfile::TempDir)> {
        let temp_dir = tempfile::tempdir()?;
        let engine = Self::new(StorageConfig::new(temp_dir.path()))?;
        Ok((engine, temp_dir))
    }

    /// Get the underlying keyspace
    pub(crate) fn keyspace(&self) -> &TxKeyspace {
        &self.keyspace
    }

    /// Open (or create) the partition holding bucket `name`
    pub(crate) fn partition(&self, name: &BucketName) -> Result<TxPartitionHandle> {
        self.keyspace
            .open_partition(name.as_str(), PartitionCreateOptions::default())
            .map_err(|e| GeoStoreError::storage("failed to open partition", e))
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GeoStoreError::StorageClosed);
        }
        Ok(())
    }

    /// Persist all changes to disk
    pub fn persist(&self) -> Result<()> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .map_err(|e| GeoStoreError::storage("failed to persist keyspace", e))
    }

    /// Flush and refuse further operations. Safe to call repeatedly.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.persist()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

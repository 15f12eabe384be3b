//! Bucket lifecycle: creation, lookup and deletion

use chrono::{DateTime, Utc};
use fjall::{PartitionCreateOptions, TxPartitionHandle};
use geostore_core::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::bucket::{clear_partition, keyspace_error, Bucket, FjallBucket};
use crate::{StorageConfig, StorageEngine};

/// Partition holding one `BucketInfo` per bucket name
const REGISTRY_PARTITION: &str = "_buckets";

/// Options accepted by `create_bucket`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketOptions {
    /// Spatial reference of the bucket, storage default when unset
    pub srid: Option<i32>,
    /// Advisory bound on retained history; recorded, never enforced
    pub revision_cap: Option<u32>,
}

impl BucketOptions {
    pub fn with_srid(mut self, srid: i32) -> Self {
        self.srid = Some(srid);
        self
    }

    pub fn with_revision_cap(mut self, cap: u32) -> Self {
        self.revision_cap = Some(cap);
        self
    }
}

/// Persistent description of a bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketInfo {
    pub name: BucketName,
    pub srid: i32,
    pub revision_cap: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl BucketInfo {
    pub fn new(name: BucketName, options: &BucketOptions, config: &StorageConfig) -> Result<Self> {
        let srid = options.srid.unwrap_or(config.default_srid);
        SpatialReference::new(srid)?;
        Ok(BucketInfo {
            name,
            srid,
            revision_cap: options.revision_cap,
            created_at: Utc::now(),
        })
    }
}

/// Creates, looks up and deletes buckets over one shared backend
pub trait BucketFactory: Send + Sync {
    /// Create a bucket. An existing bucket is wiped and recreated when
    /// `overwrite` is set, otherwise this fails with `DuplicatedBucket`.
    fn create_bucket(
        &self,
        name: &BucketName,
        overwrite: bool,
        options: BucketOptions,
    ) -> Result<Arc<dyn Bucket>>;

    fn get_bucket(&self, name: &BucketName) -> Result<Arc<dyn Bucket>>;

    fn has_bucket(&self, name: &BucketName) -> Result<bool>;

    /// Delete a bucket and its history; `BucketNotFound` if absent.
    fn delete_bucket(&self, name: &BucketName) -> Result<bool>;

    fn list_buckets(&self) -> Result<Vec<BucketInfo>>;

    /// Release backend resources. Idempotent.
    fn close(&self) -> Result<()>;
}

/// Bucket factory over a fjall keyspace, one partition per bucket
pub struct FjallStorage {
    engine: StorageEngine,
    registry: TxPartitionHandle,
}

impl FjallStorage {
    pub fn new(engine: StorageEngine) -> Result<Self> {
        let registry = engine
            .keyspace()
            .open_partition(REGISTRY_PARTITION, PartitionCreateOptions::default())
            .map_err(keyspace_error)?;
        Ok(FjallStorage { engine, registry })
    }

    pub fn open(config: StorageConfig) -> Result<Self> {
        Self::new(StorageEngine::new(config)?)
    }

    /// Create temporary storage for testing
    #[cfg(any(test, feature = "test-utils"))]
    pub fn temp() -> Result<(Self, tempfile::TempDir)> {
        let (engine, temp_dir) = StorageEngine::temp()?;
        Ok((Self::new(engine)?, temp_dir))
    }

    /// Temporary storage with a custom configuration
    #[cfg(any(test, feature = "test-utils"))]
    pub fn temp_with(config: StorageConfig) -> Result<(Self, tempfile::TempDir)> {
        let temp_dir = tempfile::tempdir()?;
        let config = StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..config
        };
        Ok((Self::open(config)?, temp_dir))
    }

    pub fn engine(&self) -> &StorageEngine {
        &self.engine
    }

    fn read_info(&self, name: &BucketName) -> Result<Option<BucketInfo>> {
        let tx = self.engine.keyspace().read_tx();
        match tx.get(&self.registry, name.as_str()).map_err(keyspace_error)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn bucket(&self, info: BucketInfo) -> Arc<dyn Bucket> {
        Arc::new(FjallBucket::new(
            self.engine.clone(),
            info,
            self.registry.clone(),
        ))
    }
}

impl BucketFactory for FjallStorage {
    fn create_bucket(
        &self,
        name: &BucketName,
        overwrite: bool,
        options: BucketOptions,
    ) -> Result<Arc<dyn Bucket>> {
        self.engine.ensure_open()?;
        let info = BucketInfo::new(name.clone(), &options, self.engine.config())?;
        let partition = self.engine.partition(name)?;

        let mut tx = self.engine.keyspace().write_tx();
        let existing = tx
            .get(&self.registry, name.as_str())
            .map_err(keyspace_error)?;

        if existing.is_some() && !overwrite {
            tx.rollback();
            return Err(GeoStoreError::DuplicatedBucket {
                bucket: name.to_string(),
            });
        }

        let cleared = clear_partition(&mut tx, &partition)?;
        tx.insert(&self.registry, name.as_str(), serde_json::to_vec(&info)?);
        tx.commit().map_err(keyspace_error)?;
        self.engine.persist()?;

        info!(
            bucket = %name,
            srid = info.srid,
            overwritten = existing.is_some(),
            cleared,
            "created bucket"
        );
        Ok(self.bucket(info))
    }

    fn get_bucket(&self, name: &BucketName) -> Result<Arc<dyn Bucket>> {
        self.engine.ensure_open()?;
        let info = self
            .read_info(name)?
            .ok_or_else(|| GeoStoreError::BucketNotFound {
                bucket: name.to_string(),
            })?;
        Ok(self.bucket(info))
    }

    fn has_bucket(&self, name: &BucketName) -> Result<bool> {
        self.engine.ensure_open()?;
        Ok(self.read_info(name)?.is_some())
    }

    fn delete_bucket(&self, name: &BucketName) -> Result<bool> {
        self.engine.ensure_open()?;

        let mut tx = self.engine.keyspace().write_tx();
        let existing = tx
            .get(&self.registry, name.as_str())
            .map_err(keyspace_error)?;
        if existing.is_none() {
            tx.rollback();
            return Err(GeoStoreError::BucketNotFound {
                bucket: name.to_string(),
            });
        }

        let partition = match self.engine.partition(name) {
            Ok(partition) => partition,
            Err(e) => {
                tx.rollback();
                return Err(e);
            }
        };
        let cleared = clear_partition(&mut tx, &partition)?;
        tx.remove(&self.registry, name.as_str());
        tx.commit().map_err(keyspace_error)?;
        self.engine.persist()?;

        // Registry no longer names the bucket, so nothing reopens it
        self.engine
            .keyspace()
            .delete_partition(partition)
            .map_err(keyspace_error)?;

        info!(bucket = %name, cleared, "deleted bucket");
        Ok(true)
    }

    fn list_buckets(&self) -> Result<Vec<BucketInfo>> {
        self.engine.ensure_open()?;
        let tx = self.engine.keyspace().read_tx();
        let mut buckets = Vec::new();
        for item in tx.prefix(&self.registry, b"") {
            let (_, value) = item.map_err(keyspace_error)?;
            buckets.push(serde_json::from_slice(&value)?);
        }
        Ok(buckets)
    }

    fn close(&self) -> Result<()> {
        self.engine.close()
    }
}

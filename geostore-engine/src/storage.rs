//! High-level storage operations

use geostore_core::*;
use std::sync::Arc;

use crate::{
    Bucket, BucketFactory, BucketInfo, BucketOptions, FeatureEntry, FjallStorage, MemoryStorage,
    StorageConfig,
};

/// Backend selection for [`Storage::open`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Fjall,
    Memory,
}

impl std::str::FromStr for Backend {
    type Err = GeoStoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fjall" => Ok(Backend::Fjall),
            "memory" => Ok(Backend::Memory),
            other => Err(GeoStoreError::internal(format!("unknown backend '{}'", other))),
        }
    }
}

/// High-level storage interface over any bucket factory
#[derive(Clone)]
pub struct Storage {
    factory: Arc<dyn BucketFactory>,
}

impl Storage {
    /// Create new storage instance
    pub fn new(factory: Arc<dyn BucketFactory>) -> Self {
        Storage { factory }
    }

    pub fn open(backend: Backend, config: StorageConfig) -> Result<Self> {
        let factory: Arc<dyn BucketFactory> = match backend {
            Backend::Fjall => Arc::new(FjallStorage::open(config)?),
            Backend::Memory => Arc::new(MemoryStorage::new(config)),
        };
        Ok(Storage::new(factory))
    }

    pub fn memory() -> Self {
        Storage::new(Arc::new(MemoryStorage::default()))
    }

    pub fn create_bucket(
        &self,
        name: &BucketName,
        overwrite: bool,
        options: BucketOptions,
    ) -> Result<Arc<dyn Bucket>> {
        self.factory.create_bucket(name, overwrite, options)
    }

    pub fn get_bucket(&self, name: &BucketName) -> Result<Arc<dyn Bucket>> {
        self.factory.get_bucket(name)
    }

    pub fn has_bucket(&self, name: &BucketName) -> Result<bool> {
        self.factory.has_bucket(name)
    }

    pub fn delete_bucket(&self, name: &BucketName) -> Result<bool> {
        self.factory.delete_bucket(name)
    }

    pub fn list_buckets(&self) -> Result<Vec<BucketInfo>> {
        self.factory.list_buckets()
    }

    pub fn close(&self) -> Result<()> {
        self.factory.close()
    }

    /// Feature accessor for the bucket named by `key`
    pub fn entry(&self, key: &Key) -> Result<FeatureEntry> {
        Ok(FeatureEntry::new(self.factory.get_bucket(key.bucket())?))
    }

    pub fn put_feature(
        &self,
        key: &Key,
        feature: &Feature,
        revision: Option<&Revision>,
    ) -> Result<Response> {
        self.entry(key)?.put_feature(key, feature, revision)
    }

    pub fn get_feature(
        &self,
        key: &Key,
        revision: Option<&Revision>,
    ) -> Result<(Response, Feature)> {
        self.entry(key)?.get_feature(key, revision)
    }

    pub fn delete_feature(&self, key: &Key, revision: Option<&Revision>) -> Result<Response> {
        self.entry(key)?.delete_feature(key, revision)
    }
}

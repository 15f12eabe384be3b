//! In-memory bucket backend for tests and ephemeral deployments.
//!
//! Chains live in maps behind a `RwLock` per bucket. The write lock plays
//! the role of the backing store's transaction: the whole check-and-append
//! of a commit runs while it is held.

use chrono::{DateTime, Utc};
use geostore_core::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::info;

use crate::bucket::{history_of, Bucket};
use crate::chain::{self, ChainReader, ChainWriter, HeadPointer, RevisionRow};
use crate::{BucketFactory, BucketInfo, BucketOptions, StorageConfig};

fn poisoned<E: std::fmt::Display>(e: E) -> GeoStoreError {
    GeoStoreError::internal(format!("lock poisoned: {e}"))
}

/// Revision chains of one bucket
#[derive(Debug, Default)]
struct MemoryChains {
    rows: BTreeMap<(String, u64), RevisionRow>,
    index: HashMap<(String, Revision), u64>,
    heads: BTreeMap<String, HeadPointer>,
}

impl ChainReader for MemoryChains {
    fn head(&self, name: &str) -> Result<Option<HeadPointer>> {
        Ok(self.heads.get(name).cloned())
    }

    fn last_sequence(&self, name: &str) -> Result<Option<u64>> {
        let range = (name.to_string(), 0)..=(name.to_string(), u64::MAX);
        Ok(self.rows.range(range).next_back().map(|((_, seq), _)| *seq))
    }

    fn sequence_of(&self, name: &str, revision: &Revision) -> Result<Option<u64>> {
        Ok(self
            .index
            .get(&(name.to_string(), revision.clone()))
            .copied())
    }

    fn row(&self, name: &str, sequence: u64) -> Result<Option<RevisionRow>> {
        Ok(self.rows.get(&(name.to_string(), sequence)).cloned())
    }

    fn rows(&self, name: &str) -> Result<Vec<RevisionRow>> {
        let range = (name.to_string(), 0)..=(name.to_string(), u64::MAX);
        Ok(self.rows.range(range).map(|(_, row)| row.clone()).collect())
    }

    fn live_names(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        Ok(self
            .heads
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .take(limit)
            .map(|(name, _)| name.clone())
            .collect())
    }
}

impl ChainWriter for MemoryChains {
    fn put_row(&mut self, row: &RevisionRow) -> Result<()> {
        self.index
            .insert((row.name.clone(), row.revision.clone()), row.sequence);
        self.rows
            .insert((row.name.clone(), row.sequence), row.clone());
        Ok(())
    }

    fn set_head(&mut self, name: &str, head: Option<&HeadPointer>) -> Result<()> {
        match head {
            Some(head) => {
                self.heads.insert(name.to_string(), head.clone());
            }
            None => {
                self.heads.remove(name);
            }
        }
        Ok(())
    }
}

/// Bucket held entirely in process memory
#[derive(Debug)]
pub struct MemoryBucket {
    info: RwLock<BucketInfo>,
    name: BucketName,
    chains: RwLock<MemoryChains>,
    dropped: AtomicBool,
    config: Arc<StorageConfig>,
    closed: Arc<AtomicBool>,
}

impl MemoryBucket {
    fn ensure_usable(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GeoStoreError::StorageClosed);
        }
        if self.dropped.load(Ordering::Acquire) {
            return Err(GeoStoreError::BucketNotFound {
                bucket: self.name.to_string(),
            });
        }
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&MemoryChains) -> Result<T>) -> Result<T> {
        self.ensure_usable()?;
        let chains = self.chains.read().map_err(poisoned)?;
        f(&chains)
    }

    fn write<T>(&self, f: impl FnOnce(&mut MemoryChains) -> Result<T>) -> Result<T> {
        self.ensure_usable()?;
        let mut chains = self.chains.write().map_err(poisoned)?;
        f(&mut chains)
    }

    fn reset(&self, info: BucketInfo) -> Result<()> {
        *self.chains.write().map_err(poisoned)? = MemoryChains::default();
        *self.info.write().map_err(poisoned)? = info;
        Ok(())
    }
}

impl Bucket for MemoryBucket {
    fn name(&self) -> &BucketName {
        &self.name
    }

    fn info(&self) -> BucketInfo {
        match self.info.read() {
            Ok(info) => info.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn commit(&self, name: &str, mapper: &Mapper, parent: Option<&Revision>) -> Result<Commit> {
        let deadline = self.config.deadline();
        self.write(|chains| chain::commit(chains, &self.name, name, mapper, parent, deadline))
    }

    fn checkout(&self, name: &str, revision: Option<&Revision>) -> Result<(Commit, Mapper)> {
        let row = self.read(|chains| chain::locate(chains, &self.name, name, revision))?;
        Ok((row.commit(&self.name), row.mapper()))
    }

    fn status(&self, name: &str, revision: Option<&Revision>) -> Result<Commit> {
        let row = self.read(|chains| chain::locate(chains, &self.name, name, revision))?;
        Ok(row.commit(&self.name))
    }

    fn remove(&self, name: &str, parent: Option<&Revision>) -> Result<Commit> {
        let deadline = self.config.deadline();
        self.write(|chains| chain::remove(chains, &self.name, name, parent, deadline))
    }

    fn history(&self, name: &str) -> Result<Vec<Commit>> {
        let rows = self.read(|chains| chains.rows(name))?;
        history_of(&self.name, name, rows)
    }

    fn checkout_at(&self, name: &str, instant: &DateTime<Utc>) -> Result<(Commit, Mapper)> {
        let row = self.read(|chains| chain::locate_at(chains, &self.name, name, instant))?;
        Ok((row.commit(&self.name), row.mapper()))
    }

    fn names(&self, prefix: &str, limit: Option<usize>) -> Result<Vec<String>> {
        self.read(|chains| chains.live_names(prefix, limit.unwrap_or(usize::MAX)))
    }
}

/// Bucket factory keeping every bucket in memory
#[derive(Debug)]
pub struct MemoryStorage {
    buckets: RwLock<HashMap<BucketName, Arc<MemoryBucket>>>,
    config: Arc<StorageConfig>,
    closed: Arc<AtomicBool>,
}

impl MemoryStorage {
    pub fn new(config: StorageConfig) -> Self {
        MemoryStorage {
            buckets: RwLock::new(HashMap::new()),
            config: Arc::new(config),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GeoStoreError::StorageClosed);
        }
        Ok(())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(StorageConfig::default())
    }
}

impl BucketFactory for MemoryStorage {
    fn create_bucket(
        &self,
        name: &BucketName,
        overwrite: bool,
        options: BucketOptions,
    ) -> Result<Arc<dyn Bucket>> {
        self.ensure_open()?;
        let info = BucketInfo::new(name.clone(), &options, &self.config)?;
        let mut buckets = self.buckets.write().map_err(poisoned)?;

        if let Some(existing) = buckets.get(name) {
            if !overwrite {
                return Err(GeoStoreError::DuplicatedBucket {
                    bucket: name.to_string(),
                });
            }
            existing.reset(info.clone())?;
            info!(bucket = %name, srid = info.srid, overwritten = true, "created bucket");
            return Ok(existing.clone());
        }

        let bucket = Arc::new(MemoryBucket {
            info: RwLock::new(info.clone()),
            name: name.clone(),
            chains: RwLock::new(MemoryChains::default()),
            dropped: AtomicBool::new(false),
            config: self.config.clone(),
            closed: self.closed.clone(),
        });
        buckets.insert(name.clone(), bucket.clone());

        info!(bucket = %name, srid = info.srid, overwritten = false, "created bucket");
        Ok(bucket)
    }

    fn get_bucket(&self, name: &BucketName) -> Result<Arc<dyn Bucket>> {
        self.ensure_open()?;
        let buckets = self.buckets.read().map_err(poisoned)?;
        match buckets.get(name) {
            Some(bucket) => Ok(bucket.clone()),
            None => Err(GeoStoreError::BucketNotFound {
                bucket: name.to_string(),
            }),
        }
    }

    fn has_bucket(&self, name: &BucketName) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.buckets.read().map_err(poisoned)?.contains_key(name))
    }

    fn delete_bucket(&self, name: &BucketName) -> Result<bool> {
        self.ensure_open()?;
        let removed = self.buckets.write().map_err(poisoned)?.remove(name);
        match removed {
            Some(bucket) => {
                bucket.dropped.store(true, Ordering::Release);
                info!(bucket = %name, "deleted bucket");
                Ok(true)
            }
            None => Err(GeoStoreError::BucketNotFound {
                bucket: name.to_string(),
            }),
        }
    }

    fn list_buckets(&self) -> Result<Vec<BucketInfo>> {
        self.ensure_open()?;
        let buckets = self.buckets.read().map_err(poisoned)?;
        let mut infos: Vec<BucketInfo> = buckets.values().map(|b| b.info()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.buckets.write().map_err(poisoned)?.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper(x: i64) -> Mapper {
        let mut properties = JsonObject::new();
        properties.insert("x".to_string(), serde_json::json!(x));
        Mapper::new(properties, JsonObject::new(), "POINT(1 1)", 4326)
    }

    #[test]
    fn test_overwrite_wipes_existing_handles() {
        let storage = MemoryStorage::default();
        let name = BucketName::new("b1").unwrap();
        let bucket = storage.create_bucket(&name, false, BucketOptions::default()).unwrap();
        bucket.commit("alice", &mapper(1), None).unwrap();

        storage
            .create_bucket(&name, true, BucketOptions::default().with_srid(3857))
            .unwrap();

        assert!(bucket.checkout("alice", None).unwrap_err().is_not_found());
        assert_eq!(bucket.info().srid, 3857);
    }

    #[test]
    fn test_deleted_bucket_handle_is_unusable() {
        let storage = MemoryStorage::default();
        let name = BucketName::new("b1").unwrap();
        let bucket = storage.create_bucket(&name, false, BucketOptions::default()).unwrap();
        storage.delete_bucket(&name).unwrap();

        let err = bucket.commit("alice", &mapper(1), None).unwrap_err();
        assert!(matches!(err, GeoStoreError::BucketNotFound { .. }));
    }

    #[test]
    fn test_names_are_sorted_and_limited() {
        let storage = MemoryStorage::default();
        let name = BucketName::new("b1").unwrap();
        let bucket = storage.create_bucket(&name, false, BucketOptions::default()).unwrap();
        for item in ["c", "a", "b", "ab"] {
            bucket.commit(item, &mapper(1), None).unwrap();
        }

        assert_eq!(bucket.names("", None).unwrap(), vec!["a", "ab", "b", "c"]);
        assert_eq!(bucket.names("a", Some(1)).unwrap(), vec!["a"]);
    }

    #[test]
    fn test_close_clears_buckets() {
        let storage = MemoryStorage::default();
        let name = BucketName::new("b1").unwrap();
        let bucket = storage.create_bucket(&name, false, BucketOptions::default()).unwrap();
        storage.close().unwrap();
        storage.close().unwrap();

        assert!(matches!(storage.has_bucket(&name), Err(GeoStoreError::StorageClosed)));
        assert!(matches!(bucket.status("alice", None), Err(GeoStoreError::StorageClosed)));
    }
}

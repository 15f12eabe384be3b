//! Bucket abstraction and its fjall partition backend

use chrono::{DateTime, Utc};
use fjall::{ReadTransaction, TxPartitionHandle, WriteTransaction};
use geostore_core::*;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::chain::{self, ChainReader, ChainWriter, HeadPointer, RevisionRow};
use crate::{BucketInfo, StorageEngine};

/// Versioned key-value store over one collection of named features.
///
/// Every item name owns a linear chain of revisions of which at most one
/// is live. Writes that name a parent revision only succeed while that
/// parent is still the live one.
pub trait Bucket: Send + Sync {
    fn name(&self) -> &BucketName;

    fn info(&self) -> BucketInfo;

    /// Append a new live revision of `name`.
    ///
    /// Fails with `ParentRevisionNotFound` when `parent` is given for an
    /// item without a live revision, and with `NotHeadRevision` when
    /// `parent` is not the live revision.
    fn commit(&self, name: &str, mapper: &Mapper, parent: Option<&Revision>) -> Result<Commit>;

    /// Read the live revision, or a specific one when `revision` is given.
    fn checkout(&self, name: &str, revision: Option<&Revision>) -> Result<(Commit, Mapper)>;

    /// Same lookup as [`Bucket::checkout`] without the feature payload.
    fn status(&self, name: &str, revision: Option<&Revision>) -> Result<Commit>;

    /// Expire the live revision. The returned commit has no revision.
    fn remove(&self, name: &str, parent: Option<&Revision>) -> Result<Commit>;

    /// Every revision of `name`, oldest first.
    fn history(&self, name: &str) -> Result<Vec<Commit>>;

    /// The revision that was live at `instant`.
    fn checkout_at(&self, name: &str, instant: &DateTime<Utc>) -> Result<(Commit, Mapper)>;

    /// Live item names starting with `prefix`, in lexicographic order.
    fn names(&self, prefix: &str, limit: Option<usize>) -> Result<Vec<String>>;

    fn make_random_name(&self) -> String {
        make_random_name()
    }
}

/// Commits of all rows, or `FeatureNotFound` when the chain is empty
pub(crate) fn history_of(
    bucket: &BucketName,
    name: &str,
    rows: Vec<RevisionRow>,
) -> Result<Vec<Commit>> {
    if rows.is_empty() {
        return Err(GeoStoreError::FeatureNotFound {
            key: chain::qualified(bucket, name),
            revision: None,
        });
    }
    Ok(rows.iter().map(|row| row.commit(bucket)).collect())
}

/// Bucket stored in its own fjall partition.
///
/// The partition is looked up by name once the registry confirms the
/// bucket exists, so a handle never recreates a deleted partition.
pub struct FjallBucket {
    info: BucketInfo,
    registry: TxPartitionHandle,
    engine: StorageEngine,
}

impl FjallBucket {
    pub(crate) fn new(
        engine: StorageEngine,
        info: BucketInfo,
        registry: TxPartitionHandle,
    ) -> Self {
        FjallBucket {
            info,
            registry,
            engine,
        }
    }

    fn missing_bucket(&self) -> GeoStoreError {
        GeoStoreError::BucketNotFound {
            bucket: self.info.name.to_string(),
        }
    }

    /// Run `f` against a read snapshot of the partition
    fn read<T>(&self, f: impl FnOnce(&FjallChain<ReadView<'_>>) -> Result<T>) -> Result<T> {
        self.engine.ensure_open()?;
        let tx = self.engine.keyspace().read_tx();

        let registered = tx
            .get(&self.registry, self.info.name.as_str())
            .map_err(keyspace_error)?;
        if registered.is_none() {
            return Err(self.missing_bucket());
        }

        let partition = self.engine.partition(&self.info.name)?;
        let chain = FjallChain {
            kv: ReadView {
                tx: &tx,
                partition: &partition,
            },
        };
        f(&chain)
    }

    /// Run `f` inside one write transaction; commit only if it succeeds
    fn write<T>(
        &self,
        f: impl FnOnce(&mut FjallChain<WriteView<'_, '_>>) -> Result<T>,
    ) -> Result<T> {
        self.engine.ensure_open()?;
        let mut tx = self.engine.keyspace().write_tx();

        let registered = tx
            .get(&self.registry, self.info.name.as_str())
            .map_err(keyspace_error)?;
        if registered.is_none() {
            tx.rollback();
            return Err(self.missing_bucket());
        }

        let partition = match self.engine.partition(&self.info.name) {
            Ok(partition) => partition,
            Err(e) => {
                tx.rollback();
                return Err(e);
            }
        };
        let outcome = {
            let mut chain = FjallChain {
                kv: WriteView {
                    tx: &mut tx,
                    partition: &partition,
                },
            };
            f(&mut chain)
        };

        match outcome {
            Ok(value) => {
                tx.commit().map_err(keyspace_error)?;
                self.engine.persist()?;
                Ok(value)
            }
            Err(e) => {
                tx.rollback();
                Err(e)
            }
        }
    }
}

impl Bucket for FjallBucket {
    fn name(&self) -> &BucketName {
        &self.info.name
    }

    fn info(&self) -> BucketInfo {
        self.info.clone()
    }

    fn commit(&self, name: &str, mapper: &Mapper, parent: Option<&Revision>) -> Result<Commit> {
        let deadline = self.engine.config().deadline();
        self.write(|chain| chain::commit(chain, &self.info.name, name, mapper, parent, deadline))
    }

    fn checkout(&self, name: &str, revision: Option<&Revision>) -> Result<(Commit, Mapper)> {
        debug!(bucket = %self.info.name, name, "checkout");
        let row = self.read(|chain| chain::locate(chain, &self.info.name, name, revision))?;
        Ok((row.commit(&self.info.name), row.mapper()))
    }

    fn status(&self, name: &str, revision: Option<&Revision>) -> Result<Commit> {
        let row = self.read(|chain| chain::locate(chain, &self.info.name, name, revision))?;
        Ok(row.commit(&self.info.name))
    }

    fn remove(&self, name: &str, parent: Option<&Revision>) -> Result<Commit> {
        let deadline = self.engine.config().deadline();
        self.write(|chain| chain::remove(chain, &self.info.name, name, parent, deadline))
    }

    fn history(&self, name: &str) -> Result<Vec<Commit>> {
        let rows = self.read(|chain| chain.rows(name))?;
        history_of(&self.info.name, name, rows)
    }

    fn checkout_at(&self, name: &str, instant: &DateTime<Utc>) -> Result<(Commit, Mapper)> {
        let row = self.read(|chain| chain::locate_at(chain, &self.info.name, name, instant))?;
        Ok((row.commit(&self.info.name), row.mapper()))
    }

    fn names(&self, prefix: &str, limit: Option<usize>) -> Result<Vec<String>> {
        self.read(|chain| chain.live_names(prefix, limit.unwrap_or(usize::MAX)))
    }
}

pub(crate) fn keyspace_error(e: fjall::Error) -> GeoStoreError {
    GeoStoreError::storage("keyspace operation failed", e)
}

// Partition layout:
//   h:{name}            -> HeadPointer of the live row
//   r:{name}/{seq:020}  -> RevisionRow
//   i:{name}/{revision} -> sequence (big endian)

fn head_key(name: &str) -> Vec<u8> {
    format!("h:{}", name).into_bytes()
}

fn row_prefix(name: &str) -> Vec<u8> {
    format!("r:{}/", name).into_bytes()
}

fn row_key(name: &str, sequence: u64) -> Vec<u8> {
    format!("r:{}/{:020}", name, sequence).into_bytes()
}

fn index_key(name: &str, revision: &Revision) -> Vec<u8> {
    format!("i:{}/{}", name, revision).into_bytes()
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Raw key-value access within one transaction
pub(crate) trait KvRead {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn scan(&self, prefix: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    fn last(&self, prefix: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>>;
}

pub(crate) trait KvWrite: KvRead {
    fn insert(&mut self, key: Vec<u8>, value: Vec<u8>);

    fn delete(&mut self, key: Vec<u8>);
}

pub(crate) struct ReadView<'a> {
    tx: &'a ReadTransaction,
    partition: &'a TxPartitionHandle,
}

pub(crate) struct WriteView<'a, 'tx> {
    tx: &'a mut WriteTransaction<'tx>,
    partition: &'a TxPartitionHandle,
}

impl KvRead for ReadView<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = self.tx.get(self.partition, key).map_err(keyspace_error)?;
        Ok(value.map(|v| v.to_vec()))
    }

    fn scan(&self, prefix: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut pairs = Vec::new();
        for item in self.tx.prefix(self.partition, prefix).take(limit) {
            let (key, value) = item.map_err(keyspace_error)?;
            pairs.push((key.to_vec(), value.to_vec()));
        }
        Ok(pairs)
    }

    fn last(&self, prefix: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match self.tx.prefix(self.partition, prefix).next_back() {
            Some(item) => {
                let (key, value) = item.map_err(keyspace_error)?;
                Ok(Some((key.to_vec(), value.to_vec())))
            }
            None => Ok(None),
        }
    }
}

impl KvRead for WriteView<'_, '_> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = self.tx.get(self.partition, key).map_err(keyspace_error)?;
        Ok(value.map(|v| v.to_vec()))
    }

    fn scan(&self, prefix: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut pairs = Vec::new();
        for item in self.tx.prefix(self.partition, prefix).take(limit) {
            let (key, value) = item.map_err(keyspace_error)?;
            pairs.push((key.to_vec(), value.to_vec()));
        }
        Ok(pairs)
    }

    fn last(&self, prefix: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match self.tx.prefix(self.partition, prefix).next_back() {
            Some(item) => {
                let (key, value) = item.map_err(keyspace_error)?;
                Ok(Some((key.to_vec(), value.to_vec())))
            }
            None => Ok(None),
        }
    }
}

impl KvWrite for WriteView<'_, '_> {
    fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.tx.insert(self.partition, key, value);
    }

    fn delete(&mut self, key: Vec<u8>) {
        self.tx.remove(self.partition, key);
    }
}

/// Revision chains encoded in a fjall partition
pub(crate) struct FjallChain<K> {
    kv: K,
}

impl<K: KvRead> ChainReader for FjallChain<K> {
    fn head(&self, name: &str) -> Result<Option<HeadPointer>> {
        match self.kv.get(&head_key(name))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn last_sequence(&self, name: &str) -> Result<Option<u64>> {
        match self.kv.last(&row_prefix(name))? {
            Some((_, bytes)) => {
                let row: RevisionRow = decode(&bytes)?;
                Ok(Some(row.sequence))
            }
            None => Ok(None),
        }
    }

    fn sequence_of(&self, name: &str, revision: &Revision) -> Result<Option<u64>> {
        match self.kv.get(&index_key(name, revision))? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| GeoStoreError::internal("corrupt revision index entry"))?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    fn row(&self, name: &str, sequence: u64) -> Result<Option<RevisionRow>> {
        match self.kv.get(&row_key(name, sequence))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn rows(&self, name: &str) -> Result<Vec<RevisionRow>> {
        self.kv
            .scan(&row_prefix(name), usize::MAX)?
            .iter()
            .map(|(_, bytes)| decode(bytes))
            .collect()
    }

    fn live_names(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        let pairs = self.kv.scan(&head_key(prefix), limit)?;
        let mut names = Vec::with_capacity(pairs.len());
        for (key, _) in pairs {
            if let Ok(key) = std::str::from_utf8(&key) {
                if let Some(name) = key.strip_prefix("h:") {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }
}

impl<K: KvWrite> ChainWriter for FjallChain<K> {
    fn put_row(&mut self, row: &RevisionRow) -> Result<()> {
        let bytes = serde_json::to_vec(row)?;
        self.kv.insert(row_key(&row.name, row.sequence), bytes);
        self.kv.insert(
            index_key(&row.name, &row.revision),
            row.sequence.to_be_bytes().to_vec(),
        );
        Ok(())
    }

    fn set_head(&mut self, name: &str, head: Option<&HeadPointer>) -> Result<()> {
        match head {
            Some(head) => {
                let bytes = serde_json::to_vec(head)?;
                self.kv.insert(head_key(name), bytes);
            }
            None => self.kv.delete(head_key(name)),
        }
        Ok(())
    }
}

/// Remove every key of a partition inside `tx`
pub(crate) fn clear_partition(
    tx: &mut WriteTransaction<'_>,
    partition: &TxPartitionHandle,
) -> Result<usize> {
    let mut keys = Vec::new();
    for item in tx.prefix(partition, b"") {
        let (key, _) = item.map_err(keyspace_error)?;
        keys.push(key.to_vec());
    }

    let count = keys.len();
    for key in keys {
        tx.remove(partition, key);
    }
    Ok(count)
}

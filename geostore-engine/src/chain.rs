//! Revision-chain protocol shared by every backend.
//!
//! A backend exposes its per-bucket state through [`ChainReader`] and
//! [`ChainWriter`]; the functions here implement commit, remove and lookup
//! on top of them. Callers run each function inside one backend
//! transaction so the check-and-append is atomic.

use chrono::{DateTime, Duration, Utc};
use geostore_core::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, warn};

/// One stored revision of an item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionRow {
    pub name: String,
    pub sequence: u64,
    pub revision: Revision,
    pub properties: JsonObject,
    pub metadata: JsonObject,
    pub wkt: String,
    pub srid: i32,
    pub created_at: DateTime<Utc>,
    pub expires_at: ExpiresAt,
}

impl RevisionRow {
    pub fn commit(&self, bucket: &BucketName) -> Commit {
        Commit {
            name: qualified(bucket, &self.name),
            revision: Some(self.revision.clone()),
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }

    pub fn mapper(&self) -> Mapper {
        Mapper::new(
            self.properties.clone(),
            self.metadata.clone(),
            self.wkt.clone(),
            self.srid,
        )
    }

    /// Latest instant this row has been observed at
    fn high_water(&self) -> DateTime<Utc> {
        self.expires_at.timestamp().unwrap_or(self.created_at)
    }
}

/// Pointer to the live row of an item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadPointer {
    pub sequence: u64,
    pub revision: Revision,
}

pub trait ChainReader {
    fn head(&self, name: &str) -> Result<Option<HeadPointer>>;

    /// Sequence number of the newest row, live or not
    fn last_sequence(&self, name: &str) -> Result<Option<u64>>;

    fn sequence_of(&self, name: &str, revision: &Revision) -> Result<Option<u64>>;

    fn row(&self, name: &str, sequence: u64) -> Result<Option<RevisionRow>>;

    /// All rows of an item, oldest first
    fn rows(&self, name: &str) -> Result<Vec<RevisionRow>>;

    /// Names with a live row, sorted, starting with `prefix`
    fn live_names(&self, prefix: &str, limit: usize) -> Result<Vec<String>>;
}

pub trait ChainWriter: ChainReader {
    /// Insert or overwrite a row, keeping the revision index in step
    fn put_row(&mut self, row: &RevisionRow) -> Result<()>;

    fn set_head(&mut self, name: &str, head: Option<&HeadPointer>) -> Result<()>;
}

pub(crate) fn qualified(bucket: &BucketName, name: &str) -> String {
    format!("{}.{}", bucket, name)
}

fn not_found(bucket: &BucketName, name: &str, revision: Option<&Revision>) -> GeoStoreError {
    GeoStoreError::FeatureNotFound {
        key: qualified(bucket, name),
        revision: revision.map(|r| r.to_string()),
    }
}

fn check_deadline(deadline: Option<Instant>, operation: &'static str) -> Result<()> {
    match deadline {
        Some(deadline) if Instant::now() >= deadline => {
            warn!(operation, "deadline exceeded, abandoning transaction");
            Err(GeoStoreError::DeadlineExceeded { operation })
        }
        _ => Ok(()),
    }
}

/// Verify `parent` against the live head, if one was supplied.
fn check_parent(
    bucket: &BucketName,
    name: &str,
    head: Option<&HeadPointer>,
    parent: Option<&Revision>,
) -> Result<()> {
    match (head, parent) {
        (None, Some(parent)) => Err(GeoStoreError::ParentRevisionNotFound {
            key: qualified(bucket, name),
            parent: parent.to_string(),
        }),
        (Some(head), Some(parent)) if head.revision != *parent => {
            warn!(
                bucket = %bucket,
                name,
                parent = %parent,
                head = %head.revision,
                "stale parent revision"
            );
            Err(GeoStoreError::NotHeadRevision {
                key: qualified(bucket, name),
                parent: parent.to_string(),
                head: head.revision.to_string(),
            })
        }
        _ => Ok(()),
    }
}

/// Timestamp strictly after everything already recorded for `name`.
fn next_timestamp<R: ChainReader + ?Sized>(
    chain: &R,
    name: &str,
    last_sequence: Option<u64>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let floor = match last_sequence {
        Some(sequence) => chain.row(name, sequence)?.map(|row| row.high_water()),
        None => None,
    };
    Ok(match floor {
        Some(floor) if now <= floor => floor + Duration::microseconds(1),
        _ => now,
    })
}

fn live_row<R: ChainReader + ?Sized>(
    chain: &R,
    bucket: &BucketName,
    name: &str,
    head: &HeadPointer,
) -> Result<RevisionRow> {
    chain.row(name, head.sequence)?.ok_or_else(|| {
        GeoStoreError::internal(format!(
            "head of {} points at missing row {}",
            qualified(bucket, name),
            head.sequence
        ))
    })
}

/// Append a new live revision, superseding the current one.
pub fn commit<W: ChainWriter + ?Sized>(
    chain: &mut W,
    bucket: &BucketName,
    name: &str,
    mapper: &Mapper,
    parent: Option<&Revision>,
    deadline: Option<Instant>,
) -> Result<Commit> {
    validate_item_name(name)?;

    let head = chain.head(name)?;
    check_parent(bucket, name, head.as_ref(), parent)?;

    let last_sequence = chain.last_sequence(name)?;
    let created_at = next_timestamp(&*chain, name, last_sequence, Utc::now())?;
    let sequence = last_sequence.map_or(1, |s| s + 1);

    let previous = match &head {
        Some(head) => Some(live_row(&*chain, bucket, name, head)?),
        None => None,
    };

    check_deadline(deadline, "commit")?;

    if let Some(mut previous) = previous {
        previous.expires_at = ExpiresAt::At(created_at);
        chain.put_row(&previous)?;
    }

    let row = RevisionRow {
        name: name.to_string(),
        sequence,
        revision: Revision::derive(&qualified(bucket, name), &created_at, sequence),
        properties: mapper.properties.clone(),
        metadata: mapper.metadata.clone(),
        wkt: mapper.wkt.clone(),
        srid: mapper.srid,
        created_at,
        expires_at: ExpiresAt::Infinity,
    };
    chain.put_row(&row)?;
    chain.set_head(
        name,
        Some(&HeadPointer {
            sequence,
            revision: row.revision.clone(),
        }),
    )?;

    debug!(bucket = %bucket, name, revision = %row.revision, sequence, "committed revision");
    Ok(row.commit(bucket))
}

/// Expire the live revision without appending a successor.
pub fn remove<W: ChainWriter + ?Sized>(
    chain: &mut W,
    bucket: &BucketName,
    name: &str,
    parent: Option<&Revision>,
    deadline: Option<Instant>,
) -> Result<Commit> {
    let head = chain
        .head(name)?
        .ok_or_else(|| not_found(bucket, name, None))?;
    check_parent(bucket, name, Some(&head), parent)?;

    let mut row = live_row(&*chain, bucket, name, &head)?;
    let expired_at = next_timestamp(&*chain, name, Some(head.sequence), Utc::now())?;

    check_deadline(deadline, "remove")?;

    row.expires_at = ExpiresAt::At(expired_at);
    chain.put_row(&row)?;
    chain.set_head(name, None)?;

    debug!(bucket = %bucket, name, revision = %row.revision, "removed item");
    Ok(Commit {
        name: qualified(bucket, name),
        revision: None,
        created_at: row.created_at,
        expires_at: row.expires_at,
    })
}

/// Find the live row, or the row carrying `revision`.
pub fn locate<R: ChainReader + ?Sized>(
    chain: &R,
    bucket: &BucketName,
    name: &str,
    revision: Option<&Revision>,
) -> Result<RevisionRow> {
    let sequence = match revision {
        None => chain.head(name)?.map(|head| head.sequence),
        Some(revision) => chain.sequence_of(name, revision)?,
    };

    let sequence = sequence.ok_or_else(|| not_found(bucket, name, revision))?;
    chain
        .row(name, sequence)?
        .ok_or_else(|| not_found(bucket, name, revision))
}

/// Row whose validity window contains `instant`.
pub fn locate_at<R: ChainReader + ?Sized>(
    chain: &R,
    bucket: &BucketName,
    name: &str,
    instant: &DateTime<Utc>,
) -> Result<RevisionRow> {
    chain
        .rows(name)?
        .into_iter()
        .rev()
        .find(|row| row.commit(bucket).is_valid_at(instant))
        .ok_or_else(|| not_found(bucket, name, None))
}

//! Error types for geostore

use thiserror::Error;

/// Boxed cause carried by backend failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum GeoStoreError {
    #[error("Bucket not found: {bucket}")]
    BucketNotFound { bucket: String },

    #[error("Bucket already exists: {bucket}")]
    DuplicatedBucket { bucket: String },

    #[error("Feature not found: {key}{}", revision_suffix(.revision))]
    FeatureNotFound {
        key: String,
        revision: Option<String>,
    },

    #[error("Parent revision {parent} given for {key}, which has no live revision")]
    ParentRevisionNotFound { key: String, parent: String },

    #[error("Revision {parent} is not the head of {key} (head is {head})")]
    NotHeadRevision {
        key: String,
        parent: String,
        head: String,
    },

    #[error("Storage error: {message}")]
    StorageInternal {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Invalid bucket name: {0}")]
    InvalidBucketName(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Unsupported transform from SRID {from} to SRID {to}")]
    UnsupportedTransform { from: i32, to: i32 },

    #[error("Deadline exceeded during {operation}")]
    DeadlineExceeded { operation: &'static str },

    #[error("Storage is closed")]
    StorageClosed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GeoStoreError {
    /// Wrap a backend failure, keeping it as the error source.
    pub fn storage<E>(message: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        GeoStoreError::StorageInternal {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Backend failure with no underlying cause.
    pub fn internal(message: impl Into<String>) -> Self {
        GeoStoreError::StorageInternal {
            message: message.into(),
            source: None,
        }
    }

    /// Bucket or feature lookups that matched nothing.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            GeoStoreError::BucketNotFound { .. } | GeoStoreError::FeatureNotFound { .. }
        )
    }

    /// Optimistic-concurrency and uniqueness violations.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            GeoStoreError::DuplicatedBucket { .. }
                | GeoStoreError::ParentRevisionNotFound { .. }
                | GeoStoreError::NotHeadRevision { .. }
        )
    }

    /// Errors caused by malformed caller input.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            GeoStoreError::InvalidBucketName(_)
                | GeoStoreError::InvalidKey(_)
                | GeoStoreError::InvalidGeometry(_)
                | GeoStoreError::UnsupportedTransform { .. }
        )
    }
}

fn revision_suffix(revision: &Option<String>) -> String {
    match revision {
        Some(rev) => format!(" at revision {}", rev),
        None => String::new(),
    }
}

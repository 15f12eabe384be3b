//! Core data types for geostore

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// JSON object used for feature properties and metadata
pub type JsonObject = serde_json::Map<String, serde_json::Value>;

/// Validated bucket name (`^[A-Za-z][A-Za-z0-9_]+$`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BucketName(String);

impl BucketName {
    /// Create a new bucket name with validation
    pub fn new(name: &str) -> crate::Result<Self> {
        let mut chars = name.chars();
        let first = chars
            .next()
            .ok_or_else(|| crate::GeoStoreError::InvalidBucketName("empty name".to_string()))?;

        if !first.is_ascii_alphabetic() {
            return Err(crate::GeoStoreError::InvalidBucketName(format!(
                "'{}' must start with a letter",
                name
            )));
        }

        if name.len() < 2 {
            return Err(crate::GeoStoreError::InvalidBucketName(format!(
                "'{}' is too short",
                name
            )));
        }

        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(crate::GeoStoreError::InvalidBucketName(format!(
                "invalid characters in '{}'",
                name
            )));
        }

        Ok(BucketName(name.to_string()))
    }

    /// Get the bucket name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for BucketName {
    type Error = crate::GeoStoreError;

    fn try_from(value: String) -> crate::Result<Self> {
        BucketName::new(&value)
    }
}

impl From<BucketName> for String {
    fn from(value: BucketName) -> Self {
        value.0
    }
}

impl fmt::Display for BucketName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Check an item name against `^([A-Za-z0-9_]+\.)*[A-Za-z0-9_]+$`
pub fn validate_item_name(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(crate::GeoStoreError::InvalidKey("empty name".to_string()));
    }

    let valid = name.split('.').all(|segment| {
        !segment.is_empty() && segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    });

    if !valid {
        return Err(crate::GeoStoreError::InvalidKey(format!(
            "invalid item name '{}'",
            name
        )));
    }

    Ok(())
}

/// Generate a collision-resistant item name for anonymous writes
pub fn make_random_name() -> String {
    ulid::Ulid::new().to_string()
}

/// Feature key: a bucket plus an optional item name.
///
/// A key without a name is resolved to a random name on write.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    bucket: BucketName,
    name: Option<String>,
}

impl Key {
    /// Create a key, validating both components
    pub fn new(bucket: &str, name: Option<&str>) -> crate::Result<Self> {
        let bucket = BucketName::new(bucket)?;
        if let Some(name) = name {
            validate_item_name(name)?;
        }
        Ok(Key {
            bucket,
            name: name.map(str::to_string),
        })
    }

    /// Key for an already validated bucket
    pub fn in_bucket(bucket: BucketName, name: Option<&str>) -> crate::Result<Self> {
        if let Some(name) = name {
            validate_item_name(name)?;
        }
        Ok(Key {
            bucket,
            name: name.map(str::to_string),
        })
    }

    /// Parse `bucket.name` (or `bucket.?` for an unnamed key)
    pub fn parse_qualified(qualified: &str) -> crate::Result<Self> {
        let (bucket, name) = qualified.split_once('.').ok_or_else(|| {
            crate::GeoStoreError::InvalidKey(format!("'{}' is not a qualified name", qualified))
        })?;

        match name {
            "?" => Key::new(bucket, None),
            name => Key::new(bucket, Some(name)),
        }
    }

    pub fn bucket(&self) -> &BucketName {
        &self.bucket
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Copy of this key with the item name set
    pub fn with_name(&self, name: &str) -> crate::Result<Self> {
        Key::in_bucket(self.bucket.clone(), Some(name))
    }

    pub fn qualified_name(&self) -> String {
        match &self.name {
            Some(name) => format!("{}.{}", self.bucket, name),
            None => format!("{}.?", self.bucket),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}.{}", self.bucket, name),
            None => write!(f, "{}.?", self.bucket),
        }
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let qualified = String::deserialize(deserializer)?;
        Key::parse_qualified(&qualified).map_err(serde::de::Error::custom)
    }
}

/// Opaque revision identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    /// Wrap a caller-supplied revision string
    pub fn new(revision: &str) -> crate::Result<Self> {
        if revision.is_empty() || revision.chars().any(|c| c.is_control() || c == '/') {
            return Err(crate::GeoStoreError::InvalidKey(format!(
                "invalid revision '{}'",
                revision
            )));
        }
        Ok(Revision(revision.to_string()))
    }

    /// Derive a revision id from the commit identity
    pub fn derive(qualified_name: &str, created_at: &DateTime<Utc>, sequence: u64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(qualified_name.as_bytes());
        hasher.update(&created_at.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
        hasher.update(&sequence.to_le_bytes());
        let hex = hasher.finalize().to_hex();
        Revision(hex.as_str()[..32].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// End of a revision's validity window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiresAt {
    /// The revision is live
    Infinity,
    /// The revision was superseded or deleted at this instant
    At(DateTime<Utc>),
}

impl ExpiresAt {
    pub fn is_infinity(&self) -> bool {
        matches!(self, ExpiresAt::Infinity)
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            ExpiresAt::Infinity => None,
            ExpiresAt::At(ts) => Some(*ts),
        }
    }
}

impl Serialize for ExpiresAt {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ExpiresAt::Infinity => serializer.serialize_str("infinity"),
            ExpiresAt::At(ts) => ts.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ExpiresAt {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw == "infinity" {
            return Ok(ExpiresAt::Infinity);
        }
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ExpiresAt::At(ts.with_timezone(&Utc)))
            .map_err(serde::de::Error::custom)
    }
}

/// Record of one stored revision of a named entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    /// Qualified name (`bucket.name`)
    pub name: String,
    pub revision: Option<Revision>,
    pub created_at: DateTime<Utc>,
    pub expires_at: ExpiresAt,
}

impl Commit {
    pub fn is_live(&self) -> bool {
        self.expires_at.is_infinity()
    }

    /// Whether `instant` falls inside `[created_at, expires_at)`
    pub fn is_valid_at(&self, instant: &DateTime<Utc>) -> bool {
        if *instant < self.created_at {
            return false;
        }
        match self.expires_at {
            ExpiresAt::Infinity => true,
            ExpiresAt::At(expired) => *instant < expired,
        }
    }
}

/// Storage-layer record of a feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapper {
    pub properties: JsonObject,
    pub metadata: JsonObject,
    /// Geometry as WKT
    pub wkt: String,
    pub srid: i32,
}

impl Mapper {
    pub fn new(
        properties: JsonObject,
        metadata: JsonObject,
        wkt: impl Into<String>,
        srid: i32,
    ) -> Self {
        Mapper {
            properties,
            metadata,
            wkt: wkt.into(),
            srid,
        }
    }
}

/// Commit re-keyed for callers of the feature entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub key: Key,
    pub revision: Option<Revision>,
    pub created_at: DateTime<Utc>,
    pub expires_at: ExpiresAt,
}

impl Response {
    /// Parse the commit's qualified name back into a key
    pub fn from_commit(commit: Commit) -> crate::Result<Self> {
        Ok(Response {
            key: Key::parse_qualified(&commit.name)?,
            revision: commit.revision,
            created_at: commit.created_at,
            expires_at: commit.expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_key_qualified_name() {
        let key = Key::new("b1", Some("alice")).unwrap();
        assert_eq!(key.qualified_name(), "b1.alice");

        let unnamed = Key::new("b1", None).unwrap();
        assert_eq!(unnamed.qualified_name(), "b1.?");
        assert_eq!(unnamed.to_string(), "b1.?");

        let dotted = Key::parse_qualified("roads.city.main_st").unwrap();
        assert_eq!(dotted.bucket().as_str(), "roads");
        assert_eq!(dotted.name(), Some("city.main_st"));
        assert_eq!(Key::parse_qualified("b1.?").unwrap(), unnamed);
    }

    #[test]
    fn test_key_validation() {
        assert!(Key::new("b1", Some("a.b.c")).is_ok());
        assert!(Key::new("b1", Some("a..b")).is_err());
        assert!(Key::new("b1", Some(".a")).is_err());
        assert!(Key::new("b1", Some("a-b")).is_err());
        assert!(Key::parse_qualified("nodot").is_err());
    }

    #[test]
    fn test_bucket_name_validation() {
        assert!(BucketName::new("b1").is_ok());
        assert!(BucketName::new("roads_2024").is_ok());

        assert!(BucketName::new("").is_err());
        assert!(BucketName::new("b").is_err());
        assert!(BucketName::new("1bucket").is_err());
        assert!(BucketName::new("bucket-1").is_err());
        assert!(BucketName::new("_bucket").is_err());
    }

    #[test]
    fn test_random_name_is_valid_item_name() {
        let name = make_random_name();
        assert!(validate_item_name(&name).is_ok());
        assert_ne!(name, make_random_name());
    }

    #[test]
    fn test_revision_derivation_is_stable() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let r1 = Revision::derive("b1.alice", &ts, 1);
        assert_eq!(r1, Revision::derive("b1.alice", &ts, 1));
        assert_ne!(r1, Revision::derive("b1.alice", &ts, 2));
        assert_eq!(r1.as_str().len(), 32);
    }

    #[test]
    fn test_expires_at_serde() {
        let json = serde_json::to_string(&ExpiresAt::Infinity).unwrap();
        assert_eq!(json, "\"infinity\"");
        let back: ExpiresAt = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ExpiresAt::Infinity);

        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let json = serde_json::to_string(&ExpiresAt::At(ts)).unwrap();
        let back: ExpiresAt = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ExpiresAt::At(ts));
    }

    #[test]
    fn test_commit_validity_window() {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let expired = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let commit = Commit {
            name: "b1.alice".to_string(),
            revision: None,
            created_at: created,
            expires_at: ExpiresAt::At(expired),
        };
        assert!(commit.is_valid_at(&created));
        assert!(!commit.is_valid_at(&expired));
        assert!(!commit.is_live());
    }
}

//! Feature entry: converts between `Feature` and `Mapper` and applies the
//! bucket/name split of keys on top of one bucket.

use chrono::{DateTime, Utc};
use geostore_core::*;
use std::sync::Arc;
use tracing::debug;

use crate::Bucket;

/// Storage record for a feature.
///
/// Properties are copied verbatim, metadata is flattened to JSON and the
/// geometry is stored as WKT with its SRID.
pub fn make_mapper_from_feature(feature: &Feature) -> Result<Mapper> {
    Ok(Mapper::new(
        feature.properties.clone(),
        feature.metadata.to_json_map()?,
        feature.geometry.to_wkt(),
        feature.crs().srid(),
    ))
}

/// Rebuild a feature from its storage record under `key`.
pub fn make_feature_from_mapper(key: Key, mapper: Mapper) -> Result<Feature> {
    let crs = SpatialReference::new(mapper.srid)?;
    let geometry = Geometry::parse_wkt(&mapper.wkt, crs)?;
    let metadata = if mapper.metadata.is_empty() {
        Metadata::compute(&geometry)
    } else {
        Metadata::from_json_map(&mapper.metadata)?
    };

    Ok(Feature {
        key,
        geometry,
        properties: mapper.properties,
        metadata,
    })
}

/// Accessor for the features of one bucket
#[derive(Clone)]
pub struct FeatureEntry {
    bucket: Arc<dyn Bucket>,
}

impl FeatureEntry {
    pub fn new(bucket: Arc<dyn Bucket>) -> Self {
        FeatureEntry { bucket }
    }

    pub fn bucket(&self) -> &Arc<dyn Bucket> {
        &self.bucket
    }

    fn check_bucket(&self, key: &Key) -> Result<()> {
        if key.bucket() != self.bucket.name() {
            return Err(GeoStoreError::InvalidKey(format!(
                "key {} does not belong to bucket {}",
                key,
                self.bucket.name()
            )));
        }
        Ok(())
    }

    fn item_name<'k>(&self, key: &'k Key) -> Result<&'k str> {
        self.check_bucket(key)?;
        key.name()
            .ok_or_else(|| GeoStoreError::InvalidKey(format!("key {} has no name", key)))
    }

    /// Store `feature` under `key`, conditional on `revision` being the
    /// live revision when given. Unnamed keys get a random name.
    pub fn put_feature(
        &self,
        key: &Key,
        feature: &Feature,
        revision: Option<&Revision>,
    ) -> Result<Response> {
        self.check_bucket(key)?;
        let key = match key.name() {
            Some(_) => key.clone(),
            None => key.with_name(&self.bucket.make_random_name())?,
        };
        let name = key.name().unwrap_or_default();

        let mapper = make_mapper_from_feature(feature)?;
        let commit = self.bucket.commit(name, &mapper, revision)?;
        debug!(key = %key, revision = ?commit.revision, "put feature");
        Response::from_commit(commit)
    }

    pub fn get_feature(
        &self,
        key: &Key,
        revision: Option<&Revision>,
    ) -> Result<(Response, Feature)> {
        let name = self.item_name(key)?;
        let (commit, mapper) = self.bucket.checkout(name, revision)?;
        let feature = make_feature_from_mapper(key.clone(), mapper)?;
        Ok((Response::from_commit(commit)?, feature))
    }

    /// Feature as it was at `instant`
    pub fn get_feature_at(
        &self,
        key: &Key,
        instant: &DateTime<Utc>,
    ) -> Result<(Response, Feature)> {
        let name = self.item_name(key)?;
        let (commit, mapper) = self.bucket.checkout_at(name, instant)?;
        let feature = make_feature_from_mapper(key.clone(), mapper)?;
        Ok((Response::from_commit(commit)?, feature))
    }

    pub fn delete_feature(&self, key: &Key, revision: Option<&Revision>) -> Result<Response> {
        let name = self.item_name(key)?;
        let commit = self.bucket.remove(name, revision)?;
        debug!(key = %key, "deleted feature");
        Response::from_commit(commit)
    }

    /// Live (or given) revision of `key` without loading the feature
    pub fn head(&self, key: &Key, revision: Option<&Revision>) -> Result<Response> {
        let name = self.item_name(key)?;
        Response::from_commit(self.bucket.status(name, revision)?)
    }

    pub fn history(&self, key: &Key) -> Result<Vec<Response>> {
        let name = self.item_name(key)?;
        self.bucket
            .history(name)?
            .into_iter()
            .map(Response::from_commit)
            .collect()
    }
}

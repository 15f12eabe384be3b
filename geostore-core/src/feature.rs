//! Domain feature model and the spatial metadata computed from geometry

use serde::{Deserialize, Serialize};

use crate::geometry::{Geometry, SpatialReference};
use crate::{GeoStoreError, JsonObject, Key, Result};

/// Precision used for the geohash of a bounding box corner
pub const GEOHASH_PRECISION: usize = 12;

/// Spatial metadata derived from a feature's geometry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// `[minx, miny, maxx, maxy]`, absent for empty geometries
    pub bbox: Option<[f64; 4]>,
    /// Smallest geohash cell covering the bbox; empty unless lon/lat
    pub geohash: String,
}

impl Metadata {
    pub fn compute(geometry: &Geometry) -> Self {
        let bbox = geometry.bounding_box();
        let geohash = match bbox {
            Some(bbox) if geometry.crs().is_geographic() => covering_geohash(bbox),
            _ => String::new(),
        };
        Metadata { bbox, geohash }
    }

    /// Flatten into a JSON object for storage
    pub fn to_json_map(&self) -> Result<JsonObject> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(map),
            _ => Err(GeoStoreError::internal("metadata did not serialize to an object")),
        }
    }

    pub fn from_json_map(map: &JsonObject) -> Result<Self> {
        Ok(serde_json::from_value(serde_json::Value::Object(map.clone()))?)
    }
}

/// Longest common prefix of the geohashes of the bbox corners.
fn covering_geohash(bbox: [f64; 4]) -> String {
    let [minx, miny, maxx, maxy] = bbox;
    let low = geohash::encode(geo::Coord { x: minx, y: miny }, GEOHASH_PRECISION);
    let high = geohash::encode(geo::Coord { x: maxx, y: maxy }, GEOHASH_PRECISION);

    match (low, high) {
        (Ok(low), Ok(high)) => low
            .chars()
            .zip(high.chars())
            .take_while(|(a, b)| a == b)
            .map(|(a, _)| a)
            .collect(),
        _ => String::new(),
    }
}

/// A keyed geographic feature
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub key: Key,
    pub geometry: Geometry,
    pub properties: JsonObject,
    pub metadata: Metadata,
}

impl Feature {
    pub fn new(key: Key, geometry: Geometry, properties: JsonObject) -> Self {
        let metadata = Metadata::compute(&geometry);
        Feature {
            key,
            geometry,
            properties,
            metadata,
        }
    }

    /// Build from raw geometry input (WKT, EWKT or GeoJSON geometry)
    pub fn from_geometry_input(
        key: Key,
        input: &str,
        srid: Option<i32>,
        properties: JsonObject,
    ) -> Result<Self> {
        let geometry = Geometry::parse(input, srid)?;
        Ok(Feature::new(key, geometry, properties))
    }

    /// Build from a GeoJSON `Feature` document
    pub fn from_geojson(key: Key, document: &str, srid: Option<i32>) -> Result<Self> {
        let doc: geojson::GeoJson = document
            .parse()
            .map_err(|e| GeoStoreError::InvalidGeometry(format!("GeoJSON: {}", e)))?;

        let feature = match doc {
            geojson::GeoJson::Feature(feature) => feature,
            _ => {
                return Err(GeoStoreError::InvalidGeometry(
                    "expected a GeoJSON Feature document".to_string(),
                ))
            }
        };

        let crs = match srid {
            Some(srid) => SpatialReference::new(srid)?,
            None => SpatialReference::wgs84(),
        };
        let geometry = feature.geometry.ok_or_else(|| {
            GeoStoreError::InvalidGeometry("GeoJSON feature has no geometry".to_string())
        })?;
        let geometry = Geometry::from_geojson_geometry(geometry, crs)?;

        Ok(Feature::new(key, geometry, feature.properties.unwrap_or_default()))
    }

    pub fn crs(&self) -> SpatialReference {
        self.geometry.crs()
    }

    /// Render as a GeoJSON `Feature` value
    pub fn to_geojson(&self) -> Result<serde_json::Value> {
        let mut foreign = JsonObject::new();
        foreign.insert("srid".to_string(), serde_json::json!(self.crs().srid()));
        foreign.insert("geohash".to_string(), serde_json::json!(self.metadata.geohash));

        let feature = geojson::Feature {
            bbox: self.metadata.bbox.map(|b| b.to_vec()),
            geometry: Some(self.geometry.to_geojson()),
            id: self.key.name().map(|_| geojson::feature::Id::String(self.key.qualified_name())),
            properties: Some(self.properties.clone()),
            foreign_members: Some(foreign),
        };
        Ok(serde_json::to_value(feature)?)
    }
}

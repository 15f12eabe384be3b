//! Geometry collaborator: parsing, serialization, bounding boxes and
//! reprojection between the references the store understands.
//!
//! The wrapped `geo` value is paired with its spatial reference instead of
//! extending the third-party geometry types.

use geo::{BoundingRect, Coord, CoordsIter, MapCoords};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use wkt::{ToWkt, TryFromWkt};

use crate::{GeoStoreError, Result};

/// EPSG code for WGS84 longitude/latitude
pub const WGS84: i32 = 4326;

/// EPSG code for spherical Web Mercator
pub const WEB_MERCATOR: i32 = 3857;

/// Latitude limit of the Web Mercator projection
pub const MAX_MERCATOR_LAT: f64 = 85.051_128_78;

const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Longitude/latitude based references
const GEOGRAPHIC_SRIDS: &[i32] = &[4326, 4269, 4258, 4019];

/// Spatial reference identified by SRID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpatialReference {
    srid: i32,
}

impl SpatialReference {
    pub fn new(srid: i32) -> Result<Self> {
        if srid <= 0 {
            return Err(GeoStoreError::InvalidGeometry(format!(
                "invalid srid {}",
                srid
            )));
        }
        Ok(SpatialReference { srid })
    }

    pub fn wgs84() -> Self {
        SpatialReference { srid: WGS84 }
    }

    pub fn srid(&self) -> i32 {
        self.srid
    }

    /// Whether coordinates are longitude/latitude degrees
    pub fn is_geographic(&self) -> bool {
        GEOGRAPHIC_SRIDS.contains(&self.srid)
    }
}

impl Default for SpatialReference {
    fn default() -> Self {
        Self::wgs84()
    }
}

/// A geometry value with exactly one spatial reference
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    shape: geo::Geometry<f64>,
    crs: SpatialReference,
}

impl Geometry {
    /// Wrap a geometry, rejecting non-finite coordinates
    pub fn new(shape: geo::Geometry<f64>, crs: SpatialReference) -> Result<Self> {
        if !shape.coords_iter().all(|c| c.x.is_finite() && c.y.is_finite()) {
            return Err(GeoStoreError::InvalidGeometry(
                "coordinates must be finite".to_string(),
            ));
        }
        Ok(Geometry { shape, crs })
    }

    /// Parse WKT, EWKT (`SRID=n;...`) or GeoJSON text.
    ///
    /// `srid` applies when the input carries no reference of its own and
    /// defaults to WGS84.
    pub fn parse(input: &str, srid: Option<i32>) -> Result<Self> {
        let input = input.trim();
        let default_crs = match srid {
            Some(srid) => SpatialReference::new(srid)?,
            None => SpatialReference::wgs84(),
        };

        if input.starts_with('{') {
            return Self::parse_geojson(input, default_crs);
        }

        if let Some((prefix, body)) = split_ewkt(input) {
            let srid = prefix.trim().parse::<i32>().map_err(|_| {
                GeoStoreError::InvalidGeometry(format!("invalid EWKT srid '{}'", prefix))
            })?;
            return Self::parse_wkt(body, SpatialReference::new(srid)?);
        }

        Self::parse_wkt(input, default_crs)
    }

    pub fn parse_wkt(input: &str, crs: SpatialReference) -> Result<Self> {
        let shape = geo::Geometry::<f64>::try_from_wkt_str(input)
            .map_err(|e| GeoStoreError::InvalidGeometry(format!("WKT: {}", e)))?;
        Self::new(shape, crs)
    }

    fn parse_geojson(input: &str, crs: SpatialReference) -> Result<Self> {
        let doc: geojson::GeoJson = input
            .parse()
            .map_err(|e| GeoStoreError::InvalidGeometry(format!("GeoJSON: {}", e)))?;

        let geometry = match doc {
            geojson::GeoJson::Geometry(geometry) => geometry,
            geojson::GeoJson::Feature(feature) => feature.geometry.ok_or_else(|| {
                GeoStoreError::InvalidGeometry("GeoJSON feature has no geometry".to_string())
            })?,
            geojson::GeoJson::FeatureCollection(_) => {
                return Err(GeoStoreError::InvalidGeometry(
                    "expected a single geometry, got a FeatureCollection".to_string(),
                ))
            }
        };

        Self::from_geojson_geometry(geometry, crs)
    }

    pub fn from_geojson_geometry(
        geometry: geojson::Geometry,
        crs: SpatialReference,
    ) -> Result<Self> {
        let shape = geo::Geometry::<f64>::try_from(geometry)
            .map_err(|e| GeoStoreError::InvalidGeometry(format!("GeoJSON: {}", e)))?;
        Self::new(shape, crs)
    }

    pub fn shape(&self) -> &geo::Geometry<f64> {
        &self.shape
    }

    pub fn crs(&self) -> SpatialReference {
        self.crs
    }

    pub fn srid(&self) -> i32 {
        self.crs.srid
    }

    pub fn to_wkt(&self) -> String {
        self.shape.wkt_string()
    }

    pub fn to_geojson(&self) -> geojson::Geometry {
        geojson::Geometry::new(geojson::Value::from(&self.shape))
    }

    /// `[minx, miny, maxx, maxy]`, or `None` for an empty geometry
    pub fn bounding_box(&self) -> Option<[f64; 4]> {
        self.shape
            .bounding_rect()
            .map(|rect| [rect.min().x, rect.min().y, rect.max().x, rect.max().y])
    }

    pub fn is_empty(&self) -> bool {
        self.shape.coords_iter().next().is_none()
    }

    /// Reproject into `to`. Only identity and WGS84 <-> Web Mercator are known.
    pub fn transform(&self, to: SpatialReference) -> Result<Self> {
        let shape = match (self.crs.srid, to.srid) {
            (from, to) if from == to => self.shape.clone(),
            (WGS84, WEB_MERCATOR) => self.shape.map_coords(lon_lat_to_mercator),
            (WEB_MERCATOR, WGS84) => self.shape.map_coords(mercator_to_lon_lat),
            (from, to) => return Err(GeoStoreError::UnsupportedTransform { from, to }),
        };
        Self::new(shape, to)
    }
}

fn split_ewkt(input: &str) -> Option<(&str, &str)> {
    let head = input.get(..5)?;
    if !head.eq_ignore_ascii_case("SRID=") {
        return None;
    }
    input[5..].split_once(';')
}

fn lon_lat_to_mercator(c: Coord<f64>) -> Coord<f64> {
    let lat = c.y.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
    Coord {
        x: c.x.to_radians() * EARTH_RADIUS_M,
        y: (PI / 4.0 + lat.to_radians() / 2.0).tan().ln() * EARTH_RADIUS_M,
    }
}

fn mercator_to_lon_lat(c: Coord<f64>) -> Coord<f64> {
    Coord {
        x: (c.x / EARTH_RADIUS_M).to_degrees(),
        y: (2.0 * (c.y / EARTH_RADIUS_M).exp().atan() - PI / 2.0).to_degrees(),
    }
}

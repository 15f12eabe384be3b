//! Core data models and types for geostore

pub mod error;
pub mod feature;
pub mod geometry;
pub mod types;

pub use error::*;
pub use feature::*;
pub use geometry::{Geometry, SpatialReference, WEB_MERCATOR, WGS84};
pub use types::*;

/// Result type alias for geostore operations
pub type Result<T> = std::result::Result<T, GeoStoreError>;

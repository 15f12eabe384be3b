//! HTTP front end for the geostore feature store

pub mod config;
pub mod handlers;
pub mod server;

pub use config::{LogFormat, ServerConfig};
pub use server::GeoStoreServer;

//! Command line and environment configuration

use anyhow::{anyhow, Context};
use clap::{Arg, ArgMatches, Command};
use geostore_engine::{Backend, StorageConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub data_dir: PathBuf,
    pub bind: SocketAddr,
    pub backend: Backend,
    pub log_format: LogFormat,
    pub operation_timeout: Option<Duration>,
    pub default_srid: i32,
}

impl ServerConfig {
    pub fn command() -> Command {
        Command::new("geostore-server")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Versioned geographic feature store")
            .arg(
                Arg::new("data-dir")
                    .long("data-dir")
                    .value_name("PATH")
                    .env("GEOSTORE_DATA_DIR")
                    .help("Data directory path")
                    .default_value("./data"),
            )
            .arg(
                Arg::new("bind")
                    .long("bind")
                    .value_name("ADDR")
                    .env("GEOSTORE_BIND")
                    .help("Bind address")
                    .default_value("127.0.0.1:8080"),
            )
            .arg(
                Arg::new("backend")
                    .long("backend")
                    .value_name("BACKEND")
                    .env("GEOSTORE_BACKEND")
                    .help("Storage backend")
                    .value_parser(["fjall", "memory"])
                    .default_value("fjall"),
            )
            .arg(
                Arg::new("log-format")
                    .long("log-format")
                    .value_name("FORMAT")
                    .env("GEOSTORE_LOG_FORMAT")
                    .help("Log output format")
                    .value_parser(["text", "json"])
                    .default_value("text"),
            )
            .arg(
                Arg::new("op-timeout-ms")
                    .long("op-timeout-ms")
                    .value_name("MS")
                    .env("GEOSTORE_OP_TIMEOUT_MS")
                    .help("Deadline for a single storage operation, unbounded when unset")
                    .value_parser(clap::value_parser!(u64)),
            )
            .arg(
                Arg::new("default-srid")
                    .long("default-srid")
                    .value_name("SRID")
                    .env("GEOSTORE_DEFAULT_SRID")
                    .help("SRID for buckets created without one")
                    .value_parser(clap::value_parser!(i32))
                    .default_value("4326"),
            )
    }

    pub fn from_args() -> anyhow::Result<Self> {
        Self::from_matches(&Self::command().get_matches())
    }

    pub fn from_matches(matches: &ArgMatches) -> anyhow::Result<Self> {
        let data_dir = PathBuf::from(required(matches, "data-dir")?);
        let bind = required(matches, "bind")?
            .parse()
            .context("invalid bind address")?;
        let backend = required(matches, "backend")?.parse()?;
        let log_format = match required(matches, "log-format")?.as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };
        let operation_timeout = matches
            .get_one::<u64>("op-timeout-ms")
            .map(|ms| Duration::from_millis(*ms));
        let default_srid = matches
            .get_one::<i32>("default-srid")
            .copied()
            .ok_or_else(|| anyhow!("missing --default-srid"))?;

        Ok(ServerConfig {
            data_dir,
            bind,
            backend,
            log_format,
            operation_timeout,
            default_srid,
        })
    }

    pub fn storage_config(&self) -> StorageConfig {
        let config = StorageConfig::new(&self.data_dir).with_default_srid(self.default_srid);
        match self.operation_timeout {
            Some(timeout) => config.with_operation_timeout(timeout),
            None => config,
        }
    }
}

fn required(matches: &ArgMatches, id: &str) -> anyhow::Result<String> {
    matches
        .get_one::<String>(id)
        .cloned()
        .ok_or_else(|| anyhow!("missing --{}", id))
}

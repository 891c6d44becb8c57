use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::{filter::LevelFilter, prelude::*, Registry};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TraceConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            level: default_level(),
            format: String::new(),
            file: None,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid log level: {0}")]
    InvalidLevel(String),

    #[error("Failed to open log file: {0}")]
    File(#[source] std::io::Error),

    #[error("Failed to install subscriber: {0}")]
    Init(#[source] tracing_subscriber::util::TryInitError),
}

pub fn prepare_tracing(conf: TraceConfig) -> Result<(), Error> {
    let level =
        LevelFilter::from_str(&conf.level).map_err(|_| Error::InvalidLevel(conf.level.clone()))?;
    let json = conf.format == "json";

    if let Some(path) = conf.file {
        let file = std::fs::File::create(path).map_err(Error::File)?;
        if json {
            Registry::default()
                .with(
                    tracing_subscriber::fmt::Layer::new()
                        .with_writer(file)
                        .json()
                        .with_filter(level),
                )
                .try_init()
                .map_err(Error::Init)
        } else {
            Registry::default()
                .with(
                    tracing_subscriber::fmt::Layer::new()
                        .with_writer(file)
                        .with_ansi(false)
                        .with_filter(level),
                )
                .try_init()
                .map_err(Error::Init)
        }
    } else if json {
        Registry::default()
            .with(
                tracing_subscriber::fmt::Layer::new()
                    .with_ansi(true)
                    .json()
                    .with_filter(level),
            )
            .try_init()
            .map_err(Error::Init)
    } else {
        Registry::default()
            .with(
                tracing_subscriber::fmt::Layer::new()
                    .with_ansi(true)
                    .with_filter(level),
            )
            .try_init()
            .map_err(Error::Init)
    }
}

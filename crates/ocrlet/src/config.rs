//! Environment-driven configuration.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use crate::broadcast::{DEFAULT_RETENTION, DEFAULT_SUBSCRIBER_BUFFER};

#[derive(Debug, thiserror::Error)]
#[error("invalid value for {key}: {value:?}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
}

/// Runtime configuration, read from `OCRLET_*` environment variables with
/// working defaults for a local deployment.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    /// Directory for durable job records.
    pub data_dir: PathBuf,
    /// Directory under which per-job result directories are created.
    pub results_dir: PathBuf,
    pub worker_slots: usize,
    pub queue_capacity: usize,
    /// Log lines retained per job for late subscribers.
    pub log_retention: usize,
    pub log_buffer: usize,
    pub python_bin: PathBuf,
    pub pdf_script: PathBuf,
    pub image_script: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8000,
            data_dir: PathBuf::from("data/jobs"),
            results_dir: PathBuf::from("data/results"),
            worker_slots: 1,
            queue_capacity: 256,
            log_retention: DEFAULT_RETENTION,
            log_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            python_bin: PathBuf::from("python3"),
            pdf_script: PathBuf::from("run_dpsk_ocr_pdf.py"),
            image_script: PathBuf::from("run_dpsk_ocr_image.py"),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key-value lookup. `from_env` is this over
    /// `std::env::var`; tests pass a closure over a map.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("OCRLET_HOST") {
            config.host = parse("OCRLET_HOST", &v)?;
        }
        if let Some(v) = lookup("OCRLET_PORT") {
            config.port = parse("OCRLET_PORT", &v)?;
        }
        if let Some(v) = lookup("OCRLET_DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("OCRLET_RESULTS_DIR") {
            config.results_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("OCRLET_WORKER_SLOTS") {
            config.worker_slots = parse_nonzero("OCRLET_WORKER_SLOTS", &v)?;
        }
        if let Some(v) = lookup("OCRLET_QUEUE_CAPACITY") {
            config.queue_capacity = parse_nonzero("OCRLET_QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("OCRLET_LOG_RETENTION") {
            config.log_retention = parse_nonzero("OCRLET_LOG_RETENTION", &v)?;
        }
        if let Some(v) = lookup("OCRLET_LOG_BUFFER") {
            config.log_buffer = parse_nonzero("OCRLET_LOG_BUFFER", &v)?;
        }
        if let Some(v) = lookup("OCRLET_PYTHON_BIN") {
            config.python_bin = PathBuf::from(v);
        }
        if let Some(v) = lookup("OCRLET_PDF_SCRIPT") {
            config.pdf_script = PathBuf::from(v);
        }
        if let Some(v) = lookup("OCRLET_IMAGE_SCRIPT") {
            config.image_script = PathBuf::from(v);
        }

        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError {
        key,
        value: value.to_string(),
    })
}

fn parse_nonzero(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    match parse::<usize>(key, value)? {
        0 => Err(ConfigError {
            key,
            value: value.to_string(),
        }),
        n => Ok(n),
    }
}

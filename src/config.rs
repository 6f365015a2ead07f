//! Runtime configuration, read from `PDF_LOGO_*` environment variables.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

const DEFAULT_BIND: &str = "0.0.0.0:8000";
const DEFAULT_TEMP_DIR: &str = "./temp";
const DEFAULT_IMAGES_DIR: &str = "./../M-factuur/src/assets/images";
const DEFAULT_URL_PREFIX: &str = "/images";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// Uploaded PDFs are staged here. Must already exist.
    pub temp_dir: PathBuf,
    /// Extracted PNGs land here; a front-end serves it under `url_prefix`.
    pub images_dir: PathBuf,
    pub url_prefix: String,
    /// Leave the staged PDF on disk when extraction fails.
    pub keep_failed_uploads: bool,
    /// 0 means unlimited.
    pub max_upload_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            temp_dir: PathBuf::from(DEFAULT_TEMP_DIR),
            images_dir: PathBuf::from(DEFAULT_IMAGES_DIR),
            url_prefix: DEFAULT_URL_PREFIX.to_string(),
            keep_failed_uploads: false,
            max_upload_bytes: 0,
        }
    }
}

impl Config {
    /// Read `PDF_LOGO_*` variables. Load `.env` beforehand if wanted.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let bind_addr = match lookup("PDF_LOGO_BIND") {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!("invalid PDF_LOGO_BIND {:?}, using {}", raw, DEFAULT_BIND);
                defaults.bind_addr
            }),
            None => defaults.bind_addr,
        };

        let max_upload_bytes = match lookup("PDF_LOGO_MAX_UPLOAD_BYTES") {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!("invalid PDF_LOGO_MAX_UPLOAD_BYTES {:?}, upload size unlimited", raw);
                0
            }),
            None => defaults.max_upload_bytes,
        };

        Config {
            bind_addr,
            temp_dir: lookup("PDF_LOGO_TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.temp_dir),
            images_dir: lookup("PDF_LOGO_IMAGES_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.images_dir),
            url_prefix: lookup("PDF_LOGO_URL_PREFIX")
                .map(|p| p.trim_end_matches('/').to_string())
                .unwrap_or(defaults.url_prefix),
            keep_failed_uploads: lookup("PDF_LOGO_KEEP_FAILED_UPLOADS")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.keep_failed_uploads),
            max_upload_bytes,
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

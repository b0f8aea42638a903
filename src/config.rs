//! Backend configuration resolved from the environment.
//!
//! A `.env` file in the working directory is honoured (via `dotenvy`), then:
//!
//! | variable                    | default                          |
//! |-----------------------------|----------------------------------|
//! | `PROPHET_MODEL_DIR_PATH`    | `$HOME/.prophet`                 |
//! | `PROPHET_STAN_RESOURCE_DIR` | `<crate>/stan_model`             |
//! | `HTTPSTAN_URL`              | `http://127.0.0.1:8080`          |
//! | `PROPHET_AUTO_DOWNLOAD`     | on (`0`/`false`/`no` disable it) |

use std::path::PathBuf;

pub const MODEL_DIR_ENV: &str = "PROPHET_MODEL_DIR_PATH";
pub const RESOURCE_DIR_ENV: &str = "PROPHET_STAN_RESOURCE_DIR";
pub const HTTPSTAN_URL_ENV: &str = "HTTPSTAN_URL";
pub const AUTO_DOWNLOAD_ENV: &str = "PROPHET_AUTO_DOWNLOAD";

pub const DEFAULT_HTTPSTAN_URL: &str = "http://127.0.0.1:8080";

/// Where each backend finds its model and engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// Directory holding the compiled CmdStan model and its shared libraries.
    pub model_dir: PathBuf,
    /// Packaged resources (the Stan program posted to httpstan).
    pub resource_dir: PathBuf,
    /// Base URL of the httpstan service.
    pub httpstan_url: String,
    /// Fetch missing CmdStan artifacts while loading the model.
    pub auto_download: bool,
}

impl BackendConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve the configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let model_dir = lookup(MODEL_DIR_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| default_model_dir(&lookup));

        let resource_dir = lookup(RESOURCE_DIR_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_resource_dir);

        let httpstan_url = lookup(HTTPSTAN_URL_ENV)
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_HTTPSTAN_URL.to_string());

        let auto_download = lookup(AUTO_DOWNLOAD_ENV)
            .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"))
            .unwrap_or(true);

        Self {
            model_dir,
            resource_dir,
            httpstan_url,
            auto_download,
        }
    }
}

fn default_model_dir(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    let home = lookup("HOME")
        .or_else(|| lookup("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(".prophet")
}

fn default_resource_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("stan_model")
}

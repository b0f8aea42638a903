//! Download of the precompiled CmdStan model.
//!
//! Only a Linux x86_64 build is published. The download is idempotent: files
//! already present in the model directory are left alone.

use std::fs::{File, create_dir_all};
use std::path::Path;

use log::{info, warn};
use reqwest::blocking::Client;

use crate::error::BackendError;

/// Files to fetch, as `(file name, url)`.
pub const MODEL_FILES: [(&str, &str); 2] = [
    (
        "libtbb.so.2",
        "https://github.com/lucidfrontier45/prophet-nogpl/releases/download/1.0.0/libtbb.so.2",
    ),
    (
        "prophet_model.bin",
        "https://github.com/lucidfrontier45/prophet-nogpl/releases/download/1.0.0/prophet_model.bin",
    ),
];

/// Whether a prebuilt binary exists for `(os, arch)`.
pub fn is_supported_platform(os: &str, arch: &str) -> bool {
    os == "linux" && arch == "x86_64"
}

/// Fetch any missing model files into `model_dir`.
///
/// On unsupported platforms this warns and does nothing; the model binary has
/// to be provided by other means.
pub fn download_model_files(model_dir: &Path) -> Result<(), BackendError> {
    if !is_supported_platform(std::env::consts::OS, std::env::consts::ARCH) {
        warn!("only Linux x86_64 binary can be downloaded");
        warn!("please prepare compiled stan model binary by yourself");
        return Ok(());
    }

    let pending = missing_files(model_dir);
    if pending.is_empty() {
        return Ok(());
    }

    create_dir_all(model_dir).map_err(|e| {
        BackendError::Download(format!("Failed to create model dir '{}': {e}", model_dir.display()))
    })?;

    let client = Client::new();
    for (file_name, url) in pending {
        info!("downloading {file_name}");
        fetch(&client, url, &model_dir.join(file_name))?;
    }
    Ok(())
}

/// Model files not yet present in `model_dir`.
pub fn missing_files(model_dir: &Path) -> Vec<(&'static str, &'static str)> {
    MODEL_FILES
        .iter()
        .filter(|(name, _)| !model_dir.join(name).exists())
        .copied()
        .collect()
}

fn fetch(client: &Client, url: &str, target: &Path) -> Result<(), BackendError> {
    let mut resp = client
        .get(url)
        .send()
        .map_err(|e| BackendError::Download(format!("request for {url} failed: {e}")))?;

    if !resp.status().is_success() {
        return Err(BackendError::Download(format!(
            "request for {url} failed with status {}.",
            resp.status()
        )));
    }

    // Partial downloads never sit at the target path.
    let partial = target.with_extension("part");
    let mut file = File::create(&partial)
        .map_err(|e| BackendError::Download(format!("Failed to create '{}': {e}", partial.display())))?;
    resp.copy_to(&mut file)
        .map_err(|e| BackendError::Download(format!("Failed to write '{}': {e}", partial.display())))?;
    drop(file);

    make_executable(&partial)?;
    std::fs::rename(&partial, target)
        .map_err(|e| BackendError::Download(format!("Failed to move '{}': {e}", target.display())))?;
    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), BackendError> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .map_err(|e| BackendError::Download(format!("Failed to chmod '{}': {e}", path.display())))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), BackendError> {
    Ok(())
}

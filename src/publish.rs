//! Atomic publication of certificate files to the serving directory
//!
//! The HTTPS server hot-reloads certificate files from a directory. Writes
//! go to a temporary file in the same directory, are fsynced, then renamed
//! over the target, so a concurrent reader sees either the previous
//! complete contents or the new complete contents - never a partial write.
//!
//! Three files are published per refresh: the serving certificate, the
//! serving key and the CA certificate. The CA private key lives only in the
//! secret and is never written to disk.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::{Error, Result};

/// Directory mode for the certificate directory
const DIR_MODE: u32 = 0o700;

/// File mode for published certificate and key files
const FILE_MODE: u32 = 0o600;

/// Write `payload` to `<dir>/<filename>` atomically.
///
/// Creates `dir` (and missing parents) with mode 0700 on first use. Returns
/// `Ok(false)` without touching the file when it already holds exactly
/// `payload`, so an idempotent reconcile produces no filesystem churn.
pub async fn publish_file(dir: &Path, filename: &str, payload: &[u8]) -> Result<bool> {
    ensure_dir(dir).await?;

    let target = dir.join(filename);
    if let Ok(existing) = fs::read(&target).await {
        if existing == payload {
            debug!(path = %target.display(), "published file already current");
            return Ok(false);
        }
    }

    let tmp = dir.join(format!(".{filename}.tmp"));
    write_sync(&tmp, payload).await?;
    fs::rename(&tmp, &target)
        .await
        .map_err(|source| publish_err(&target, source))?;

    info!(path = %target.display(), "certificate file written");
    Ok(true)
}

async fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .map_err(|source| publish_err(dir, source))?;
    fs::set_permissions(dir, std::fs::Permissions::from_mode(DIR_MODE))
        .await
        .map_err(|source| publish_err(dir, source))
}

async fn write_sync(tmp: &Path, payload: &[u8]) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(FILE_MODE)
        .open(tmp)
        .await
        .map_err(|source| publish_err(tmp, source))?;
    file.write_all(payload)
        .await
        .map_err(|source| publish_err(tmp, source))?;
    // durability before the rename makes the swap atomic on crash too
    file.sync_all()
        .await
        .map_err(|source| publish_err(tmp, source))
}

fn publish_err(path: &Path, source: std::io::Error) -> Error {
    Error::Publish {
        path: PathBuf::from(path),
        source,
    }
}

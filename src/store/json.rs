//! JSON snapshot file for [`super::SnapshotStore`].
//!
//! The whole store is serialized on every write. The file is replaced via a
//! sibling temp file and a rename, so readers never observe a half-written
//! snapshot.

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, error, instrument};

use super::Snapshot;
use crate::error::StoreError;

/// Read a snapshot; a missing file is an empty store.
pub async fn load_snapshot(path: &Path) -> Result<Snapshot, StoreError> {
    match fs::read(path).await {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Snapshot::default()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Snapshot::default()),
        Err(e) => Err(e.into()),
    }
}

/// Atomically replace the snapshot at `path`.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn write_snapshot(snapshot: &Snapshot, path: &Path) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(snapshot)?;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        if let Err(e) = fs::create_dir_all(dir).await {
            error!(dir = %dir.display(), error = %e, "Failed to create store dir");
            return Err(e.into());
        }
    }

    let tmp = temp_path(path);
    fs::write(&tmp, json).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        error!(error = %e, "Failed to replace store file");
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    debug!(articles = snapshot.articles.len(), jobs = snapshot.jobs.len(), "Wrote store");
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "store.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}

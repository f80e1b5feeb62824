//! On-disk snapshot of instance definitions (spec §6): one JSON file per instance at
//! `<state_dir>/instances/<name>.json`, containing `name`, `options`, and `running`
//! (desired state at last persist). This is the only on-disk authority for instance
//! definitions; writes are best-effort and not linearized with external observers.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::options::InstanceOptions;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub name: String,
    pub options: Option<InstanceOptions>,
    pub running: bool,
}

fn instances_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("instances")
}

fn snapshot_path(state_dir: &Path, name: &str) -> PathBuf {
    instances_dir(state_dir).join(format!("{name}.json"))
}

pub async fn write_snapshot(state_dir: &Path, snapshot: &InstanceSnapshot) -> std::io::Result<()> {
    let dir = instances_dir(state_dir);
    fs::create_dir_all(&dir).await?;
    let json = serde_json::to_vec_pretty(snapshot)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    fs::write(snapshot_path(state_dir, &snapshot.name), json).await
}

pub async fn remove_snapshot(state_dir: &Path, name: &str) -> std::io::Result<()> {
    match fs::remove_file(snapshot_path(state_dir, name)).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Loads every persisted instance snapshot found under `<state_dir>/instances/`.
/// Malformed individual snapshot files are skipped with a warning rather than failing
/// the whole restore.
pub async fn load_all(state_dir: &Path) -> std::io::Result<Vec<InstanceSnapshot>> {
    let dir = instances_dir(state_dir);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    let mut entries = fs::read_dir(&dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<InstanceSnapshot>(&bytes) {
                Ok(snapshot) => out.push(snapshot),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping malformed instance snapshot"),
            },
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to read instance snapshot"),
        }
    }
    Ok(out)
}

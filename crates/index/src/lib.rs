use std::path::{Path, PathBuf};

use tokio::fs;
use vmrepobuild::{error::Result, metadata::METADATA_EXTENSION};

pub mod lago;
pub mod virt_builder;

/// Per-image metadata files directly inside `repo_dir`, sorted, paired with
/// their handle (the file name without `.metadata`). The repository-level
/// `repo.metadata` is never included.
pub async fn metadata_files(repo_dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut entries = fs::read_dir(repo_dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|x| x.to_str()) != Some(METADATA_EXTENSION) {
            continue;
        }
        let Some(handle) = path.file_stem().and_then(|x| x.to_str()) else {
            continue;
        };
        if handle == lago::REPO_HANDLE {
            continue;
        }
        files.push((handle.to_string(), path.clone()));
    }
    files.sort();
    Ok(files)
}

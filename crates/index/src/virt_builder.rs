use std::path::{Path, PathBuf};

use log::warn;
use tokio::fs;
use vmrepobuild::{
    compress::XZ_EXTENSION,
    error::{Error, Result},
    metadata::ImageMetadata,
};

use crate::metadata_files;

pub const INDEX_FILE_NAME: &str = "index";

/// The virt-builder `index` file: one `[id]` block per image.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VirtBuilderIndex {
    entries: Vec<String>,
}

impl VirtBuilderIndex {
    pub fn new() -> VirtBuilderIndex {
        VirtBuilderIndex::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = String>) -> VirtBuilderIndex {
        VirtBuilderIndex {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn push(&mut self, entry: String) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rebuilds the blocks from the metadata files of compressed images.
    pub async fn from_metadata_dir(repo_dir: &Path) -> Result<VirtBuilderIndex> {
        let mut index = VirtBuilderIndex::new();
        for (handle, path) in metadata_files(repo_dir).await? {
            let file = format!("{}.{}", handle, XZ_EXTENSION);
            if !repo_dir.join(&file).is_file() {
                warn!("skipping image without artifact handle={}", handle);
                continue;
            }
            let metadata = ImageMetadata::load(&path).await?;
            match metadata.virt_builder_entry(&handle, &file) {
                Ok(entry) => index.push(entry),
                Err(Error::ImageNotCompressed(_)) => {
                    warn!("skipping uncompressed image handle={}", handle);
                }
                Err(error) => return Err(error),
            }
        }
        Ok(index)
    }

    pub fn render(&self) -> String {
        let mut content = self.entries.join("\n\n");
        content.push('\n');
        content
    }

    pub async fn write(&self, repo_dir: &Path) -> Result<PathBuf> {
        let path = repo_dir.join(INDEX_FILE_NAME);
        fs::write(&path, self.render()).await?;
        Ok(path)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn compressed_metadata(name: &str) -> ImageMetadata {
        ImageMetadata {
            name: name.to_string(),
            osinfo: Some("centos7.0".to_string()),
            size: Some(4096),
            uncompressed_checksum: Some("aa".to_string()),
            compressed_size: Some(512),
            checksum: Some("bb".to_string()),
            timestamp: Some(0),
            ..Default::default()
        }
    }

    #[test]
    fn test_render_joins_blocks() {
        let index = VirtBuilderIndex::from_entries(vec![
            "[a]\nfile=a.xz".to_string(),
            "[b]\nfile=b.xz".to_string(),
        ]);
        assert_eq!(index.render(), "[a]\nfile=a.xz\n\n[b]\nfile=b.xz\n");
    }

    #[tokio::test]
    async fn test_from_metadata_dir() {
        let dir = tempfile::tempdir().unwrap();
        let write = |handle: &str, metadata: &ImageMetadata| {
            std::fs::write(
                dir.path().join(format!("{}.metadata", handle)),
                metadata.to_json().unwrap(),
            )
            .unwrap();
        };
        write("el7", &compressed_metadata("el7-base"));
        std::fs::write(dir.path().join("el7.xz"), b"xz").unwrap();
        write("orphan", &compressed_metadata("orphan"));
        write(
            "pending",
            &ImageMetadata {
                name: "pending".to_string(),
                ..Default::default()
            },
        );
        std::fs::write(dir.path().join("pending.xz"), b"xz").unwrap();

        let index = VirtBuilderIndex::from_metadata_dir(dir.path()).await.unwrap();
        assert_eq!(index.len(), 1);
        let path = index.write(dir.path()).await.unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.starts_with("[el7]\nfile=el7.xz\nformat=qcow2\ncompressed_size=512\n"));
        assert!(content.contains("\nosinfo=centos7.0\n"));
        assert!(content.ends_with('\n'));
    }
}

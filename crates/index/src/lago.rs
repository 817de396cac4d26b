use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;
use vmrepobuild::{error::Result, metadata::ImageMetadata};

use crate::metadata_files;

pub const REPO_HANDLE: &str = "repo";
pub const REPO_METADATA_FILE_NAME: &str = "repo.metadata";
pub const LATEST_VERSION: &str = "latest";

/// The `repo.metadata` document lago clients read to discover templates.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LagoRepoIndex {
    pub name: String,
    pub templates: BTreeMap<String, LagoTemplate>,
    pub sources: BTreeMap<String, LagoSource>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct LagoTemplate {
    pub versions: BTreeMap<String, LagoTemplateVersion>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LagoTemplateVersion {
    pub source: String,
    pub handle: String,
    pub timestamp: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LagoSource {
    pub args: LagoSourceArgs,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LagoSourceArgs {
    pub baseurl: String,
}

impl LagoRepoIndex {
    pub fn new(repo_name: &str, base_url: &str) -> LagoRepoIndex {
        let mut sources = BTreeMap::new();
        sources.insert(
            repo_name.to_string(),
            LagoSource {
                args: LagoSourceArgs {
                    baseurl: base_url.to_string(),
                },
                kind: "http".to_string(),
            },
        );
        LagoRepoIndex {
            name: repo_name.to_string(),
            templates: BTreeMap::new(),
            sources,
        }
    }

    pub fn add_version(&mut self, template: &str, version: &str, handle: &str, timestamp: i64) {
        let source = self.name.clone();
        self.templates
            .entry(template.to_string())
            .or_default()
            .versions
            .insert(
                version.to_string(),
                LagoTemplateVersion {
                    source,
                    handle: handle.to_string(),
                    timestamp,
                },
            );
    }

    /// Indexes every finalized image metadata file in `repo_dir`. Images
    /// without a version are published as `latest`.
    pub async fn from_metadata_dir(
        repo_dir: &Path,
        repo_name: &str,
        base_url: &str,
    ) -> Result<LagoRepoIndex> {
        let mut index = LagoRepoIndex::new(repo_name, base_url);
        for (handle, path) in metadata_files(repo_dir).await? {
            let metadata = ImageMetadata::load(&path).await?;
            let Some(timestamp) = metadata.timestamp else {
                warn!("skipping unfinished image handle={}", handle);
                continue;
            };
            let version = metadata.version.as_deref().unwrap_or(LATEST_VERSION);
            debug!(
                "indexing template={} version={} handle={}",
                metadata.name, version, handle
            );
            index.add_version(&metadata.name, version, &handle, timestamp);
        }
        Ok(index)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub async fn write(&self, repo_dir: &Path) -> Result<PathBuf> {
        let path = repo_dir.join(REPO_METADATA_FILE_NAME);
        fs::write(&path, self.to_json()?).await?;
        Ok(path)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn write_metadata(
        dir: &Path,
        handle: &str,
        name: &str,
        version: Option<&str>,
        timestamp: Option<i64>,
    ) {
        let metadata = ImageMetadata {
            name: name.to_string(),
            version: version.map(String::from),
            timestamp,
            ..Default::default()
        };
        std::fs::write(
            dir.join(format!("{}.metadata", handle)),
            metadata.to_json().unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_document_layout() {
        let mut index = LagoRepoIndex::new("test", "http://127.0.0.1:8181");
        index.add_version("el7-base", "v1", "el7", 1_466_000_000);
        let value: serde_json::Value = serde_json::from_str(&index.to_json().unwrap()).unwrap();
        assert_eq!(value["name"], "test");
        assert_eq!(
            value["sources"]["test"]["args"]["baseurl"],
            "http://127.0.0.1:8181"
        );
        assert_eq!(value["sources"]["test"]["type"], "http");
        let version = &value["templates"]["el7-base"]["versions"]["v1"];
        assert_eq!(version["source"], "test");
        assert_eq!(version["handle"], "el7");
        assert_eq!(version["timestamp"], 1_466_000_000);
    }

    #[tokio::test]
    async fn test_from_metadata_dir() {
        let dir = tempfile::tempdir().unwrap();
        write_metadata(dir.path(), "el7", "el7-base", None, Some(10));
        write_metadata(dir.path(), "el7-v2", "el7-base", Some("v2"), Some(20));
        write_metadata(dir.path(), "partial", "partial", None, None);
        std::fs::write(dir.path().join("el7.xz"), b"").unwrap();

        let index = LagoRepoIndex::from_metadata_dir(dir.path(), "test", "http://repo")
            .await
            .unwrap();
        let path = index.write(dir.path()).await.unwrap();
        assert_eq!(path, dir.path().join(REPO_METADATA_FILE_NAME));

        // a second pass must not trip over the written repo.metadata
        let again = LagoRepoIndex::from_metadata_dir(dir.path(), "test", "http://repo")
            .await
            .unwrap();
        assert_eq!(again, index);

        assert_eq!(index.templates.len(), 1);
        let versions = &index.templates["el7-base"].versions;
        assert_eq!(versions[LATEST_VERSION].handle, "el7");
        assert_eq!(versions["v2"].handle, "el7-v2");
        assert_eq!(versions["v2"].timestamp, 20);
    }
}

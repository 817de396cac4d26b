use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    compress::{strip_suffix, XZ_EXTENSION},
    error::{Error, Result},
    spec::Spec,
};

pub const METADATA_EXTENSION: &str = "metadata";
pub const HASH_EXTENSION: &str = "hash";
const REVISION_FORMAT: &str = "%Y%m%d%H%M%S";

/// Per-image `.metadata` document: spec properties and build values in one
/// flat JSON object.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distro: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub osinfo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expand: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub meta_data_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uncompressed_checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_sha1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(flatten)]
    pub extra: IndexMap<String, String>,
}

impl ImageMetadata {
    pub fn from_spec(spec: &Spec) -> ImageMetadata {
        let properties = &spec.properties;
        let build = &spec.build;
        ImageMetadata {
            name: spec.name().to_string(),
            base: properties.base.clone(),
            distro: properties.distro.clone(),
            osinfo: properties.osinfo.clone(),
            arch: properties.arch.clone(),
            expand: properties.expand.clone(),
            version: properties.version.clone(),
            meta_data_only: properties.meta_data_only,
            size: build.size,
            sha1: build.sha1.clone(),
            uncompressed_checksum: build.uncompressed_checksum.clone(),
            compressed_size: build.compressed_size,
            compressed_sha1: build.compressed_sha1.clone(),
            checksum: build.checksum.clone(),
            timestamp: build.timestamp,
            extra: properties.extra.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub async fn load(path: &Path) -> Result<ImageMetadata> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Renders the virt-builder index block for the compressed artifact
    /// `file`. Fails when the compressed values were never recorded.
    pub fn virt_builder_entry(&self, id: &str, file: &str) -> Result<String> {
        let not_compressed = || Error::ImageNotCompressed(id.to_string());
        let compressed_size = self.compressed_size.ok_or_else(not_compressed)?;
        let size = self.size.ok_or_else(not_compressed)?;
        let checksum = self.checksum.as_deref().ok_or_else(not_compressed)?;
        let uncompressed_checksum = self
            .uncompressed_checksum
            .as_deref()
            .ok_or_else(not_compressed)?;
        let timestamp = self.timestamp.ok_or_else(not_compressed)?;

        let mut lines = vec![
            format!("[{}]", id),
            format!("file={}", file),
            "format=qcow2".to_string(),
            format!("compressed_size={}", compressed_size),
            format!("size={}", size),
            format!("checksum={}", checksum),
            format!("uncompressed_checksum={}", uncompressed_checksum),
            format!("revision={}", revision(timestamp)),
            format!("name={}", self.name),
        ];
        let named = [
            ("base", &self.base),
            ("distro", &self.distro),
            ("osinfo", &self.osinfo),
            ("arch", &self.arch),
            ("expand", &self.expand),
            ("version", &self.version),
        ];
        for (key, value) in named {
            if let Some(value) = value {
                lines.push(format!("{}={}", key, value));
            }
        }
        for (key, value) in &self.extra {
            lines.push(format!("{}={}", key, value));
        }
        Ok(lines.join("\n"))
    }
}

/// `YYYYmmddHHMMSS` of a unix timestamp, in UTC.
pub fn revision(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .unwrap_or_default()
        .format(REVISION_FORMAT)
        .to_string()
}

/// `<base>.metadata` and `<base>.hash` for an artifact, ignoring its `.xz`.
pub fn sidecar_paths(artifact: &Path) -> (PathBuf, PathBuf) {
    let base = strip_suffix(artifact, XZ_EXTENSION);
    let mut metadata = base.clone().into_os_string();
    metadata.push(".");
    metadata.push(METADATA_EXTENSION);
    let mut hash = base.into_os_string();
    hash.push(".");
    hash.push(HASH_EXTENSION);
    (PathBuf::from(metadata), PathBuf::from(hash))
}

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::{
    acquire::AcquireOptions, compress::CompressionOptions, error::Result, tools::ToolOptions,
};

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct BuildConfig {
    #[serde(default)]
    pub tools: ToolOptions,
    #[serde(default)]
    pub build: BuildSection,
    #[serde(default)]
    pub compression: CompressionOptions,
    #[serde(default)]
    pub download: AcquireOptions,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct BuildSection {
    #[serde(default)]
    pub jobs: Option<usize>,
}

impl BuildSection {
    /// Configured job count, or the available parallelism.
    pub fn jobs(&self) -> usize {
        self.jobs.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|x| x.get())
                .unwrap_or(1)
        })
    }
}

impl BuildConfig {
    /// Reads a TOML config. A missing file yields the defaults.
    pub async fn load(path: &Path) -> Result<BuildConfig> {
        if !path.exists() {
            return Ok(BuildConfig::default());
        }
        let content = fs::read_to_string(path).await?;
        BuildConfig::parse(&content)
    }

    pub fn parse(content: &str) -> Result<BuildConfig> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compress::DEFAULT_BLOCK_SIZE;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = BuildConfig::parse("").unwrap();
        assert_eq!(config, BuildConfig::default());
        assert_eq!(config.compression.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(config.compression.preset, 9);
        assert_eq!(config.tools.timeout, 4 * 60 * 60);
        assert!(config.build.jobs() >= 1);
    }

    #[test]
    fn test_parse_sections() {
        let config = BuildConfig::parse(
            "[tools]\ntimeout = 600\n\n[build]\njobs = 3\n\n\
             [compression]\nblock-size = 1048576\npreset = 6\n\n[download]\nforce = true\n",
        )
        .unwrap();
        assert_eq!(config.tools.timeout, 600);
        assert_eq!(config.build.jobs(), 3);
        assert_eq!(config.compression.block_size, 1_048_576);
        assert_eq!(config.compression.preset, 6);
        assert!(config.download.force);
    }

    #[test]
    fn test_unknown_value_type_is_rejected() {
        assert!(BuildConfig::parse("[build]\njobs = \"many\"\n").is_err());
    }

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = BuildConfig::load(&dir.path().join("vmrepo.toml"))
            .await
            .unwrap();
        assert_eq!(config, BuildConfig::default());
    }
}

use std::path::{Path, PathBuf};

use log::{debug, info};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{self, File},
    io::{AsyncWriteExt, BufWriter},
};
use url::Url;

use crate::{
    base::is_url,
    compress::{decompress, strip_suffix, with_suffix, Compression},
    error::{Error, Result},
    progress::BoundProgress,
};

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct AcquireOptions {
    #[serde(default)]
    pub force: bool,
}

/// Fetches base artifacts from URLs or local paths and leaves them
/// uncompressed on disk.
#[derive(Clone)]
pub struct BaseAcquirer {
    client: Client,
    options: AcquireOptions,
}

impl BaseAcquirer {
    pub fn new(options: AcquireOptions) -> BaseAcquirer {
        BaseAcquirer {
            client: Client::new(),
            options,
        }
    }

    /// Places `locator` at `dst` (or inside it, when `dst` is a directory)
    /// and returns the path of the uncompressed artifact.
    pub async fn acquire(
        &self,
        locator: &str,
        dst: &Path,
        progress: &BoundProgress,
    ) -> Result<PathBuf> {
        progress
            .update(|progress| progress.start_acquire(locator))
            .await;
        let resolved = self.fetch(locator, dst, progress).await?;
        uncompress_in_place(&resolved).await
    }

    async fn fetch(&self, locator: &str, dst: &Path, progress: &BoundProgress) -> Result<PathBuf> {
        if is_url(locator) {
            let url = Url::parse(locator)?;
            let dst = if dst.is_dir() {
                dst.join(filename_from_url(&url))
            } else {
                dst.to_path_buf()
            };
            self.download(&url, &dst, progress).await?;
            Ok(dst)
        } else {
            let src = PathBuf::from(locator);
            let dst = if dst.is_dir() {
                let name = src
                    .file_name()
                    .ok_or_else(|| Error::ArtifactMissing(src.clone()))?;
                dst.join(name)
            } else {
                dst.to_path_buf()
            };
            info!("copying src={} dst={}", src.display(), dst.display());
            let size = fs::copy(&src, &dst).await?;
            progress
                .update(|progress| progress.downloading(size, Some(size)))
                .await;
            Ok(dst)
        }
    }

    async fn download(&self, url: &Url, dst: &Path, progress: &BoundProgress) -> Result<()> {
        if dst.is_file() && !self.options.force {
            debug!("already downloaded dst={}", dst.display());
            return Ok(());
        }

        info!("downloading url={} dst={}", url, dst.display());
        let mut response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(Error::DownloadFailed {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        let total = response.content_length();
        let file = File::create(dst).await?;
        let mut writer = BufWriter::new(file);
        let mut downloaded: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            writer.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            progress
                .update(|progress| progress.downloading(downloaded, total))
                .await;
        }
        writer.flush().await?;
        Ok(())
    }
}

pub fn filename_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .unwrap_or("download")
        .to_string()
}

/// Decompresses xz and gzip artifacts next to themselves. Tools expect the
/// compressed file to carry its suffix, so one is added when missing and the
/// decompressed result keeps the original name.
pub async fn uncompress_in_place(path: &Path) -> Result<PathBuf> {
    let compression = Compression::detect_file(path).await?;
    let Some(ext) = compression.extension() else {
        return Ok(path.to_path_buf());
    };

    let (compressed, target) = if path.extension().and_then(|x| x.to_str()) == Some(ext) {
        (path.to_path_buf(), strip_suffix(path, ext))
    } else {
        let compressed = with_suffix(path, ext);
        fs::rename(path, &compressed).await?;
        (compressed, path.to_path_buf())
    };

    decompress(&compressed, &target, compression).await?;
    fs::remove_file(&compressed).await?;
    Ok(target)
}

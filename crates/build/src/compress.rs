use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
    pin::Pin,
};

use async_compression::tokio::bufread::{GzipDecoder, XzDecoder};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, BufReader as AsyncBufReader, BufWriter as AsyncBufWriter};
use xz2::{
    stream::{Check, MtStreamBuilder},
    write::XzEncoder,
};

use crate::{error::Result, progress::BoundProgress};

pub const XZ_EXTENSION: &str = "xz";
pub const GZIP_EXTENSION: &str = "gz";

/// Block size virt-builder expects when reading templates in chunks.
pub const DEFAULT_BLOCK_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_PRESET: u32 = 9;

const COPY_CHUNK_SIZE: usize = 1024 * 1024;
const XZ_MAGIC: &[u8] = &[0xfd, b'7', b'z', b'X', b'Z', 0x00];
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompressionOptions {
    #[serde(default = "default_block_size", rename = "block-size")]
    pub block_size: u64,
    #[serde(default = "default_preset")]
    pub preset: u32,
    #[serde(default)]
    pub threads: Option<u32>,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        CompressionOptions {
            block_size: default_block_size(),
            preset: default_preset(),
            threads: None,
        }
    }
}

fn default_block_size() -> u64 {
    DEFAULT_BLOCK_SIZE
}

fn default_preset() -> u32 {
    DEFAULT_PRESET
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Xz,
}

impl Compression {
    pub fn detect(header: &[u8]) -> Compression {
        if header.starts_with(XZ_MAGIC) {
            Compression::Xz
        } else if header.starts_with(GZIP_MAGIC) {
            Compression::Gzip
        } else {
            Compression::None
        }
    }

    pub async fn detect_file(path: &Path) -> Result<Compression> {
        use tokio::io::AsyncReadExt;

        let mut file = tokio::fs::File::open(path).await?;
        let mut header = [0u8; 6];
        let mut filled = 0;
        while filled < header.len() {
            let count = file.read(&mut header[filled..]).await?;
            if count == 0 {
                break;
            }
            filled += count;
        }
        Ok(Compression::detect(&header[..filled]))
    }

    pub fn extension(&self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Gzip => Some(GZIP_EXTENSION),
            Compression::Xz => Some(XZ_EXTENSION),
        }
    }
}

/// Appends `.ext` to the full file name, keeping any existing extension.
pub fn with_suffix(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

/// Drops a trailing `.ext` from the path, if present.
pub fn strip_suffix(path: &Path, ext: &str) -> PathBuf {
    if path.extension().and_then(|x| x.to_str()) == Some(ext) {
        path.with_extension("")
    } else {
        path.to_path_buf()
    }
}

pub fn xz_compress_blocking(
    path: &Path,
    options: &CompressionOptions,
    progress: Option<&BoundProgress>,
) -> Result<PathBuf> {
    let target = with_suffix(path, XZ_EXTENSION);
    let threads = options.threads.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|x| x.get() as u32)
            .unwrap_or(1)
    });
    info!(
        "compressing path={} block_size={} threads={}",
        path.display(),
        options.block_size,
        threads
    );
    let stream = MtStreamBuilder::new()
        .threads(threads)
        .block_size(options.block_size)
        .preset(options.preset)
        .check(Check::Crc64)
        .encoder()?;

    let partial = scopeguard::guard(target.clone(), |target| {
        let _ = std::fs::remove_file(target);
    });

    let mut reader = BufReader::new(File::open(path)?);
    let writer = BufWriter::new(File::create(&target)?);
    let mut encoder = XzEncoder::new_stream(writer, stream);
    let mut buffer = vec![0u8; COPY_CHUNK_SIZE];
    let mut consumed: u64 = 0;
    loop {
        let count = reader.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        encoder.write_all(&buffer[..count])?;
        consumed += count as u64;
        if let Some(progress) = progress {
            progress.update_blocking(|progress| progress.value = consumed);
        }
    }
    encoder.finish()?.flush()?;

    let target = scopeguard::ScopeGuard::into_inner(partial);
    debug!("compressed path={} target={}", path.display(), target.display());
    Ok(target)
}

pub async fn xz_compress(
    path: &Path,
    options: CompressionOptions,
    progress: Option<BoundProgress>,
) -> Result<PathBuf> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || xz_compress_blocking(&path, &options, progress.as_ref()))
        .await?
}

/// Decompresses `source` into `target`.
pub async fn decompress(source: &Path, target: &Path, compression: Compression) -> Result<()> {
    debug!(
        "decompressing source={} target={} compression={:?}",
        source.display(),
        target.display(),
        compression
    );
    let file = tokio::fs::File::open(source).await?;
    let reader = AsyncBufReader::new(file);
    let mut reader: Pin<Box<dyn AsyncRead + Send>> = match compression {
        Compression::None => Box::pin(reader),
        Compression::Gzip => Box::pin(GzipDecoder::new(reader)),
        Compression::Xz => Box::pin(XzDecoder::new(reader)),
    };
    let output = tokio::fs::File::create(target).await?;
    let mut writer = AsyncBufWriter::new(output);
    tokio::io::copy(&mut reader, &mut writer).await?;
    tokio::io::AsyncWriteExt::flush(&mut writer).await?;
    Ok(())
}

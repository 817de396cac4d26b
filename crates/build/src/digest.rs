use std::{
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf},
};

use log::debug;
use sha1::{Digest, Sha1};
use sha2::Sha512;

use crate::error::Result;

const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Size plus the fast (sha1) and strong (sha512) digests of a file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileDigests {
    pub size: u64,
    pub sha1: String,
    pub sha512: String,
}

pub fn file_digests_blocking(path: &Path) -> Result<FileDigests> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut sha1 = Sha1::new();
    let mut sha512 = Sha512::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
    let mut size: u64 = 0;
    loop {
        let count = reader.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        sha1.update(&buffer[..count]);
        sha512.update(&buffer[..count]);
        size += count as u64;
    }
    let digests = FileDigests {
        size,
        sha1: hex::encode(sha1.finalize()),
        sha512: hex::encode(sha512.finalize()),
    };
    debug!(
        "digested path={} size={} sha1={}",
        path.display(),
        digests.size,
        digests.sha1
    );
    Ok(digests)
}

pub async fn file_digests(path: &Path) -> Result<FileDigests> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || file_digests_blocking(&path)).await?
}

//! Stable identity for a local source, used as the URL store key.
//!
//! Only the first [`BLOCK_SIZE`] bytes are hashed; the total size is part of
//! the fingerprint string. This is a lookup key, not an integrity check.

use std::{
    io::{self, SeekFrom},
    path::Path,
};
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt},
};

/// Leading bytes fed to the hash.
pub const BLOCK_SIZE: usize = 64 * 1024;

/// Fingerprint of an open stream. The stream position is restored.
pub async fn fingerprint<R>(reader: &mut R) -> io::Result<String>
where
    R: AsyncRead + AsyncSeek + Unpin + ?Sized,
{
    let original = reader.stream_position().await?;
    let result = fingerprint_from_start(reader).await;
    reader.seek(SeekFrom::Start(original)).await?;
    result
}

/// Fingerprint of the file at `path`.
pub async fn fingerprint_path(path: impl AsRef<Path>) -> io::Result<String> {
    let mut file = File::open(path).await?;
    fingerprint_from_start(&mut file).await
}

async fn fingerprint_from_start<R>(reader: &mut R) -> io::Result<String>
where
    R: AsyncRead + AsyncSeek + Unpin + ?Sized,
{
    reader.seek(SeekFrom::Start(0)).await?;
    let mut block = vec![0u8; BLOCK_SIZE];
    let mut filled = 0;
    while filled < BLOCK_SIZE {
        let n = reader.read(&mut block[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    let digest = md5::compute(&block[..filled]);
    let size = reader.seek(SeekFrom::End(0)).await?;
    Ok(format!("size:{}--md5:{:x}", size, digest))
}

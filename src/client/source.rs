//! Where upload bytes come from.
//!
//! A source is either a path the client opens (and closes) itself, or a
//! caller-owned stream the client borrows and leaves open.

use std::{
    io::{self, SeekFrom},
    path::{Path, PathBuf},
};
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt},
};

use crate::{errors::UploadError, services::fingerprint};

/// Readable, seekable byte stream.
pub trait SourceReader: AsyncRead + AsyncSeek + Unpin + Send {}

impl<T: AsyncRead + AsyncSeek + Unpin + Send> SourceReader for T {}

pub enum UploadSource<'a> {
    Path(PathBuf),
    Stream(&'a mut dyn SourceReader),
}

impl<'a> UploadSource<'a> {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        UploadSource::Path(path.into())
    }

    pub fn stream(reader: &'a mut dyn SourceReader) -> Self {
        UploadSource::Stream(reader)
    }

    /// Final component of a path source, used as default `filename` metadata.
    pub fn file_name(&self) -> Option<String> {
        match self {
            UploadSource::Path(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            UploadSource::Stream(_) => None,
        }
    }

    /// Resolve into a handle, opening the file for path sources.
    pub async fn open(self) -> Result<SourceHandle<'a>, UploadError> {
        match self {
            UploadSource::Path(path) => {
                let file = File::open(&path).await.map_err(|err| {
                    if err.kind() == io::ErrorKind::NotFound {
                        UploadError::SourceNotFound(path.display().to_string())
                    } else {
                        UploadError::Io(err)
                    }
                })?;
                SourceHandle::new(Handle::Owned(file)).await
            }
            UploadSource::Stream(reader) => SourceHandle::new(Handle::Borrowed(reader)).await,
        }
    }
}

impl<'a> From<&Path> for UploadSource<'a> {
    fn from(path: &Path) -> Self {
        UploadSource::Path(path.to_path_buf())
    }
}

impl<'a> From<PathBuf> for UploadSource<'a> {
    fn from(path: PathBuf) -> Self {
        UploadSource::Path(path)
    }
}

enum Handle<'a> {
    Owned(File),
    Borrowed(&'a mut dyn SourceReader),
}

/// An open source with its total size resolved.
pub struct SourceHandle<'a> {
    handle: Handle<'a>,
    size: u64,
}

impl<'a> SourceHandle<'a> {
    async fn new(mut handle: Handle<'a>) -> Result<Self, UploadError> {
        let reader = handle.reader();
        let size = reader.seek(SeekFrom::End(0)).await?;
        reader.seek(SeekFrom::Start(0)).await?;
        Ok(Self { handle, size })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// True when the handle was opened by the client and is closed on drop.
    pub fn is_owned(&self) -> bool {
        matches!(self.handle, Handle::Owned(_))
    }

    pub async fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        self.handle.reader().seek(SeekFrom::Start(offset)).await?;
        Ok(())
    }

    /// Read up to `len` bytes at `offset`. Fewer bytes means end of source.
    pub async fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let reader = self.handle.reader();
        reader.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    pub async fn fingerprint(&mut self) -> io::Result<String> {
        fingerprint::fingerprint(self.handle.reader()).await
    }
}

impl<'a> Handle<'a> {
    fn reader(&mut self) -> &mut dyn SourceReader {
        match self {
            Handle::Owned(file) => file,
            Handle::Borrowed(reader) => &mut **reader,
        }
    }
}

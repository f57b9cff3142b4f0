use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::TransferError;

/// Where a stream's bytes live, for logs and snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOrigin {
    File(PathBuf),
    Memory,
    Custom,
}

impl fmt::Display for StreamOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamOrigin::File(path) => write!(f, "{}", path.display()),
            StreamOrigin::Memory => f.write_str("<memory>"),
            StreamOrigin::Custom => f.write_str("<custom>"),
        }
    }
}

// ---------------------------------------------------------------------------
// ChunkSource
// ---------------------------------------------------------------------------

/// Local bytes backing one outbound transfer.
///
/// Owned by exactly one party at a time: the registry record until the peer
/// accepts, then the send worker, which drops it when it stops.
pub struct ChunkSource {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    len: u64,
    origin: StreamOrigin,
}

impl ChunkSource {
    /// Opens `path` for reading. The transfer size is the file's current length.
    pub async fn open(path: &Path) -> Result<Self, TransferError> {
        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        Ok(Self {
            reader: Box::new(file),
            len,
            origin: StreamOrigin::File(path.to_path_buf()),
        })
    }

    /// Serves an in-memory buffer (e.g. a pasted image).
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let len = data.len() as u64;
        Self {
            reader: Box::new(std::io::Cursor::new(data)),
            len,
            origin: StreamOrigin::Memory,
        }
    }

    /// Wraps an arbitrary reader that is expected to yield exactly `len` bytes.
    pub fn from_reader<R>(reader: R, len: u64) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            len,
            origin: StreamOrigin::Custom,
        }
    }

    /// Declared size in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn origin(&self) -> &StreamOrigin {
        &self.origin
    }

    /// Fills `buf` from the source.
    ///
    /// Short reads are retried until the buffer is full; a return value below
    /// `buf.len()` means the source hit EOF first.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, TransferError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

impl fmt::Debug for ChunkSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkSource")
            .field("len", &self.len)
            .field("origin", &self.origin)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ChunkSink
// ---------------------------------------------------------------------------

/// Local destination of one inbound transfer. Chunks are appended in
/// delivery order.
pub struct ChunkSink {
    writer: Box<dyn Write + Send>,
    written: u64,
    origin: StreamOrigin,
}

impl ChunkSink {
    /// Creates (or truncates) `path`, creating parent directories as needed.
    pub fn create(path: &Path) -> Result<Self, TransferError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;
        Ok(Self {
            writer: Box::new(std::io::BufWriter::new(file)),
            written: 0,
            origin: StreamOrigin::File(path.to_path_buf()),
        })
    }

    /// Wraps an arbitrary writer.
    pub fn from_writer<W>(writer: W) -> Self
    where
        W: Write + Send + 'static,
    {
        Self {
            writer: Box::new(writer),
            written: 0,
            origin: StreamOrigin::Custom,
        }
    }

    pub fn write_chunk(&mut self, data: &[u8]) -> Result<(), TransferError> {
        self.writer.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn origin(&self) -> &StreamOrigin {
        &self.origin
    }

    /// Flushes and closes the sink, returning the total bytes written.
    pub fn close(mut self) -> Result<u64, TransferError> {
        self.writer.flush()?;
        Ok(self.written)
    }

    /// Appends `data` on the blocking pool and hands the sink back.
    ///
    /// The sink is dropped if the write fails.
    pub async fn append(mut self, data: Vec<u8>) -> Result<Self, TransferError> {
        tokio::task::spawn_blocking(move || {
            self.write_chunk(&data)?;
            Ok(self)
        })
        .await
        .map_err(|e| TransferError::Io(std::io::Error::other(e)))?
    }

    /// [`close`](Self::close) on the blocking pool.
    pub async fn finish(self) -> Result<u64, TransferError> {
        tokio::task::spawn_blocking(move || self.close())
            .await
            .map_err(|e| TransferError::Io(std::io::Error::other(e)))?
    }
}

impl fmt::Debug for ChunkSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkSink")
            .field("written", &self.written)
            .field("origin", &self.origin)
            .finish()
    }
}

use std::fs::File;
use std::future::Future;
use std::io;
use std::sync::Arc;

use bytes::Bytes;

use crate::transfer::TransferError;

/// What a probe learned about the remote resource.
#[derive(Debug, Clone, Default)]
pub struct ProbeInfo {
    /// Authoritative content length; `None` or `Some(0)` mean unknown.
    pub size: Option<u64>,
    /// Server-suggested file name, if one was advertised.
    pub filename: Option<String>,
}

/// Inclusive byte range requested from a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

/// A byte source honouring range semantics: when opened with a range, the
/// first read yields the range's first byte and cumulative bytes never
/// exceed the range length. Reads may return fewer bytes than requested;
/// an empty result is end-of-stream. Dropping the reader closes it.
pub trait RangedReader: Send {
    fn read(&mut self, nbytes: usize) -> impl Future<Output = io::Result<Bytes>> + Send;
}

/// Factory for readers over one remote resource. Workers reopen through
/// this on every connection attempt, so a transport must be shareable and
/// cheap to reuse.
pub trait Transport: Send + Sync + 'static {
    type Reader: RangedReader + Send;

    /// Discovers the resource's size and suggested name without consuming
    /// its body.
    fn probe(&self) -> impl Future<Output = Result<ProbeInfo, TransferError>> + Send;

    /// Opens a reader over the given range, or over the whole resource
    /// when no range is supplied.
    fn open(
        &self,
        range: Option<ByteRange>,
    ) -> impl Future<Output = Result<Self::Reader, TransferError>> + Send;
}

/// Positioned writer into a shared preallocated file. Segment workers hold
/// disjoint offsets of the same `File`, so writes need no coordination.
pub struct FileWriter {
    file: Arc<File>,
    position: u64,
}

impl FileWriter {
    pub fn new(file: Arc<File>, position: u64) -> Self {
        Self { file, position }
    }

    pub fn seek(&mut self, position: u64) {
        self.position = position;
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        write_all_at(&self.file, buf, self.position)?;
        self.position += buf.len() as u64;
        Ok(())
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

// seek_write gives no all-or-nothing guarantee, so drain the slice by hand
#[cfg(windows)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut done = 0usize;
    while done < data.len() {
        match file.seek_write(&data[done..], offset + done as u64)? {
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "file accepted zero bytes mid-range",
                ));
            }
            n => done += n,
        }
    }
    Ok(())
}

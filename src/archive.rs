use std::cmp;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::region::read_fully_at;
use crate::{PackError, Result};
use encoding::all::ASCII;
use encoding::{DecoderTrap, EncoderTrap, Encoding};

/// Operations every container offers, whatever its backing storage.
///
/// Mutations take `&mut self` while read streams borrow the pack, so the
/// borrow checker enforces that every stream is released before the
/// container is modified.
pub trait Pack {
    /// Short label of the container format.
    fn name(&self) -> &'static str;

    /// Inner paths of every stored file, in no particular order.
    fn list(&self) -> Result<Vec<String>>;

    fn list_sizes(&self) -> Result<Vec<PathAndSize>>;

    /// Stores everything `source` yields under `inner_path`.
    fn add(&mut self, inner_path: &str, source: &mut dyn Read) -> Result<()>;

    fn extract_to(&self, inner_path: &str, sink: &mut dyn Write) -> Result<()>;

    fn remove(&mut self, inner_path: &str) -> Result<()>;

    fn contains(&self, inner_path: &str) -> bool;

    /// Opens an independent cursor over one entry's content.
    fn open_read_stream(&self, inner_path: &str) -> Result<Box<dyn Read + '_>>;

    /// Flushes pending writes and releases the container. Fallible operations
    /// called afterwards return `PackError::Closed`.
    fn close(&mut self) -> Result<()>;

    /// Removes the holes left by removals and relocations.
    fn repack(&mut self) -> Result<RepackResult>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathAndSize {
    pub inner_path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RepackResult {
    pub old_length: u64,
    pub new_length: u64,
    pub bytes_rewritten: u64,
}

/// Rejects inner paths no container can store.
pub(crate) fn check_inner_path(inner_path: &str) -> Result<()> {
    if inner_path.is_empty() {
        return Err(PackError::invalid_path("empty path"));
    }
    if inner_path.contains('\\') {
        return Err(PackError::invalid_path(format!(
            "'{}' contains a backslash",
            inner_path
        )));
    }
    if inner_path.contains('\0') {
        return Err(PackError::invalid_path(format!(
            "'{}' contains a NUL char",
            inner_path
        )));
    }
    Ok(())
}

pub(crate) fn serialize_to_ascii(inner_path: &str) -> Result<Vec<u8>> {
    ASCII
        .encode(inner_path, EncoderTrap::Strict)
        .map_err(|_| PackError::invalid_path(format!("'{}' is not ASCII", inner_path)))
}

pub(crate) fn string_from_ascii(v: &[u8]) -> Result<String> {
    ASCII
        .decode(v, DecoderTrap::Strict)
        .map_err(|e| PackError::corrupted(format!("inner path is not ASCII: {}", e)))
}

pub(crate) fn write_all_at(mut file: &File, buf: &[u8], offset: u64) -> Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buf)?;
    Ok(())
}

/// Reads exactly `buf.len()` bytes at `offset`; a short read means the
/// archive claims bytes the file does not have.
pub(crate) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    let n = read_fully_at(file, buf, offset)?;
    if n < buf.len() {
        return Err(PackError::corrupted(format!(
            "expected {} bytes at offset {}, file ends after {}",
            buf.len(),
            offset,
            n
        )));
    }
    Ok(())
}

/// Copies `length` bytes from `src` to `dst` inside one file through a
/// buffer of at most `chunk_size` bytes. Overlapping ranges are handled in
/// either direction.
pub(crate) fn copy_within_file(
    file: &File,
    src: u64,
    dst: u64,
    length: u64,
    chunk_size: usize,
) -> Result<()> {
    if length == 0 || src == dst {
        return Ok(());
    }
    let mut buf = vec![0u8; cmp::max(chunk_size, 1)];
    let mut done = 0u64;
    while done < length {
        let n = cmp::min(buf.len() as u64, length - done) as usize;
        // Moving forward over an overlap must start from the tail
        let pos = if dst > src { length - done - n as u64 } else { done };
        read_exact_at(file, &mut buf[..n], src + pos)?;
        write_all_at(file, &buf[..n], dst + pos)?;
        done += n as u64;
    }
    Ok(())
}

/// Counts the bytes pulled through it.
pub(crate) struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

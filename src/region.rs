//! Bounded read cursors over a shared archive file.
//!
//! Every read goes through [`read_at`], a positioned read that never touches
//! the handle's seek pointer, so any number of [`RegionReader`]s can share
//! one `&File` without disturbing each other.

use std::cmp;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};

pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Reads from `file` at `offset` without moving the file cursor.
#[cfg(unix)]
pub fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

/// Reads from `file` at `offset` without relying on the file cursor.
#[cfg(windows)]
pub fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

/// Fills `buf` from `offset`, stopping early only at the end of the file.
/// Returns the number of bytes actually read.
pub fn read_fully_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match read_at(file, &mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Raised when the backing file ends before the region it was promised to
/// contain.
#[derive(Debug)]
pub struct RegionTruncated {
    pub region_offset: u64,
    pub region_length: u64,
    pub file_offset: u64,
}

impl fmt::Display for RegionTruncated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "region [{}, +{}) truncated: file ends at {}",
            self.region_offset, self.region_length, self.file_offset
        )
    }
}

impl std::error::Error for RegionTruncated {}

/// A read cursor limited to `[region_offset, region_offset + region_length)`.
#[derive(Debug)]
pub struct RegionReader<'a> {
    file: &'a File,
    region_offset: u64,
    region_length: u64,
    intra_pos: u64,
    buf: Vec<u8>,
    // Region-relative position of buf[0]
    buf_start: u64,
    buf_len: usize,
}

impl<'a> RegionReader<'a> {
    pub fn new(file: &'a File, region_offset: u64, region_length: u64) -> Self {
        Self::with_chunk_size(file, region_offset, region_length, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(
        file: &'a File,
        region_offset: u64,
        region_length: u64,
        chunk_size: usize,
    ) -> Self {
        Self {
            file,
            region_offset,
            region_length,
            intra_pos: 0,
            buf: vec![0; cmp::max(chunk_size, 1)],
            buf_start: 0,
            buf_len: 0,
        }
    }

    pub fn region_length(&self) -> u64 {
        self.region_length
    }

    /// Position relative to the start of the region.
    pub fn position(&self) -> u64 {
        self.intra_pos
    }

    pub fn remaining(&self) -> u64 {
        self.region_length - self.intra_pos
    }

    /// Moves the cursor forward by up to `n` bytes, clamped to the region end.
    /// Returns how far the cursor actually moved.
    pub fn skip(&mut self, n: u64) -> u64 {
        let skipped = cmp::min(n, self.remaining());
        self.intra_pos += skipped;
        skipped
    }

    fn buffered(&self) -> Option<&[u8]> {
        let buf_end = self.buf_start + self.buf_len as u64;
        if self.intra_pos >= self.buf_start && self.intra_pos < buf_end {
            let start = (self.intra_pos - self.buf_start) as usize;
            Some(&self.buf[start..self.buf_len])
        } else {
            None
        }
    }

    /// Reads exactly `out.len()` bytes at the cursor, which the caller has
    /// already clamped to the region.
    fn read_region_exact(&self, out: &mut [u8]) -> io::Result<()> {
        let file_offset = self.region_offset + self.intra_pos;
        let n = read_fully_at(self.file, out, file_offset)?;
        if n < out.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                RegionTruncated {
                    region_offset: self.region_offset,
                    region_length: self.region_length,
                    file_offset: file_offset + n as u64,
                },
            ));
        }
        Ok(())
    }

    fn refill(&mut self) -> io::Result<()> {
        let want = cmp::min(self.buf.len() as u64, self.remaining()) as usize;
        let mut buf = std::mem::take(&mut self.buf);
        let res = self.read_region_exact(&mut buf[..want]);
        self.buf = buf;
        // Invalidate before propagating so a failed refill is never served
        self.buf_len = 0;
        res?;
        self.buf_start = self.intra_pos;
        self.buf_len = want;
        Ok(())
    }
}

impl Read for RegionReader<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let remaining = self.remaining();
        if remaining == 0 || out.is_empty() {
            return Ok(0);
        }
        let want = cmp::min(out.len() as u64, remaining) as usize;

        if let Some(cached) = self.buffered() {
            let n = cmp::min(want, cached.len());
            out[..n].copy_from_slice(&cached[..n]);
            self.intra_pos += n as u64;
            return Ok(n);
        }

        // Large reads skip the intermediate buffer
        if want >= self.buf.len() {
            self.read_region_exact(&mut out[..want])?;
            self.intra_pos += want as u64;
            return Ok(want);
        }

        self.refill()?;
        let n = cmp::min(want, self.buf_len);
        out[..n].copy_from_slice(&self.buf[..n]);
        self.intra_pos += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch_file(content: &[u8]) -> File {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(content).unwrap();
        file
    }

    #[test]
    fn test_region_stops_at_region_end() {
        let content: Vec<u8> = (0..=255).collect();
        let file = scratch_file(&content);
        let mut reader = RegionReader::new(&file, 10, 20);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(&content[10..30], out.as_slice());
        // Already at the end, even though the file goes on
        assert_eq!(0, reader.read(&mut [0u8; 8]).unwrap());
    }

    #[test]
    fn test_small_chunks_refill() {
        let content: Vec<u8> = (0..100u8).collect();
        let file = scratch_file(&content);
        let mut reader = RegionReader::with_chunk_size(&file, 5, 90, 7);
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        while reader.read(&mut byte).unwrap() == 1 {
            out.push(byte[0]);
        }
        assert_eq!(&content[5..95], out.as_slice());
    }

    #[test]
    fn test_interleaved_readers_are_independent() {
        let content: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let file = scratch_file(&content);
        let mut first = RegionReader::with_chunk_size(&file, 0, 1000, 16);
        let mut second = RegionReader::with_chunk_size(&file, 1000, 1000, 16);
        let (mut out1, mut out2) = (Vec::new(), Vec::new());
        let mut buf = [0u8; 13];
        loop {
            let n1 = first.read(&mut buf).unwrap();
            out1.extend_from_slice(&buf[..n1]);
            let n2 = second.read(&mut buf[..5]).unwrap();
            out2.extend_from_slice(&buf[..n2]);
            if n1 == 0 && n2 == 0 {
                break;
            }
        }
        assert_eq!(&content[..1000], out1.as_slice());
        assert_eq!(&content[1000..], out2.as_slice());
    }

    #[test]
    fn test_skip_is_clamped() {
        let content = vec![7u8; 64];
        let file = scratch_file(&content);
        let mut reader = RegionReader::new(&file, 0, 32);
        assert_eq!(30, reader.skip(30));
        assert_eq!(2, reader.skip(30));
        assert_eq!(32, reader.position());
        assert_eq!(0, reader.read(&mut [0u8; 4]).unwrap());
    }

    #[test]
    fn test_truncated_file_is_an_error() {
        let file = scratch_file(&[1u8; 50]);
        let mut reader = RegionReader::new(&file, 40, 30);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert!(err
            .get_ref()
            .and_then(|e| e.downcast_ref::<RegionTruncated>())
            .is_some());
    }
}

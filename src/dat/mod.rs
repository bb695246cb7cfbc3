//! Legacy offset-table archives (`data.dat`, `resource.dat`).
//!
//! Layout, little-endian throughout:
//! - `u32` slot count
//! - one `u32` entry offset per slot, `0` marking a vacant slot
//! - hunks: `u32` data size, `u32` path length, ASCII path, data bytes

mod pack;

pub use pack::DatPack;

use nom::number::complete::le_u32;
use nom::*;
use serde::Serialize;

const INDEX_COUNT_SIZE: u64 = std::mem::size_of::<u32>() as u64;
const SLOT_SIZE: u64 = std::mem::size_of::<u32>() as u64;
const HUNK_HEADER_SIZE: u64 = 2 * std::mem::size_of::<u32>() as u64;

/// Location of one stored file inside a DAT archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatEntry {
    pub entry_offset: u64,
    pub inner_path: String,
    pub data_offset: u64,
    pub data_size: u64,
}

impl DatEntry {
    fn new(entry_offset: u64, inner_path: String, data_size: u64) -> Self {
        let data_offset = entry_offset + HUNK_HEADER_SIZE + inner_path.len() as u64;
        Self {
            entry_offset,
            inner_path,
            data_offset,
            data_size,
        }
    }

    /// Size of the whole hunk: header, path and data.
    pub fn hunk_length(&self) -> u64 {
        self.data_offset - self.entry_offset + self.data_size
    }

    pub fn hunk_end(&self) -> u64 {
        self.data_offset + self.data_size
    }

    fn relocate(&mut self, entry_offset: u64) {
        let header_length = self.data_offset - self.entry_offset;
        self.entry_offset = entry_offset;
        self.data_offset = entry_offset + header_length;
    }
}

fn slot_offset(index: usize) -> u64 {
    INDEX_COUNT_SIZE + index as u64 * SLOT_SIZE
}

#[derive(Debug, Serialize)]
struct SerializableHunkHeader {
    data_size: u32,
    path_length: u32,
}

#[derive(Debug, PartialEq, Eq)]
struct HunkHeader {
    data_size: u32,
    path_length: u32,
}

named!(parse_index_size<&[u8], u32>, call!(le_u32));

named_args!(parse_slots(index_size: usize)<&[u8], Vec<u32>>,
    count!(le_u32, index_size)
);

named!(parse_hunk_header<&[u8], HunkHeader>,
    do_parse!(
        data_size: le_u32
            >> path_length: le_u32
            >> (HunkHeader {
                data_size,
                path_length,
            }
        )
    )
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_geometry() {
        let mut entry = DatEntry::new(100, "data/text.xml".to_string(), 40);
        assert_eq!(121, entry.data_offset);
        assert_eq!(61, entry.hunk_length());
        assert_eq!(161, entry.hunk_end());
        entry.relocate(20);
        assert_eq!(41, entry.data_offset);
        assert_eq!(61, entry.hunk_length());
    }

    #[test]
    fn test_parse_hunk_header() {
        let bytes = [0x10, 0x00, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00, b'x'];
        let (rest, header) = parse_hunk_header(&bytes).unwrap();
        assert_eq!(
            HunkHeader {
                data_size: 16,
                path_length: 5
            },
            header
        );
        assert_eq!(b"x", rest);
    }

    #[test]
    fn test_parse_slots() {
        let bytes = [1, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0];
        let (_, slots) = parse_slots(&bytes, 3).unwrap();
        assert_eq!(vec![1, 0, 256], slots);
    }
}

//! Hashed, optionally compressed archives (`ftl.dat` since 1.6).
//!
//! Layout, big-endian throughout:
//! - 16-byte header: `"PKG\n"`, `u16` header size, `u16` entry size,
//!   `u32` entry count, `u32` paths region size
//! - `entry count` records of 20 bytes: path hash, path offset and flags,
//!   data offset, data size, unpacked size
//! - the paths region, NUL-terminated strings addressed by the low 24 bits
//!   of each record's path offset
//! - entry data

mod pack;

pub use pack::PkgPack;

use bincode::Options;
use nom::number::complete::{be_u16, be_u32};
use nom::*;
use serde::Serialize;

pub const PKG_SIGNATURE: &[u8; 4] = b"PKG\n";
// Packed structs' sizes in bytes
const HEADER_SIZE: u64 = 16;
const ENTRY_SIZE: u64 = 20;
const PATH_OFFSET_MASK: u32 = 0x00FF_FFFF;
const DEFLATED_FLAG: u32 = 0x0100_0000;

/// Hash stored next to every PKG record.
///
/// Each char of the lower-cased path rotates the hash right by 5 bits then
/// gets XORed in. Tools reading the format binary-search records by it.
pub fn path_hash(inner_path: &str) -> u32 {
    inner_path
        .to_lowercase()
        .chars()
        .fold(0u32, |hash, c| hash.rotate_right(5) ^ c as u32)
}

/// Location of one stored file inside a PKG archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkgEntry {
    pub inner_path_offset: u32,
    pub inner_path: String,
    pub inner_path_hash: u32,
    pub data_offset: u64,
    pub data_size: u64,
    pub unpacked_size: u64,
    pub data_deflated: bool,
}

impl PkgEntry {
    pub fn data_end(&self) -> u64 {
        self.data_offset + self.data_size
    }

    /// Bytes this entry's path takes in the paths region.
    fn path_length(&self) -> u64 {
        self.inner_path.len() as u64 + 1
    }
}

fn paths_region_offset(entry_count: usize) -> u64 {
    HEADER_SIZE + entry_count as u64 * ENTRY_SIZE
}

fn record_offset(index: usize) -> u64 {
    HEADER_SIZE + index as u64 * ENTRY_SIZE
}

fn pkg_bincode() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_big_endian()
}

#[derive(Debug, Serialize)]
struct SerializablePkgHeader {
    signature: [u8; 4],
    header_size: u16,
    entry_size: u16,
    entry_count: u32,
    paths_region_size: u32,
}

impl SerializablePkgHeader {
    fn new(entry_count: u32, paths_region_size: u32) -> Self {
        Self {
            signature: *PKG_SIGNATURE,
            header_size: HEADER_SIZE as u16,
            entry_size: ENTRY_SIZE as u16,
            entry_count,
            paths_region_size,
        }
    }
}

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
struct PkgRecord {
    hash: u32,
    path_offset_and_flags: u32,
    data_offset: u32,
    data_size: u32,
    unpacked_size: u32,
}

impl PkgRecord {
    fn is_vacant(&self) -> bool {
        self.data_offset == 0
    }

    fn path_offset(&self) -> u32 {
        self.path_offset_and_flags & PATH_OFFSET_MASK
    }

    fn is_deflated(&self) -> bool {
        self.path_offset_and_flags & DEFLATED_FLAG != 0
    }
}

#[derive(Debug, PartialEq, Eq)]
struct PkgHeader {
    header_size: u16,
    entry_size: u16,
    entry_count: u32,
    paths_region_size: u32,
}

named!(parse_pkg_header<&[u8], PkgHeader>,
    do_parse!(
        tag!(&PKG_SIGNATURE[..])
            >> header_size: be_u16
            >> entry_size: be_u16
            >> entry_count: be_u32
            >> paths_region_size: be_u32
            >> (PkgHeader {
                header_size,
                entry_size,
                entry_count,
                paths_region_size,
            }
        )
    )
);

named!(parse_pkg_record<&[u8], PkgRecord>,
    do_parse!(
        hash: be_u32
            >> path_offset_and_flags: be_u32
            >> data_offset: be_u32
            >> data_size: be_u32
            >> unpacked_size: be_u32
            >> (PkgRecord {
                hash,
                path_offset_and_flags,
                data_offset,
                data_size,
                unpacked_size,
            }
        )
    )
);

named_args!(parse_pkg_records(entry_count: usize)<&[u8], Vec<PkgRecord>>,
    count!(parse_pkg_record, entry_count)
);

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_path_hash() {
        assert_eq!(0, path_hash(""));
        assert_eq!(0x61, path_hash("a"));
        assert_eq!(0x0800_0061, path_hash("ab"));
        assert_eq!(0xA373_0BDB, path_hash("events.xml"));
        assert_eq!(path_hash("events.xml"), path_hash("EVENTS.XML"));
        assert_eq!(0x9795_B62B, path_hash("data/blueprints.xml"));
    }

    #[test]
    fn test_parse_pkg_header() {
        let bytes = hex!("504b470a 0010 0014 00000003 00000040");
        let (_, header) = parse_pkg_header(&bytes).unwrap();
        assert_eq!(
            PkgHeader {
                header_size: 16,
                entry_size: 20,
                entry_count: 3,
                paths_region_size: 64,
            },
            header
        );
        assert!(parse_pkg_header(&hex!("504b4700 0010 0014 00000003 00000040")).is_err());
    }

    #[test]
    fn test_serialize_pkg_header() {
        let mut buf = Vec::new();
        pkg_bincode()
            .serialize_into(&mut buf, &SerializablePkgHeader::new(3, 64))
            .unwrap();
        assert_eq!(hex!("504b470a 0010 0014 00000003 00000040").to_vec(), buf);
    }

    #[test]
    fn test_parse_pkg_records() {
        let bytes = hex!(
            "00000061 01000004 00000100 00000010 00000040 00000000 00000000 00000000 00000000 00000000"
        );
        let (_, records) = parse_pkg_records(&bytes, 2).unwrap();
        assert_eq!(2, records.len());
        assert_eq!(4, records[0].path_offset());
        assert!(records[0].is_deflated());
        assert_eq!(0x100, records[0].data_offset);
        assert!(records[1].is_vacant());
        assert_eq!(PkgRecord::default(), records[1]);
    }
}

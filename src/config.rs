use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::region::DEFAULT_CHUNK_SIZE;
use crate::Result;
use serde::Deserialize;

/// How an archive file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// The file must exist; mutations fail with `ReadOnly`.
    Read,
    /// The file must exist.
    ReadWrite,
    /// Any existing file is erased and a fresh, empty index is written.
    Create,
}

impl OpenMode {
    pub fn is_writable(self) -> bool {
        self != OpenMode::Read
    }
}

/// Tunables shared by the file-backed codecs.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PackOptions {
    pub chunk_size: usize,            // Region stream and relocation copy buffer
    pub initial_index_size: u32,      // Slot count written in create mode
    pub index_growth: u32,            // Slots added when an add finds no vacancy
    pub path_bytes_per_slot: u32,     // PKG: paths region reserved per new slot
    pub compress_new_additions: bool, // PKG: deflate entries as they are added
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            initial_index_size: 2048,
            index_growth: 50,
            path_bytes_per_slot: 64,
            compress_new_additions: false,
        }
    }
}

/// Describes which archive owns which top-level segment of the virtual tree.
///
/// ```yaml
/// default: data.dat
/// routes:
///   "audio/": resource.dat
///   "fonts/": resource.dat
/// ignore:
///   - "mod-appendix/"
/// ```
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RouterConfig {
    pub default: PathBuf,
    #[serde(default)]
    pub routes: HashMap<String, PathBuf>,
    #[serde(default)]
    pub ignore: Vec<String>,
    #[serde(default)]
    pub options: PackOptions,
}

impl RouterConfig {
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        Ok(serde_yaml::from_reader(reader)?)
    }

    pub fn from_path<P: AsRef<Path>>(config_file_path: P) -> Result<Self> {
        let config_file = File::open(config_file_path)?;
        Self::from_reader(BufReader::new(config_file))
    }
}

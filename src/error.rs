use std::io;
use std::num;

use thiserror::Error;

use crate::region::RegionTruncated;

pub type Result<T> = std::result::Result<T, PackError>;

#[derive(Error, Debug)]
pub enum PackError {
    #[error("io error: {0}")]
    IoError(io::Error),
    #[error("bincode error: {0}")]
    BincodeError(#[from] bincode::Error),
    #[error("int conversion error: {0}")]
    TryFromIntError(#[from] num::TryFromIntError),
    #[error("corrupt archive: {0}")]
    Corrupted(String),
    #[error("entry not found: {0}")]
    EntryNotFound(String),
    #[error("entry already exists: {0}")]
    DuplicateEntry(String),
    #[error("invalid inner path: {0}")]
    InvalidPath(String),
    #[error("archive was opened read-only")]
    ReadOnly,
    #[error("archive is closed")]
    Closed,
    #[error("invalid configuration: {0}")]
    ConfigError(#[from] serde_yaml::Error),
}

impl PackError {
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::Corrupted(msg.into())
    }

    pub fn entry_not_found(inner_path: impl Into<String>) -> Self {
        Self::EntryNotFound(inner_path.into())
    }

    pub fn duplicate_entry(inner_path: impl Into<String>) -> Self {
        Self::DuplicateEntry(inner_path.into())
    }

    pub fn invalid_path(msg: impl Into<String>) -> Self {
        Self::InvalidPath(msg.into())
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupted(_))
    }
}

// Region streams report truncation through io::Error so they can implement
// `Read`; unwrap it back into a corruption error here.
impl From<io::Error> for PackError {
    fn from(e: io::Error) -> Self {
        let truncated = e
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<RegionTruncated>())
            .map(|t| t.to_string());
        match truncated {
            Some(msg) => Self::Corrupted(msg),
            None => Self::IoError(e),
        }
    }
}

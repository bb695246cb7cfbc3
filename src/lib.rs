//! Reading and in-place editing of FTL resource archives.
//!
//! Two on-disk formats are supported, the legacy offset-table format
//! ([`DatPack`]) and the hashed, optionally compressed format ([`PkgPack`]).
//! [`FolderPack`] exposes a plain directory through the same [`Pack`]
//! contract.

mod archive;
mod config;
mod dat;
mod error;
mod folder;
mod pkg;
mod region;
mod router;

pub use archive::{Pack, PathAndSize, RepackResult};
pub use config::{OpenMode, PackOptions, RouterConfig};
pub use dat::{DatEntry, DatPack};
pub use error::{PackError, Result};
pub use folder::FolderPack;
pub use pkg::{path_hash, PkgEntry, PkgPack, PKG_SIGNATURE};
pub use region::{RegionReader, RegionTruncated, DEFAULT_CHUNK_SIZE};
pub use router::{detect_format, open_pack, open_pack_as, PackFormat, PackRouter, Route};

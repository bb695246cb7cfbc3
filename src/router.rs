use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use crate::archive::Pack;
use crate::config::{OpenMode, PackOptions, RouterConfig};
use crate::dat::DatPack;
use crate::folder::FolderPack;
use crate::pkg::{PkgPack, PKG_SIGNATURE};
use crate::region::read_fully_at;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackFormat {
    Dat,
    Pkg,
    Folder,
}

/// Guesses the container format of an existing file or directory.
pub fn detect_format<P: AsRef<Path>>(path: P) -> Result<PackFormat> {
    let path = path.as_ref();
    if path.is_dir() {
        return Ok(PackFormat::Folder);
    }
    let file = File::open(path)?;
    let mut signature = [0u8; 4];
    let n = read_fully_at(&file, &mut signature, 0)?;
    if n == signature.len() && &signature == PKG_SIGNATURE {
        Ok(PackFormat::Pkg)
    } else {
        Ok(PackFormat::Dat)
    }
}

/// Format used when creating `path` from scratch: an existing pack keeps its
/// format, otherwise a `.pkg` extension selects PKG and anything else DAT.
fn format_for_creation(path: &Path) -> Result<PackFormat> {
    if path.exists() {
        return detect_format(path);
    }
    let is_pkg = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("pkg"))
        .unwrap_or(false);
    Ok(if is_pkg {
        PackFormat::Pkg
    } else {
        PackFormat::Dat
    })
}

pub fn open_pack_as<P: AsRef<Path>>(
    path: P,
    format: PackFormat,
    mode: OpenMode,
    options: PackOptions,
) -> Result<Box<dyn Pack>> {
    let pack: Box<dyn Pack> = match format {
        PackFormat::Dat => Box::new(DatPack::open_with_options(path, mode, options)?),
        PackFormat::Pkg => Box::new(PkgPack::open_with_options(path, mode, options)?),
        PackFormat::Folder => Box::new(FolderPack::open(path, mode)?),
    };
    Ok(pack)
}

/// Opens `path` with whichever codec its content calls for.
pub fn open_pack<P: AsRef<Path>>(
    path: P,
    mode: OpenMode,
    options: PackOptions,
) -> Result<Box<dyn Pack>> {
    let path = path.as_ref();
    let format = match mode {
        OpenMode::Create => format_for_creation(path)?,
        _ => detect_format(path)?,
    };
    log::debug!("Opening '{}' as {:?}", path.display(), format);
    open_pack_as(path, format, mode, options)
}

/// Where a virtual path should be stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Pack(usize),
    Ignore,
}

/// Dispatches virtual paths to packs by their top-level segment.
pub struct PackRouter {
    packs: Vec<Box<dyn Pack>>,
    routes: HashMap<String, usize>,
    ignored: HashSet<String>,
    default_pack: usize,
}

fn normalize_segment(segment: &str) -> String {
    let segment = segment.trim_matches('/');
    format!("{}/", segment)
}

fn top_level_segment(inner_path: &str) -> Option<&str> {
    inner_path.find('/').map(|end| &inner_path[..=end])
}

impl PackRouter {
    pub fn new(default_pack: Box<dyn Pack>) -> Self {
        Self {
            packs: vec![default_pack],
            routes: HashMap::new(),
            ignored: HashSet::new(),
            default_pack: 0,
        }
    }

    /// Registers another pack and returns its id.
    pub fn add_pack(&mut self, pack: Box<dyn Pack>) -> usize {
        self.packs.push(pack);
        self.packs.len() - 1
    }

    /// Sends every path under `segment` (e.g. `"audio/"`) to `pack_id`.
    pub fn route(&mut self, segment: &str, pack_id: usize) -> Result<()> {
        if pack_id >= self.packs.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no pack with id {}", pack_id),
            )
            .into());
        }
        let segment = normalize_segment(segment);
        self.ignored.remove(&segment);
        self.routes.insert(segment, pack_id);
        Ok(())
    }

    /// Paths under `segment` never reach any pack.
    pub fn ignore(&mut self, segment: &str) {
        let segment = normalize_segment(segment);
        self.routes.remove(&segment);
        self.ignored.insert(segment);
    }

    pub fn resolve(&self, inner_path: &str) -> Route {
        match top_level_segment(inner_path) {
            Some(segment) if self.ignored.contains(segment) => Route::Ignore,
            Some(segment) => Route::Pack(
                self.routes
                    .get(segment)
                    .copied()
                    .unwrap_or(self.default_pack),
            ),
            None => Route::Pack(self.default_pack),
        }
    }

    pub fn pack(&self, pack_id: usize) -> Option<&dyn Pack> {
        self.packs.get(pack_id).map(|pack| pack.as_ref())
    }

    pub fn pack_mut(&mut self, pack_id: usize) -> Option<&mut (dyn Pack + 'static)> {
        self.packs.get_mut(pack_id).map(|pack| pack.as_mut())
    }

    /// The pack owning `inner_path`, or `None` when the path is ignored.
    pub fn pack_for(&self, inner_path: &str) -> Option<&dyn Pack> {
        match self.resolve(inner_path) {
            Route::Pack(pack_id) => self.pack(pack_id),
            Route::Ignore => None,
        }
    }

    pub fn pack_for_mut(&mut self, inner_path: &str) -> Option<&mut (dyn Pack + 'static)> {
        match self.resolve(inner_path) {
            Route::Pack(pack_id) => self.pack_mut(pack_id),
            Route::Ignore => None,
        }
    }

    pub fn pack_count(&self) -> usize {
        self.packs.len()
    }

    /// Closes every pack, reporting the first failure.
    pub fn close(&mut self) -> Result<()> {
        let mut result = Ok(());
        for pack in self.packs.iter_mut() {
            if let Err(e) = pack.close() {
                log::error!("Failed to close {} pack: {}", pack.name(), e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Opens the packs a configuration names. A file named more than once is
    /// opened once and shared by its routes.
    pub fn from_config(config: &RouterConfig, mode: OpenMode) -> Result<Self> {
        let default_pack = open_pack(&config.default, mode, config.options.clone())?;
        let mut router = Self::new(default_pack);
        let mut opened: HashMap<PathBuf, usize> = HashMap::new();
        opened.insert(config.default.clone(), router.default_pack);

        let mut routes: Vec<(&String, &PathBuf)> = config.routes.iter().collect();
        routes.sort();
        for (segment, pack_path) in routes {
            let pack_id = match opened.get(pack_path) {
                Some(&pack_id) => pack_id,
                None => {
                    let pack = open_pack(pack_path, mode, config.options.clone())?;
                    let pack_id = router.add_pack(pack);
                    opened.insert(pack_path.clone(), pack_id);
                    pack_id
                }
            };
            router.route(segment, pack_id)?;
        }
        for segment in &config.ignore {
            router.ignore(segment);
        }
        log::debug!(
            "Router ready: {} packs, {} routes, {} ignored segments",
            router.packs.len(),
            router.routes.len(),
            router.ignored.len()
        );
        Ok(router)
    }
}

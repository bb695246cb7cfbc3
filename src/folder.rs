use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};

use crate::archive::{check_inner_path, Pack, PathAndSize, RepackResult};
use crate::config::OpenMode;
use crate::{PackError, Result};
use walkdir::WalkDir;

/// Stores every entry as a plain file under one root directory.
#[derive(Debug)]
pub struct FolderPack {
    root: PathBuf,
    writable: bool,
    closed: bool,
}

impl FolderPack {
    /// Opens the directory at `root`. `OpenMode::Create` creates it when
    /// missing but never erases existing files.
    pub fn open<P: AsRef<Path>>(root: P, mode: OpenMode) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if mode == OpenMode::Create {
            fs::create_dir_all(&root)?;
        }
        if !root.is_dir() {
            return Err(PackError::IoError(io::Error::new(
                io::ErrorKind::NotFound,
                format!("'{}' is not a directory", root.display()),
            )));
        }
        log::debug!("Opened folder pack '{}'", root.display());
        Ok(Self {
            root,
            writable: mode.is_writable(),
            closed: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(PackError::Closed);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if !self.writable {
            return Err(PackError::ReadOnly);
        }
        Ok(())
    }

    /// Maps an inner path to a location under the root. Resolution is purely
    /// lexical: `..` may not climb above the root and absolute paths are
    /// refused.
    fn resolve(&self, inner_path: &str) -> Result<PathBuf> {
        check_inner_path(inner_path)?;
        let mut components: Vec<&str> = Vec::new();
        for component in Path::new(inner_path).components() {
            match component {
                Component::Normal(name) => components.push(name.to_str().ok_or_else(|| {
                    PackError::invalid_path(format!("'{}' is not valid UTF-8", inner_path))
                })?),
                Component::CurDir => {}
                Component::ParentDir => {
                    if components.pop().is_none() {
                        return Err(PackError::invalid_path(format!(
                            "'{}' escapes the pack root",
                            inner_path
                        )));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(PackError::invalid_path(format!(
                        "'{}' is absolute",
                        inner_path
                    )));
                }
            }
        }
        let mut resolved = self.root.clone();
        resolved.extend(components);
        Ok(resolved)
    }

    fn resolve_entry(&self, inner_path: &str) -> Result<PathBuf> {
        self.check_open()?;
        let path = self.resolve(inner_path)?;
        if !path.is_file() {
            return Err(PackError::entry_not_found(inner_path));
        }
        Ok(path)
    }

    fn open_entry(&self, inner_path: &str) -> Result<File> {
        let path = self.resolve_entry(inner_path)?;
        File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => PackError::entry_not_found(inner_path),
            _ => e.into(),
        })
    }

    /// Collects every regular file below the root. Symlinks are not
    /// followed.
    fn walk(&self) -> Result<Vec<PathAndSize>> {
        self.check_open()?;
        let mut found = Vec::new();
        let walker = WalkDir::new(&self.root).follow_links(false).into_iter();
        for entry in walker {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            match self.inner_path_of(entry.path()) {
                Some(inner_path) => found.push(PathAndSize {
                    inner_path,
                    size: entry.metadata().map_err(io::Error::from)?.len(),
                }),
                None => log::warn!("Skipping '{}': not valid UTF-8", entry.path().display()),
            }
        }
        Ok(found)
    }

    fn inner_path_of(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let components = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<&str>>>()?;
        Some(components.join("/"))
    }
}

impl Pack for FolderPack {
    fn name(&self) -> &'static str {
        "Folder"
    }

    fn list(&self) -> Result<Vec<String>> {
        Ok(self.walk()?.into_iter().map(|e| e.inner_path).collect())
    }

    fn list_sizes(&self) -> Result<Vec<PathAndSize>> {
        self.walk()
    }

    fn add(&mut self, inner_path: &str, source: &mut dyn Read) -> Result<()> {
        self.check_writable()?;
        let path = self.resolve(inner_path)?;
        if path == self.root || path.exists() {
            return Err(PackError::duplicate_entry(inner_path));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => PackError::duplicate_entry(inner_path),
                _ => e.into(),
            })?;
        let copied = io::copy(source, &mut file).and_then(|_| file.flush());
        if let Err(e) = copied {
            drop(file);
            let _ = fs::remove_file(&path);
            return Err(e.into());
        }
        log::trace!("Added '{}' to folder '{}'", inner_path, self.root.display());
        Ok(())
    }

    fn extract_to(&self, inner_path: &str, sink: &mut dyn Write) -> Result<()> {
        let mut file = self.open_entry(inner_path)?;
        io::copy(&mut file, sink)?;
        Ok(())
    }

    fn remove(&mut self, inner_path: &str) -> Result<()> {
        self.check_writable()?;
        let path = self.resolve_entry(inner_path)?;
        fs::remove_file(path)?;
        Ok(())
    }

    fn contains(&self, inner_path: &str) -> bool {
        !self.closed
            && self
                .resolve(inner_path)
                .map(|path| path.exists())
                .unwrap_or(false)
    }

    fn open_read_stream(&self, inner_path: &str) -> Result<Box<dyn Read + '_>> {
        Ok(Box::new(BufReader::new(self.open_entry(inner_path)?)))
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }

    /// A directory has no holes to reclaim; reports its total size.
    fn repack(&mut self) -> Result<RepackResult> {
        self.check_writable()?;
        let length = self.walk()?.iter().map(|e| e.size).sum();
        Ok(RepackResult {
            old_length: length,
            new_length: length,
            bytes_rewritten: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use tempfile::tempdir;

    fn extract(pack: &FolderPack, inner_path: &str) -> Vec<u8> {
        let mut content = Vec::new();
        pack.extract_to(inner_path, &mut content).unwrap();
        content
    }

    #[test]
    fn test_add_extract_remove() {
        let temp_dir = tempdir().unwrap();
        let mut pack = FolderPack::open(temp_dir.path(), OpenMode::ReadWrite).unwrap();
        pack.add("data/events.xml", &mut &b"<events/>"[..]).unwrap();
        assert!(temp_dir.path().join("data/events.xml").is_file());
        assert_eq!(b"<events/>".to_vec(), extract(&pack, "data/events.xml"));
        assert!(pack.contains("data/events.xml"));
        // Directories are not entries but still "contained"
        assert!(pack.contains("data"));
        assert!(matches!(
            pack.add("data/events.xml", &mut &b"again"[..]),
            Err(PackError::DuplicateEntry(_))
        ));

        pack.remove("data/events.xml").unwrap();
        assert!(!pack.contains("data/events.xml"));
        assert!(matches!(
            pack.remove("data/events.xml"),
            Err(PackError::EntryNotFound(_))
        ));
        assert!(matches!(
            pack.remove("data"),
            Err(PackError::EntryNotFound(_))
        ));
        pack.add("data/events.xml", &mut &b"v2"[..]).unwrap();
        assert_eq!(b"v2".to_vec(), extract(&pack, "data/events.xml"));
    }

    #[test]
    fn test_rejects_paths_outside_root() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path().join("root");
        let mut pack = FolderPack::open(&root, OpenMode::Create).unwrap();
        for bad_path in &["../escape.txt", "a/../../escape.txt", "/etc/passwd", "a\\b.txt", ""] {
            assert!(
                matches!(pack.add(bad_path, &mut &b"x"[..]), Err(PackError::InvalidPath(_))),
                "{}",
                bad_path
            );
        }
        assert!(!temp_dir.path().join("escape.txt").exists());
        // Climbing back down inside the root is fine
        pack.add("a/../b.txt", &mut &b"b"[..]).unwrap();
        assert!(root.join("b.txt").is_file());
        assert!(matches!(pack.add(".", &mut &b"x"[..]), Err(PackError::DuplicateEntry(_))));
    }

    #[test]
    fn test_list_matches_walkdir() {
        let temp_dir = tempdir().unwrap();
        let mut pack = FolderPack::open(temp_dir.path(), OpenMode::ReadWrite).unwrap();
        let names = [
            "data/blueprints.xml",
            "img/ship/kestral.png",
            "img/ship/gibs/kestral_gib1.png",
            "audio/waves/ui/select.ogg",
            "readme.txt",
        ];
        for (i, name) in names.iter().enumerate() {
            pack.add(name, &mut vec![b'x'; i * 10].as_slice()).unwrap();
        }
        fs::create_dir_all(temp_dir.path().join("empty/dir")).unwrap();

        let listed: HashSet<String> = pack.list().unwrap().into_iter().collect();
        let walked: HashSet<String> = WalkDir::new(temp_dir.path())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                e.path()
                    .strip_prefix(temp_dir.path())
                    .unwrap()
                    .components()
                    .map(|c| c.as_os_str().to_str().unwrap())
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .collect();
        assert_eq!(walked, listed);
        assert_eq!(names.len(), listed.len());

        let sizes: HashSet<PathAndSize> = pack.list_sizes().unwrap().into_iter().collect();
        for (i, name) in names.iter().enumerate() {
            assert!(sizes.contains(&PathAndSize {
                inner_path: name.to_string(),
                size: i as u64 * 10,
            }));
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_list_does_not_follow_symlinks() {
        let temp_dir = tempdir().unwrap();
        let outside = temp_dir.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("secret.txt"), b"secret").unwrap();
        let root = temp_dir.path().join("root");
        let mut pack = FolderPack::open(&root, OpenMode::Create).unwrap();
        pack.add("data/kept.xml", &mut &b"kept"[..]).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("linked")).unwrap();
        std::os::unix::fs::symlink(outside.join("secret.txt"), root.join("data/alias.txt"))
            .unwrap();

        assert_eq!(vec!["data/kept.xml".to_string()], pack.list().unwrap());
        let sizes = pack.list_sizes().unwrap();
        assert_eq!(1, sizes.len());
        assert_eq!(4, sizes[0].size);
    }

    #[test]
    fn test_missing_entries() {
        let temp_dir = tempdir().unwrap();
        let pack = FolderPack::open(temp_dir.path(), OpenMode::Read).unwrap();
        let mut sink = Vec::new();
        assert!(matches!(
            pack.extract_to("nothing.txt", &mut sink),
            Err(PackError::EntryNotFound(_))
        ));
        assert!(matches!(
            pack.open_read_stream("nothing.txt"),
            Err(PackError::EntryNotFound(_))
        ));
        assert!(FolderPack::open(temp_dir.path().join("missing"), OpenMode::Read).is_err());
    }

    #[test]
    fn test_read_only_repack_and_close() {
        let temp_dir = tempdir().unwrap();
        {
            let mut pack = FolderPack::open(temp_dir.path(), OpenMode::ReadWrite).unwrap();
            pack.add("a.txt", &mut &[1u8; 100][..]).unwrap();
            pack.add("b/c.txt", &mut &[2u8; 50][..]).unwrap();
            let result = pack.repack().unwrap();
            assert_eq!(150, result.old_length);
            assert_eq!(150, result.new_length);
            assert_eq!(0, result.bytes_rewritten);
        }
        let mut pack = FolderPack::open(temp_dir.path(), OpenMode::Read).unwrap();
        assert!(matches!(pack.add("d.txt", &mut &b"d"[..]), Err(PackError::ReadOnly)));
        assert!(matches!(pack.remove("a.txt"), Err(PackError::ReadOnly)));
        let mut streamed = Vec::new();
        pack.open_read_stream("b/c.txt")
            .unwrap()
            .read_to_end(&mut streamed)
            .unwrap();
        assert_eq!(vec![2u8; 50], streamed);
        pack.close().unwrap();
        assert!(matches!(pack.list(), Err(PackError::Closed)));
        assert!(!pack.contains("a.txt"));
    }
}

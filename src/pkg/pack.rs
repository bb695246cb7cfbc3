use std::cmp;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{
    parse_pkg_header, parse_pkg_records, path_hash, paths_region_offset, pkg_bincode,
    record_offset, PkgEntry, PkgRecord, SerializablePkgHeader, DEFLATED_FLAG, ENTRY_SIZE,
    HEADER_SIZE,
};
use crate::archive::{
    check_inner_path, copy_within_file, read_exact_at, serialize_to_ascii, string_from_ascii,
    write_all_at, CountingReader, Pack, PathAndSize, RepackResult,
};
use crate::config::{OpenMode, PackOptions};
use crate::region::RegionReader;
use crate::{PackError, Result};
use bincode::Options;
use flate2::read::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;

/// A PKG archive, edited in place.
#[derive(Debug)]
pub struct PkgPack {
    path: PathBuf,
    file: Option<File>,
    writable: bool,
    options: PackOptions,
    entries: Vec<Option<PkgEntry>>,
    path_to_index: HashMap<String, usize>,
    paths_region_size: u32,
    // End of the last live path; everything after it is free
    paths_region_used: u32,
}

impl PkgPack {
    pub fn open<P: AsRef<Path>>(pkg_path: P, mode: OpenMode) -> Result<Self> {
        Self::open_with_options(pkg_path, mode, PackOptions::default())
    }

    pub fn open_with_options<P: AsRef<Path>>(
        pkg_path: P,
        mode: OpenMode,
        options: PackOptions,
    ) -> Result<Self> {
        let path = pkg_path.as_ref().to_path_buf();
        let file = match mode {
            OpenMode::Read => File::open(&path)?,
            OpenMode::ReadWrite => OpenOptions::new().read(true).write(true).open(&path)?,
            OpenMode::Create => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?,
        };
        let mut pack = Self {
            path,
            file: Some(file),
            writable: mode.is_writable(),
            options,
            entries: Vec::new(),
            path_to_index: HashMap::new(),
            paths_region_size: 0,
            paths_region_used: 0,
        };
        if mode == OpenMode::Create {
            pack.create_index(pack.options.initial_index_size)?;
        } else {
            pack.read_index()?;
        }
        log::debug!(
            "Opened PKG '{}': {} entries in {} records, {} bytes of paths",
            pack.path.display(),
            pack.path_to_index.len(),
            pack.entries.len(),
            pack.paths_region_size
        );
        Ok(pack)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records in the entry array, vacant ones included.
    pub fn index_size(&self) -> usize {
        self.entries.len()
    }

    pub fn paths_region_size(&self) -> u32 {
        self.paths_region_size
    }

    pub fn compress_new_additions(&self) -> bool {
        self.options.compress_new_additions
    }

    /// Only affects entries added from now on.
    pub fn set_compress_new_additions(&mut self, compress: bool) {
        self.options.compress_new_additions = compress;
    }

    fn file(&self) -> Result<&File> {
        self.file.as_ref().ok_or(PackError::Closed)
    }

    fn check_writable(&self) -> Result<()> {
        self.file()?;
        if !self.writable {
            return Err(PackError::ReadOnly);
        }
        Ok(())
    }

    fn corrupted(&self, msg: impl std::fmt::Display) -> PackError {
        PackError::corrupted(format!("{}: {}", self.path.display(), msg))
    }

    fn entry(&self, inner_path: &str) -> Result<&PkgEntry> {
        self.path_to_index
            .get(inner_path)
            .and_then(|&index| self.entries[index].as_ref())
            .ok_or_else(|| PackError::entry_not_found(inner_path))
    }

    fn live_entries(&self) -> impl Iterator<Item = &PkgEntry> {
        self.entries.iter().flatten()
    }

    fn create_index(&mut self, index_size: u32) -> Result<()> {
        self.file()?.set_len(0)?;
        self.entries.clear();
        self.path_to_index.clear();
        self.paths_region_size = 0;
        self.paths_region_used = 0;
        self.write_header()?;
        self.grow_index(index_size)
    }

    fn read_index(&mut self) -> Result<()> {
        let file = self.file()?;
        let file_length = file.metadata()?.len();

        let mut header_buf = [0u8; HEADER_SIZE as usize];
        read_exact_at(file, &mut header_buf, 0)
            .map_err(|_| self.corrupted("file is too short to hold a header"))?;
        let (_, header) = parse_pkg_header(&header_buf)
            .map_err(|_| self.corrupted("bad signature"))?;
        if u64::from(header.header_size) != HEADER_SIZE {
            return Err(self.corrupted(format!(
                "unexpected header size {}",
                header.header_size
            )));
        }
        if u64::from(header.entry_size) != ENTRY_SIZE {
            return Err(self.corrupted(format!(
                "unexpected entry size {}",
                header.entry_size
            )));
        }
        let entry_count = header.entry_count as usize;
        let paths_offset = paths_region_offset(entry_count);
        let paths_end = paths_offset + u64::from(header.paths_region_size);
        if paths_end > file_length {
            return Err(self.corrupted(format!(
                "{} records and {} bytes of paths exceed file length {}",
                entry_count, header.paths_region_size, file_length
            )));
        }

        let mut records_buf = vec![0u8; entry_count * ENTRY_SIZE as usize];
        read_exact_at(file, &mut records_buf, HEADER_SIZE)?;
        let (_, records) = parse_pkg_records(&records_buf, entry_count)
            .map_err(|_| self.corrupted("failed to parse entry records"))?;
        let mut paths = vec![0u8; header.paths_region_size as usize];
        read_exact_at(file, &mut paths, paths_offset)?;

        let mut entries = Vec::with_capacity(entry_count);
        let mut path_to_index = HashMap::with_capacity(entry_count);
        let mut paths_region_used = 0;
        for (index, record) in records.into_iter().enumerate() {
            if record.is_vacant() {
                entries.push(None);
                continue;
            }
            let entry = self.read_entry(&record, &paths, file_length)?;
            if path_to_index.contains_key(&entry.inner_path) {
                return Err(self.corrupted(format!(
                    "inner path '{}' occurs more than once",
                    entry.inner_path
                )));
            }
            paths_region_used = cmp::max(
                paths_region_used,
                entry.inner_path_offset + entry.path_length() as u32,
            );
            path_to_index.insert(entry.inner_path.clone(), index);
            entries.push(Some(entry));
        }
        self.entries = entries;
        self.path_to_index = path_to_index;
        self.paths_region_size = header.paths_region_size;
        self.paths_region_used = paths_region_used;
        Ok(())
    }

    fn read_entry(
        &self,
        record: &PkgRecord,
        paths: &[u8],
        file_length: u64,
    ) -> Result<PkgEntry> {
        let path_offset = record.path_offset() as usize;
        let path_bytes = paths
            .get(path_offset..)
            .and_then(|tail| tail.iter().position(|&b| b == 0).map(|end| &tail[..end]))
            .ok_or_else(|| {
                self.corrupted(format!("no terminated path at paths offset {}", path_offset))
            })?;
        let inner_path = string_from_ascii(path_bytes).map_err(|e| self.corrupted(e))?;
        let entry = PkgEntry {
            inner_path_offset: record.path_offset(),
            inner_path_hash: record.hash,
            data_offset: u64::from(record.data_offset),
            data_size: u64::from(record.data_size),
            unpacked_size: u64::from(record.unpacked_size),
            data_deflated: record.is_deflated(),
            inner_path,
        };
        if entry.data_end() > file_length {
            return Err(self.corrupted(format!(
                "data of '{}' ends at {}, past the end of file",
                entry.inner_path,
                entry.data_end()
            )));
        }
        let expected_hash = path_hash(&entry.inner_path);
        if expected_hash != entry.inner_path_hash {
            log::warn!(
                "{}: stored hash {:08x} of '{}' should be {:08x}",
                self.path.display(),
                entry.inner_path_hash,
                entry.inner_path,
                expected_hash
            );
        }
        Ok(entry)
    }

    fn write_header(&self) -> Result<()> {
        let header = SerializablePkgHeader::new(
            u32::try_from(self.entries.len())?,
            self.paths_region_size,
        );
        let mut buf = Vec::with_capacity(HEADER_SIZE as usize);
        pkg_bincode().serialize_into(&mut buf, &header)?;
        write_all_at(self.file()?, &buf, 0)
    }

    fn serialize_record(entry: Option<&PkgEntry>) -> Result<Vec<u8>> {
        let record = match entry {
            None => PkgRecord::default(),
            Some(entry) => {
                let mut path_offset_and_flags = entry.inner_path_offset;
                if entry.data_deflated {
                    path_offset_and_flags |= DEFLATED_FLAG;
                }
                PkgRecord {
                    hash: entry.inner_path_hash,
                    path_offset_and_flags,
                    data_offset: u32::try_from(entry.data_offset)?,
                    data_size: u32::try_from(entry.data_size)?,
                    unpacked_size: u32::try_from(entry.unpacked_size)?,
                }
            }
        };
        let mut buf = Vec::with_capacity(ENTRY_SIZE as usize);
        pkg_bincode().serialize_into(&mut buf, &record)?;
        Ok(buf)
    }

    fn write_record(&self, index: usize) -> Result<()> {
        let buf = Self::serialize_record(self.entries[index].as_ref())?;
        write_all_at(self.file()?, &buf, record_offset(index))
    }

    fn first_vacancy(&self) -> Option<usize> {
        self.entries.iter().position(Option::is_none)
    }

    /// Live record indices, ordered by where their data sits. Empty entries
    /// sort before others sharing their offset.
    fn live_indices_by_data_offset(&self) -> Vec<usize> {
        let mut order: Vec<(u64, u64, usize)> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(index, e)| e.as_ref().map(|e| (e.data_offset, e.data_size, index)))
            .collect();
        order.sort_unstable();
        order.into_iter().map(|(_, _, index)| index).collect()
    }

    fn earliest_entry(&self) -> Option<(usize, u64)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, e)| e.as_ref().map(|e| (index, e.data_offset)))
            .min_by_key(|&(_, data_offset)| data_offset)
    }

    /// Moves an entry's data past both the end of file and `min_offset`.
    /// Returns the number of bytes copied.
    fn move_entry_data(&mut self, index: usize, min_offset: u64) -> Result<u64> {
        let file = self.file()?;
        let new_offset = cmp::max(file.metadata()?.len(), min_offset);
        u32::try_from(new_offset)?;
        let entry = self.entries[index]
            .as_ref()
            .ok_or_else(|| self.corrupted(format!("record {} is vacant", index)))?;
        let (old_offset, data_size) = (entry.data_offset, entry.data_size);
        copy_within_file(
            file,
            old_offset,
            new_offset,
            data_size,
            self.options.chunk_size,
        )?;
        if let Some(entry) = self.entries[index].as_mut() {
            entry.data_offset = new_offset;
        }
        self.write_record(index)?;
        log::trace!(
            "Moved PKG data of record {} from {} to {} ({} bytes)",
            index,
            old_offset,
            new_offset,
            data_size
        );
        Ok(data_size)
    }

    /// Grows the entry array by `amount` records and the paths region along
    /// with it, pushing away any entry data in the way.
    pub fn grow_index(&mut self, amount: u32) -> Result<()> {
        self.check_writable()?;
        let old_count = self.entries.len();
        let new_count = old_count + amount as usize;
        let path_bytes = cmp::max(self.options.path_bytes_per_slot, 1);
        let new_paths_size = u32::try_from(
            u64::from(self.paths_region_size) + u64::from(amount) * u64::from(path_bytes),
        )?;
        let boundary = paths_region_offset(new_count) + u64::from(new_paths_size);

        while let Some((index, data_offset)) = self.earliest_entry() {
            if data_offset >= boundary {
                break;
            }
            self.move_entry_data(index, boundary)?;
        }

        let file = self.file()?;
        let mut paths = vec![0u8; new_paths_size as usize];
        let old_paths_size = self.paths_region_size as usize;
        read_exact_at(
            file,
            &mut paths[..old_paths_size],
            paths_region_offset(old_count),
        )?;
        // The grown tail is zero from the old region's end onward
        write_all_at(file, &paths, paths_region_offset(new_count))?;
        let zeros = vec![0u8; amount as usize * ENTRY_SIZE as usize];
        write_all_at(file, &zeros, record_offset(old_count))?;

        self.entries.resize(new_count, None);
        self.paths_region_size = new_paths_size;
        self.write_header()?;
        log::debug!(
            "Grew PKG index to {} records, {} bytes of paths",
            new_count,
            new_paths_size
        );
        Ok(())
    }

    fn has_room_for(&self, path_length: u32) -> bool {
        self.first_vacancy().is_some()
            && self.paths_region_size - self.paths_region_used >= path_length
    }

    /// Streams `source` to `data_offset`, deflating it if requested.
    /// Returns the stored and unpacked sizes.
    fn append_data(
        &self,
        data_offset: u64,
        source: &mut dyn Read,
        deflate: bool,
    ) -> Result<(u64, u64)> {
        let mut writer = self.file()?;
        writer.seek(SeekFrom::Start(data_offset))?;
        if deflate {
            let counting_source = CountingReader::new(source);
            let mut encoder = ZlibEncoder::new(counting_source, Compression::default());
            let data_size = io::copy(&mut encoder, &mut writer)?;
            Ok((data_size, encoder.get_ref().count()))
        } else {
            let data_size = io::copy(source, &mut writer)?;
            Ok((data_size, data_size))
        }
    }
}

impl Pack for PkgPack {
    fn name(&self) -> &'static str {
        "PKG"
    }

    fn list(&self) -> Result<Vec<String>> {
        self.file()?;
        Ok(self.path_to_index.keys().cloned().collect())
    }

    fn list_sizes(&self) -> Result<Vec<PathAndSize>> {
        self.file()?;
        Ok(self
            .live_entries()
            .map(|e| PathAndSize {
                inner_path: e.inner_path.clone(),
                size: e.unpacked_size,
            })
            .collect())
    }

    fn add(&mut self, inner_path: &str, source: &mut dyn Read) -> Result<()> {
        self.check_writable()?;
        check_inner_path(inner_path)?;
        let mut path_buf = serialize_to_ascii(inner_path)?;
        if self.path_to_index.contains_key(inner_path) {
            return Err(PackError::duplicate_entry(inner_path));
        }
        let path_length = u32::try_from(path_buf.len() + 1)?;

        if !self.has_room_for(path_length) {
            let path_bytes = cmp::max(self.options.path_bytes_per_slot, 1);
            let amount = cmp::max(
                cmp::max(self.options.index_growth, 1),
                (path_length + path_bytes - 1) / path_bytes,
            );
            self.grow_index(amount)?;
            if !self.has_room_for(path_length) {
                return Err(self.corrupted("index did not grow"));
            }
        }
        let index = self
            .first_vacancy()
            .ok_or_else(|| self.corrupted("index did not grow"))?;

        let file = self.file()?;
        let inner_path_offset = self.paths_region_used;
        path_buf.push(0); // NUL char terminator
        write_all_at(
            file,
            &path_buf,
            paths_region_offset(self.entries.len()) + u64::from(inner_path_offset),
        )?;

        let data_offset = file.metadata()?.len();
        let deflate = self.options.compress_new_additions;
        let (data_size, unpacked_size) = match self.append_data(data_offset, source, deflate) {
            Ok(v) => v,
            Err(e) => {
                // Drop the partial data, nothing references it yet
                let _ = file.set_len(data_offset);
                return Err(e);
            }
        };
        let entry = PkgEntry {
            inner_path_offset,
            inner_path: inner_path.to_string(),
            inner_path_hash: path_hash(inner_path),
            data_offset,
            data_size,
            unpacked_size,
            data_deflated: deflate,
        };
        log::trace!(
            "Added '{}' to PKG record {} at {} ({} bytes, {} unpacked)",
            inner_path,
            index,
            data_offset,
            data_size,
            unpacked_size
        );
        self.entries[index] = Some(entry);
        if let Err(e) = self.write_record(index) {
            // Unreferenced data, same as a failed copy
            self.entries[index] = None;
            if let Ok(file) = self.file() {
                let _ = file.set_len(data_offset);
            }
            return Err(e);
        }
        self.path_to_index.insert(inner_path.to_string(), index);
        self.paths_region_used += path_length;
        Ok(())
    }

    fn extract_to(&self, inner_path: &str, sink: &mut dyn Write) -> Result<()> {
        let file = self.file()?;
        let entry = self.entry(inner_path)?;
        let mut reader = RegionReader::with_chunk_size(
            file,
            entry.data_offset,
            entry.data_size,
            self.options.chunk_size,
        );
        if !entry.data_deflated {
            io::copy(&mut reader, sink)?;
            return Ok(());
        }
        let unpacked_size = io::copy(&mut ZlibDecoder::new(reader), sink)?;
        if unpacked_size != entry.unpacked_size {
            return Err(self.corrupted(format!(
                "'{}' inflated to {} bytes, expected {}",
                inner_path, unpacked_size, entry.unpacked_size
            )));
        }
        Ok(())
    }

    fn remove(&mut self, inner_path: &str) -> Result<()> {
        self.check_writable()?;
        let index = *self
            .path_to_index
            .get(inner_path)
            .ok_or_else(|| PackError::entry_not_found(inner_path))?;
        let entry = self.entries[index]
            .take()
            .ok_or_else(|| self.corrupted(format!("record {} is vacant", index)))?;
        self.write_record(index)?;
        self.path_to_index.remove(inner_path);

        // Empty entries may sit exactly at the tail too
        let file = self.file()?;
        let at_tail = entry.data_end() == file.metadata()?.len()
            && self
                .live_entries()
                .all(|e| e.data_offset < entry.data_offset);
        if at_tail {
            file.set_len(entry.data_offset)?;
        }
        Ok(())
    }

    fn contains(&self, inner_path: &str) -> bool {
        self.file.is_some() && self.path_to_index.contains_key(inner_path)
    }

    fn open_read_stream(&self, inner_path: &str) -> Result<Box<dyn Read + '_>> {
        let file = self.file()?;
        let entry = self.entry(inner_path)?;
        let reader = RegionReader::with_chunk_size(
            file,
            entry.data_offset,
            entry.data_size,
            self.options.chunk_size,
        );
        if entry.data_deflated {
            Ok(Box::new(ZlibDecoder::new(reader)))
        } else {
            Ok(Box::new(reader))
        }
    }

    fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            if self.writable {
                file.sync_all()?;
            }
        }
        Ok(())
    }

    fn repack(&mut self) -> Result<RepackResult> {
        self.check_writable()?;
        let old_length = self.file()?.metadata()?.len();

        let order = self.live_indices_by_data_offset();
        for pair in order.windows(2) {
            if let (Some(a), Some(b)) = (&self.entries[pair[0]], &self.entries[pair[1]]) {
                if a.data_end() > b.data_offset {
                    return Err(self.corrupted(format!(
                        "entries '{}' and '{}' overlap",
                        a.inner_path, b.inner_path
                    )));
                }
            }
        }

        let live_count = order.len();
        let paths_size: u64 = self.live_entries().map(PkgEntry::path_length).sum();
        let paths_size = u32::try_from(paths_size)?;
        let boundary = paths_region_offset(live_count) + u64::from(paths_size);
        let mut bytes_rewritten = 0;
        // Clear the space the compacted index and paths region need
        while let Some((index, data_offset)) = self.earliest_entry() {
            if data_offset >= boundary {
                break;
            }
            bytes_rewritten += self.move_entry_data(index, boundary)?;
        }

        // Final record order: by hash, then case-insensitive path
        let mut live: Vec<PkgEntry> = self.live_entries().cloned().collect();
        live.sort_by(|a, b| {
            a.inner_path_hash
                .cmp(&b.inner_path_hash)
                .then_with(|| a.inner_path.to_lowercase().cmp(&b.inner_path.to_lowercase()))
        });
        let mut paths = Vec::with_capacity(paths_size as usize);
        for entry in live.iter_mut() {
            entry.inner_path_offset = u32::try_from(paths.len())?;
            paths.extend_from_slice(entry.inner_path.as_bytes());
            paths.push(0); // NUL char terminator
        }
        write_all_at(self.file()?, &paths, paths_region_offset(live_count))?;

        let mut new_offsets = HashMap::with_capacity(live_count);
        let mut pending_data_offset = boundary;
        for index in self.live_indices_by_data_offset() {
            if let Some(entry) = &self.entries[index] {
                if entry.data_offset != pending_data_offset {
                    copy_within_file(
                        self.file()?,
                        entry.data_offset,
                        pending_data_offset,
                        entry.data_size,
                        self.options.chunk_size,
                    )?;
                    bytes_rewritten += entry.data_size;
                }
                new_offsets.insert(entry.inner_path.clone(), pending_data_offset);
                pending_data_offset += entry.data_size;
            }
        }

        let mut records = Vec::with_capacity(live_count * ENTRY_SIZE as usize);
        for entry in live.iter_mut() {
            if let Some(&data_offset) = new_offsets.get(&entry.inner_path) {
                entry.data_offset = data_offset;
            }
            records.extend(Self::serialize_record(Some(&*entry))?);
        }
        write_all_at(self.file()?, &records, HEADER_SIZE)?;
        self.path_to_index = live
            .iter()
            .enumerate()
            .map(|(index, e)| (e.inner_path.clone(), index))
            .collect();
        self.entries = live.into_iter().map(Some).collect();
        self.paths_region_size = paths_size;
        self.paths_region_used = paths_size;
        self.write_header()?;
        self.file()?.set_len(pending_data_offset)?;

        let result = RepackResult {
            old_length,
            new_length: pending_data_offset,
            bytes_rewritten,
        };
        log::info!(
            "Repacked PKG '{}': {} -> {} bytes, {} bytes rewritten",
            self.path.display(),
            result.old_length,
            result.new_length,
            result.bytes_rewritten
        );
        Ok(result)
    }
}

impl Drop for PkgPack {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

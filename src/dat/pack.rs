use std::cmp;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{
    parse_hunk_header, parse_index_size, parse_slots, slot_offset, DatEntry,
    SerializableHunkHeader, HUNK_HEADER_SIZE, INDEX_COUNT_SIZE, SLOT_SIZE,
};
use crate::archive::{
    check_inner_path, copy_within_file, read_exact_at, serialize_to_ascii, string_from_ascii,
    write_all_at, Pack, PathAndSize, RepackResult,
};
use crate::config::{OpenMode, PackOptions};
use crate::region::RegionReader;
use crate::{PackError, Result};

/// A legacy offset-table archive, edited in place.
#[derive(Debug)]
pub struct DatPack {
    path: PathBuf,
    file: Option<File>,
    writable: bool,
    options: PackOptions,
    entries: Vec<Option<DatEntry>>,
    path_to_index: HashMap<String, usize>,
}

impl DatPack {
    pub fn open<P: AsRef<Path>>(dat_path: P, mode: OpenMode) -> Result<Self> {
        Self::open_with_options(dat_path, mode, PackOptions::default())
    }

    pub fn open_with_options<P: AsRef<Path>>(
        dat_path: P,
        mode: OpenMode,
        options: PackOptions,
    ) -> Result<Self> {
        let path = dat_path.as_ref().to_path_buf();
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
        };
        if mode == OpenMode::Create {
            pack.create_index(pack.options.initial_index_size)?;
        } else {
            pack.read_index()?;
        }
        log::debug!(
            "Opened DAT '{}': {} entries in {} slots",
            pack.path.display(),
            pack.path_to_index.len(),
            pack.entries.len()
        );
        Ok(pack)
    }

    /// Number of slots in the index, vacant ones included.
    pub fn index_size(&self) -> usize {
        self.entries.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
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

    fn entry(&self, inner_path: &str) -> Result<&DatEntry> {
        self.path_to_index
            .get(inner_path)
            .and_then(|&index| self.entries[index].as_ref())
            .ok_or_else(|| PackError::entry_not_found(inner_path))
    }

    fn create_index(&mut self, index_size: u32) -> Result<()> {
        let file = self.file()?;
        file.set_len(0)?;
        let mut header = Vec::with_capacity(slot_offset(index_size as usize) as usize);
        bincode::serialize_into(&mut header, &index_size)?;
        header.resize(slot_offset(index_size as usize) as usize, 0);
        write_all_at(file, &header, 0)?;
        self.entries = vec![None; index_size as usize];
        self.path_to_index.clear();
        Ok(())
    }

    fn read_index(&mut self) -> Result<()> {
        let file = self.file()?;
        let file_length = file.metadata()?.len();

        let mut index_size_buf = [0u8; INDEX_COUNT_SIZE as usize];
        read_exact_at(file, &mut index_size_buf, 0)
            .map_err(|_| self.corrupted("file is too short to hold a header"))?;
        let (_, index_size) = parse_index_size(&index_size_buf)
            .map_err(|_| self.corrupted("failed to parse header"))?;
        let index_size = index_size as usize;
        if slot_offset(index_size) > file_length {
            return Err(self.corrupted(format!(
                "index of {} slots exceeds file length {}",
                index_size, file_length
            )));
        }

        let mut slots_buf = vec![0u8; index_size * SLOT_SIZE as usize];
        read_exact_at(file, &mut slots_buf, INDEX_COUNT_SIZE)?;
        let (_, slots) = parse_slots(&slots_buf, index_size)
            .map_err(|_| self.corrupted("failed to parse index"))?;

        let mut entries = Vec::with_capacity(index_size);
        let mut path_to_index = HashMap::with_capacity(index_size);
        for (index, &entry_offset) in slots.iter().enumerate() {
            if entry_offset == 0 {
                entries.push(None);
                continue;
            }
            let entry = self.read_entry(file, u64::from(entry_offset), file_length)?;
            if path_to_index.contains_key(&entry.inner_path) {
                return Err(self.corrupted(format!(
                    "inner path '{}' occurs more than once",
                    entry.inner_path
                )));
            }
            path_to_index.insert(entry.inner_path.clone(), index);
            entries.push(Some(entry));
        }
        self.entries = entries;
        self.path_to_index = path_to_index;
        Ok(())
    }

    fn read_entry(&self, file: &File, entry_offset: u64, file_length: u64) -> Result<DatEntry> {
        let mut header_buf = [0u8; HUNK_HEADER_SIZE as usize];
        read_exact_at(file, &mut header_buf, entry_offset)
            .map_err(|_| self.corrupted(format!("entry at {} is out of bounds", entry_offset)))?;
        let (_, header) = parse_hunk_header(&header_buf)
            .map_err(|_| self.corrupted(format!("failed to parse entry at {}", entry_offset)))?;
        let path_offset = entry_offset + HUNK_HEADER_SIZE;
        let data_end = path_offset + u64::from(header.path_length) + u64::from(header.data_size);
        if data_end > file_length {
            return Err(self.corrupted(format!(
                "entry at {} ends at {}, past the end of file",
                entry_offset, data_end
            )));
        }
        let mut path_buf = vec![0u8; header.path_length as usize];
        read_exact_at(file, &mut path_buf, path_offset)?;
        let inner_path = string_from_ascii(&path_buf).map_err(|e| self.corrupted(e))?;
        Ok(DatEntry::new(
            entry_offset,
            inner_path,
            u64::from(header.data_size),
        ))
    }

    fn write_slot(&self, index: usize, entry_offset: u64) -> Result<()> {
        let entry_offset = u32::try_from(entry_offset)?;
        let mut buf = Vec::with_capacity(SLOT_SIZE as usize);
        bincode::serialize_into(&mut buf, &entry_offset)?;
        write_all_at(self.file()?, &buf, slot_offset(index))
    }

    fn write_index_size(&self, index_size: usize) -> Result<()> {
        let index_size = u32::try_from(index_size)?;
        let mut buf = Vec::with_capacity(INDEX_COUNT_SIZE as usize);
        bincode::serialize_into(&mut buf, &index_size)?;
        write_all_at(self.file()?, &buf, 0)
    }

    fn first_vacancy(&self) -> Option<usize> {
        self.entries.iter().position(Option::is_none)
    }

    /// Makes room for `amount` more slots, relocating the hunks closest to
    /// the header to the end of the file until the index can extend into the
    /// space they leave behind.
    pub fn grow_index(&mut self, amount: u32) -> Result<()> {
        self.check_writable()?;
        let amount = u64::from(amount);
        let free_room = loop {
            let vacancy_offset = slot_offset(self.entries.len());
            let earliest = self
                .entries
                .iter()
                .enumerate()
                .filter_map(|(index, e)| e.as_ref().map(|e| (index, e.entry_offset)))
                .min_by_key(|&(_, entry_offset)| entry_offset);
            match earliest {
                // Nothing after the index, grow freely
                None => break amount,
                Some((index, entry_offset)) => {
                    let room = entry_offset.saturating_sub(vacancy_offset) / SLOT_SIZE;
                    if room >= amount {
                        break amount;
                    }
                    self.move_entry_to_eof(index)?;
                }
            }
        };

        let vacancy_offset = slot_offset(self.entries.len());
        let zeros = vec![0u8; (free_room * SLOT_SIZE) as usize];
        write_all_at(self.file()?, &zeros, vacancy_offset)?;
        let new_size = self.entries.len() + free_room as usize;
        self.entries.resize(new_size, None);
        self.write_index_size(new_size)?;
        log::debug!("Grew DAT index to {} slots", new_size);
        Ok(())
    }

    fn move_entry_to_eof(&mut self, index: usize) -> Result<()> {
        let file = self.file()?;
        let new_offset = file.metadata()?.len();
        let entry = self.entries[index]
            .as_ref()
            .ok_or_else(|| self.corrupted(format!("slot {} is vacant", index)))?;
        let old_offset = entry.entry_offset;
        let hunk_length = entry.hunk_length();
        copy_within_file(
            file,
            old_offset,
            new_offset,
            hunk_length,
            self.options.chunk_size,
        )?;
        self.write_slot(index, new_offset)?;
        if let Some(entry) = self.entries[index].as_mut() {
            entry.relocate(new_offset);
        }
        log::trace!(
            "Moved DAT entry {} from {} to {} ({} bytes)",
            index,
            old_offset,
            new_offset,
            hunk_length
        );
        Ok(())
    }

    /// Writes a hunk at `entry_offset` and returns the number of data bytes
    /// drained from `source`.
    fn append_hunk(
        &self,
        entry_offset: u64,
        path_bytes: &[u8],
        source: &mut dyn Read,
    ) -> Result<u64> {
        let mut writer = self.file()?;
        writer.seek(SeekFrom::Start(entry_offset))?;
        let placeholder = SerializableHunkHeader {
            data_size: 0,
            path_length: u32::try_from(path_bytes.len())?,
        };
        bincode::serialize_into(&mut writer, &placeholder)?;
        writer.write_all(path_bytes)?;
        let data_size = io::copy(source, &mut writer)?;
        // Size is only known once the source is drained
        let data_size_u32 = u32::try_from(data_size)?;
        let mut buf = Vec::with_capacity(SLOT_SIZE as usize);
        bincode::serialize_into(&mut buf, &data_size_u32)?;
        write_all_at(writer, &buf, entry_offset)?;
        Ok(data_size)
    }
}

impl Pack for DatPack {
    fn name(&self) -> &'static str {
        "DAT"
    }

    fn list(&self) -> Result<Vec<String>> {
        self.file()?;
        Ok(self.path_to_index.keys().cloned().collect())
    }

    fn list_sizes(&self) -> Result<Vec<PathAndSize>> {
        self.file()?;
        Ok(self
            .entries
            .iter()
            .flatten()
            .map(|e| PathAndSize {
                inner_path: e.inner_path.clone(),
                size: e.data_size,
            })
            .collect())
    }

    fn add(&mut self, inner_path: &str, source: &mut dyn Read) -> Result<()> {
        self.check_writable()?;
        check_inner_path(inner_path)?;
        let path_bytes = serialize_to_ascii(inner_path)?;
        if self.path_to_index.contains_key(inner_path) {
            return Err(PackError::duplicate_entry(inner_path));
        }

        let index = match self.first_vacancy() {
            Some(index) => index,
            None => {
                self.grow_index(cmp::max(self.options.index_growth, 1))?;
                self.first_vacancy()
                    .ok_or_else(|| self.corrupted("index did not grow"))?
            }
        };

        let file = self.file()?;
        let entry_offset = file.metadata()?.len();
        let data_size = match self.append_hunk(entry_offset, &path_bytes, source) {
            Ok(v) => v,
            Err(e) => {
                // Drop the partial hunk, nothing references it yet
                let _ = file.set_len(entry_offset);
                return Err(e);
            }
        };
        if let Err(e) = self.write_slot(index, entry_offset) {
            // Unreferenced hunk, same as a failed copy
            let _ = file.set_len(entry_offset);
            return Err(e);
        }
        let entry = DatEntry::new(entry_offset, inner_path.to_string(), data_size);
        log::trace!(
            "Added '{}' to DAT slot {} at {} ({} bytes)",
            inner_path,
            index,
            entry_offset,
            data_size
        );
        self.entries[index] = Some(entry);
        self.path_to_index.insert(inner_path.to_string(), index);
        Ok(())
    }

    fn extract_to(&self, inner_path: &str, sink: &mut dyn Write) -> Result<()> {
        let mut reader = self.open_read_stream(inner_path)?;
        io::copy(&mut reader, sink)?;
        Ok(())
    }

    fn remove(&mut self, inner_path: &str) -> Result<()> {
        self.check_writable()?;
        let index = *self
            .path_to_index
            .get(inner_path)
            .ok_or_else(|| PackError::entry_not_found(inner_path))?;
        self.write_slot(index, 0)?;
        let entry = self.entries[index]
            .take()
            .ok_or_else(|| self.corrupted(format!("slot {} is vacant", index)))?;
        self.path_to_index.remove(inner_path);

        let file = self.file()?;
        if entry.hunk_end() == file.metadata()?.len() {
            file.set_len(entry.entry_offset)?;
        }
        Ok(())
    }

    fn contains(&self, inner_path: &str) -> bool {
        self.file.is_some() && self.path_to_index.contains_key(inner_path)
    }

    fn open_read_stream(&self, inner_path: &str) -> Result<Box<dyn Read + '_>> {
        let file = self.file()?;
        let entry = self.entry(inner_path)?;
        Ok(Box::new(RegionReader::with_chunk_size(
            file,
            entry.data_offset,
            entry.data_size,
            self.options.chunk_size,
        )))
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

        let mut live: Vec<DatEntry> = self.entries.iter().flatten().cloned().collect();
        live.sort_by_key(|e| e.entry_offset);
        for pair in live.windows(2) {
            if pair[0].hunk_end() > pair[1].entry_offset {
                return Err(self.corrupted(format!(
                    "entries '{}' and '{}' overlap",
                    pair[0].inner_path, pair[1].inner_path
                )));
            }
        }

        if live.len() != self.entries.len() {
            self.write_index_size(live.len())?;
        }
        let mut bytes_rewritten = 0;
        let mut pending_entry_offset = slot_offset(live.len());
        for (index, entry) in live.iter_mut().enumerate() {
            let hunk_length = entry.hunk_length();
            if entry.entry_offset != pending_entry_offset {
                copy_within_file(
                    self.file()?,
                    entry.entry_offset,
                    pending_entry_offset,
                    hunk_length,
                    self.options.chunk_size,
                )?;
                entry.relocate(pending_entry_offset);
                bytes_rewritten += hunk_length;
            }
            self.write_slot(index, entry.entry_offset)?;
            pending_entry_offset += hunk_length;
        }
        self.file()?.set_len(pending_entry_offset)?;

        self.path_to_index = live
            .iter()
            .enumerate()
            .map(|(index, e)| (e.inner_path.clone(), index))
            .collect();
        self.entries = live.into_iter().map(Some).collect();

        let result = RepackResult {
            old_length,
            new_length: pending_entry_offset,
            bytes_rewritten,
        };
        log::info!(
            "Repacked DAT '{}': {} -> {} bytes, {} bytes rewritten",
            self.path.display(),
            result.old_length,
            result.new_length,
            result.bytes_rewritten
        );
        Ok(result)
    }
}

impl Drop for DatPack {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

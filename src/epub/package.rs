use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::Path;

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::TranslateResult;

/// The whole book as an ordered set of named entries.
///
/// Entries are held in memory in their original order and re-zipped on demand, so a
/// snapshot can be taken after any document without touching the source file.
#[derive(Clone)]
pub struct EpubArchive {
    entries: Vec<ArchiveEntry>,
}

#[derive(Clone)]
pub struct ArchiveEntry {
    pub name: String,
    pub data: Vec<u8>,
    pub compression: CompressionMethod,
    pub last_modified: zip::DateTime,
    pub unix_mode: Option<u32>,
    pub is_dir: bool,
}

impl EpubArchive {
    pub fn from_bytes(bytes: &[u8]) -> TranslateResult<Self> {
        let mut zip = ZipArchive::new(Cursor::new(bytes))?;
        let mut entries = Vec::with_capacity(zip.len());
        for i in 0..zip.len() {
            let mut file = zip.by_index(i)?;
            let mut data = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut data)?;
            entries.push(ArchiveEntry {
                name: file.name().to_string(),
                data,
                compression: file.compression(),
                last_modified: file.last_modified().unwrap_or_default(),
                unix_mode: file.unix_mode(),
                is_dir: file.is_dir(),
            });
        }
        Ok(Self { entries })
    }

    pub fn read(path: &Path) -> TranslateResult<Self> {
        let mut f = File::open(path)?;
        let mut bytes = Vec::new();
        f.read_to_end(&mut bytes)?;
        Self::from_bytes(&bytes)
    }

    /// Entry content, or `None` when absent (or a directory).
    pub fn read_entry(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|e| !e.is_dir && e.name == name)
            .map(|e| e.data.as_slice())
    }

    /// Replace an entry's content in place, or append a new deflated entry.
    pub fn write_entry(&mut self, name: &str, data: Vec<u8>) {
        if let Some(ent) = self.entries.iter_mut().find(|e| !e.is_dir && e.name == name) {
            ent.data = data;
            return;
        }
        self.entries.push(ArchiveEntry {
            name: name.to_string(),
            data,
            compression: CompressionMethod::Deflated,
            last_modified: zip::DateTime::default(),
            unix_mode: None,
            is_dir: false,
        });
    }

    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    /// Serialize the current state to zip bytes, preserving entry order and options.
    pub fn to_bytes(&self) -> TranslateResult<Vec<u8>> {
        let mut zout = ZipWriter::new(Cursor::new(Vec::new()));
        for ent in &self.entries {
            let mut opts = SimpleFileOptions::default()
                .compression_method(ent.compression)
                .last_modified_time(ent.last_modified);
            if let Some(mode) = ent.unix_mode {
                opts = opts.unix_permissions(mode);
            }
            if ent.is_dir || ent.name.ends_with('/') {
                zout.add_directory(ent.name.as_str(), opts)?;
            } else {
                zout.start_file(ent.name.as_str(), opts)?;
                zout.write_all(&ent.data)?;
            }
        }
        let cursor = zout.finish()?;
        Ok(cursor.into_inner())
    }
}

//! Ordered backing store
//!
//! An ordered byte-keyed map held in memory, committed as a single image
//! either into a growable buffer or into a file. Reads and writes only touch
//! the map; `flush` is the only operation that persists anything.
//!
//! Image layout:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ magic: [u8; 4] = "TKV1"                 │
//! ├─────────────────────────────────────────┤
//! │ For each record, in key order:          │
//! │   key_len: u32                          │
//! │   key: [u8; key_len] (UTF-8)            │
//! │   value_len: u32                        │
//! │   value: [u8; value_len]                │
//! │   crc: u32 (CRC32 of everything above)  │
//! └─────────────────────────────────────────┘
//! ```

use crate::storage::error::{StorageError, StorageResult};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for image identification
const IMAGE_MAGIC: [u8; 4] = *b"TKV1";

/// Upper bound on a single key (sanity check while decoding)
const MAX_KEY_LEN: usize = 64 * 1024;

/// Upper bound on a single value (sanity check while decoding)
const MAX_VALUE_LEN: usize = 16 * 1024 * 1024;

/// Where committed images live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreHandle {
    /// Growable in-memory buffer holding the last committed image
    Memory(Vec<u8>),
    /// File holding the last committed image
    File(PathBuf),
}

impl StoreHandle {
    /// Fresh, empty in-memory handle
    pub fn memory() -> Self {
        StoreHandle::Memory(Vec::new())
    }

    /// File-backed handle
    pub fn file(path: impl Into<PathBuf>) -> Self {
        StoreHandle::File(path.into())
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, StoreHandle::Memory(_))
    }
}

/// Ordered key-value store over a memory buffer or a file
#[derive(Debug)]
pub struct BackingStore {
    handle: StoreHandle,
    entries: BTreeMap<String, Vec<u8>>,
    /// Mutations since the last commit
    dirty: bool,
    closed: bool,
}

impl BackingStore {
    /// Open a store, recreating it empty when the image is missing or unreadable
    pub fn open(handle: StoreHandle) -> StorageResult<Self> {
        let bytes = match &handle {
            StoreHandle::Memory(buf) => buf.clone(),
            StoreHandle::File(path) => match std::fs::read(path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                Err(e) => return Err(e.into()),
            },
        };

        let (entries, needs_rewrite) = match decode_image(&bytes) {
            Ok(entries) => (entries, bytes.is_empty()),
            Err(e) => {
                tracing::warn!("Backing image unreadable, recreating empty: {}", e);
                (BTreeMap::new(), true)
            }
        };

        let mut store = Self {
            handle,
            entries,
            dirty: false,
            closed: false,
        };

        if needs_rewrite {
            store.write_image()?;
        }

        tracing::debug!("Opened backing store with {} records", store.entries.len());
        Ok(store)
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.entries.insert(key.into(), value);
        self.dirty = true;
    }

    /// Remove a key, returning whether it was present
    pub fn delete(&mut self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.dirty = true;
        }
        removed
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// All keys in ascending order
    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Records in ascending key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every record (not persisted until the next flush)
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.entries.clear();
            self.dirty = true;
        }
    }

    pub fn is_memory(&self) -> bool {
        self.handle.is_memory()
    }

    pub fn has_pending(&self) -> bool {
        self.dirty
    }

    /// Commit the current map as the new image
    pub fn flush(&mut self) -> StorageResult<()> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        if !self.dirty {
            return Ok(());
        }
        self.write_image()?;
        self.dirty = false;
        Ok(())
    }

    /// Flush pending mutations and release the handle; closing twice is a no-op
    pub fn close(&mut self) -> StorageResult<()> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        self.closed = true;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Size of the committed image in bytes
    pub fn image_size(&self) -> u64 {
        match &self.handle {
            StoreHandle::Memory(buf) => buf.len() as u64,
            StoreHandle::File(path) => std::fs::metadata(path).map(|m| m.len()).unwrap_or(0),
        }
    }

    /// Committed image of an in-memory store
    #[cfg(test)]
    pub(crate) fn image(&self) -> Option<&[u8]> {
        match &self.handle {
            StoreHandle::Memory(buf) => Some(buf),
            StoreHandle::File(_) => None,
        }
    }

    /// Reclaim space held by an image that has no live records
    ///
    /// Returns true when the underlying buffer or file was recreated.
    pub fn vacuum(&mut self, threshold_bytes: u64) -> StorageResult<bool> {
        if self.closed || !self.entries.is_empty() {
            return Ok(false);
        }

        let size = self.image_size();
        if size <= threshold_bytes {
            return Ok(false);
        }

        match &mut self.handle {
            StoreHandle::Memory(buf) => {
                *buf = Vec::new();
            }
            StoreHandle::File(path) => {
                std::fs::remove_file(&*path)?;
            }
        }
        self.write_image()?;
        self.dirty = false;

        tracing::info!("Vacuumed backing image ({} bytes reclaimed)", size);
        Ok(true)
    }

    fn write_image(&mut self) -> StorageResult<()> {
        let image = encode_image(&self.entries);
        match &mut self.handle {
            StoreHandle::Memory(buf) => {
                *buf = image;
            }
            StoreHandle::File(path) => write_file_atomically(path, &image)?,
        }
        Ok(())
    }
}

/// Write `<path>.tmp`, sync it, then rename it over `path`
fn write_file_atomically(path: &Path, image: &[u8]) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(image)?;
        file.sync_all()?;
    }

    std::fs::rename(&tmp_path, path)?;

    // Make the rename itself durable where the platform allows it
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

/// Serialize records into an image
pub(crate) fn encode_image(entries: &BTreeMap<String, Vec<u8>>) -> Vec<u8> {
    let body: usize = entries.iter().map(|(k, v)| 12 + k.len() + v.len()).sum();
    let mut out = Vec::with_capacity(IMAGE_MAGIC.len() + body);
    out.extend_from_slice(&IMAGE_MAGIC);

    for (key, value) in entries {
        let start = out.len();
        out.extend_from_slice(&(key.len() as u32).to_le_bytes());
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
        out.extend_from_slice(value);
        let crc = crc32fast::hash(&out[start..]);
        out.extend_from_slice(&crc.to_le_bytes());
    }

    out
}

/// Parse an image, keeping the valid prefix if the tail is damaged
pub(crate) fn decode_image(bytes: &[u8]) -> StorageResult<BTreeMap<String, Vec<u8>>> {
    let mut entries = BTreeMap::new();
    if bytes.is_empty() {
        return Ok(entries);
    }

    if bytes.len() < IMAGE_MAGIC.len() || bytes[..IMAGE_MAGIC.len()] != IMAGE_MAGIC {
        return Err(StorageError::Corruption("Invalid image magic".to_string()));
    }

    let mut reader = &bytes[IMAGE_MAGIC.len()..];
    loop {
        match read_entry_from(&mut reader) {
            Ok(Some((key, value))) => {
                entries.insert(key, value);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(
                    "Backing image damaged after {} records, keeping valid prefix: {}",
                    entries.len(),
                    e
                );
                break;
            }
        }
    }

    Ok(entries)
}

/// Read one record; `Ok(None)` at a clean end of input
fn read_entry_from<R: Read>(reader: &mut R) -> StorageResult<Option<(String, Vec<u8>)>> {
    let mut key_len_buf = [0u8; 4];
    match reader.read_exact(&mut key_len_buf) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let key_len = u32::from_le_bytes(key_len_buf) as usize;
    if key_len > MAX_KEY_LEN {
        return Err(StorageError::Corruption(format!(
            "Key length too large: {}",
            key_len
        )));
    }

    let mut key = vec![0u8; key_len];
    reader.read_exact(&mut key)?;

    let mut value_len_buf = [0u8; 4];
    reader.read_exact(&mut value_len_buf)?;
    let value_len = u32::from_le_bytes(value_len_buf) as usize;
    if value_len > MAX_VALUE_LEN {
        return Err(StorageError::Corruption(format!(
            "Value length too large: {}",
            value_len
        )));
    }

    let mut value = vec![0u8; value_len];
    reader.read_exact(&mut value)?;

    let mut crc_buf = [0u8; 4];
    reader.read_exact(&mut crc_buf)?;
    let stored_crc = u32::from_le_bytes(crc_buf);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&key_len_buf);
    hasher.update(&key);
    hasher.update(&value_len_buf);
    hasher.update(&value);
    let computed_crc = hasher.finalize();

    if stored_crc != computed_crc {
        return Err(StorageError::Corruption(format!(
            "CRC mismatch: stored={}, computed={}",
            stored_crc, computed_crc
        )));
    }

    let key = String::from_utf8(key)
        .map_err(|e| StorageError::Corruption(format!("Key is not UTF-8: {}", e)))?;

    Ok(Some((key, value)))
}

//! Tar archive codec for vault transfer.
//!
//! Layout, in order:
//! ```text
//! catalog.json        pretty JSON array of SecretRecord
//! data/               directory entry
//! data/<id>           one encrypted blob per live record
//! ```
//! Readers skip directory entries, insist that the first regular entry is the
//! catalog, and hand back blob entries as streams so nothing is buffered.

use std::io::{self, Read, Write};
use std::path::Path;

use sbx_crypto::HashReader;

use crate::catalog::Catalog;
use crate::error::{VaultError, VaultResult};

/// Entry name of the serialized catalog.
pub const CATALOG_ENTRY: &str = "catalog.json";

/// Directory prefix for blob entries.
pub const DATA_DIR: &str = "data";

const FILE_MODE: u32 = 0o600;
const DIR_MODE: u32 = 0o700;

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn entry_header(entry_type: tar::EntryType, mode: u32, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_size(size);
    header.set_mtime(now_secs());
    header
}

/// Blob IDs double as file names, so only plain alphanumerics are accepted.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 64 && id.bytes().all(|b| b.is_ascii_alphanumeric())
}

// ── Writer ────────────────────────────────────────────────────────────────

pub struct ArchiveWriter<W: Write> {
    builder: tar::Builder<W>,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(dst: W) -> Self {
        Self {
            builder: tar::Builder::new(dst),
        }
    }

    /// Write the catalog entry followed by the `data/` directory entry.
    /// Must be called once, before any blob.
    pub fn write_catalog(&mut self, catalog: &Catalog) -> VaultResult<()> {
        let json = serde_json::to_vec_pretty(catalog)?;
        let mut header = entry_header(tar::EntryType::Regular, FILE_MODE, json.len() as u64);
        self.builder
            .append_data(&mut header, CATALOG_ENTRY, json.as_slice())?;

        let mut dir = entry_header(tar::EntryType::Directory, DIR_MODE, 0);
        self.builder
            .append_data(&mut dir, format!("{DATA_DIR}/"), io::empty())?;
        Ok(())
    }

    /// Append `data/<id>` with exactly `size` bytes from `blob`.
    pub fn write_blob<R: Read>(&mut self, id: &str, size: u64, blob: R) -> VaultResult<()> {
        let mut header = entry_header(tar::EntryType::Regular, FILE_MODE, size);
        self.builder
            .append_data(&mut header, Path::new(DATA_DIR).join(id), blob)?;
        Ok(())
    }

    /// Append a blob while hashing it; fails with `Integrity` when the bytes
    /// do not match `expected`. The archive is unusable after such a failure.
    pub fn write_verified_blob<R: Read>(
        &mut self,
        id: &str,
        size: u64,
        blob: R,
        expected: &str,
    ) -> VaultResult<()> {
        let mut hashed = HashReader::new(blob);
        self.write_blob(id, size, &mut hashed)?;
        let actual = hashed.checksum();
        if actual != expected {
            tracing::warn!(id, expected, actual = %actual, "blob digest mismatch");
            return Err(VaultError::Integrity {
                id: id.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }

    /// Write the end-of-archive marker and return the underlying writer.
    pub fn finish(self) -> VaultResult<W> {
        Ok(self.builder.into_inner()?)
    }
}

// ── Reader ────────────────────────────────────────────────────────────────

pub struct ArchiveReader<R: Read> {
    archive: tar::Archive<R>,
}

impl<R: Read> ArchiveReader<R> {
    pub fn new(src: R) -> Self {
        Self {
            archive: tar::Archive::new(src),
        }
    }

    /// Read the leading catalog entry and return it with an iterator over
    /// the blob entries that follow.
    pub fn open(&mut self) -> VaultResult<(Catalog, BlobEntries<'_, R>)> {
        let mut entries = self.archive.entries()?;
        loop {
            let Some(entry) = entries.next() else {
                return Err(VaultError::Archive(format!("{CATALOG_ENTRY} not found")));
            };
            let entry = entry?;
            let entry_type = entry.header().entry_type();
            if entry_type.is_dir() {
                continue;
            }
            let path = entry.path()?.into_owned();
            if !entry_type.is_file() || path != Path::new(CATALOG_ENTRY) {
                return Err(VaultError::Archive(format!(
                    "first entry is {}, expected {CATALOG_ENTRY}",
                    path.display()
                )));
            }
            let catalog: Catalog = serde_json::from_reader(entry)?;
            return Ok((catalog, BlobEntries { entries }));
        }
    }
}

/// One blob entry, streamed straight from the archive.
pub struct Blob<'a, R: 'a + Read> {
    pub id: String,
    pub size: u64,
    pub reader: tar::Entry<'a, R>,
}

pub struct BlobEntries<'a, R: 'a + Read> {
    entries: tar::Entries<'a, R>,
}

impl<'a, R: 'a + Read> Iterator for BlobEntries<'a, R> {
    type Item = VaultResult<Blob<'a, R>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.entries.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e.into())),
            };
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let id = match entry.path() {
                Ok(path) => path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_owned),
                Err(e) => return Some(Err(e.into())),
            };
            match id {
                Some(id) if is_valid_id(&id) => {
                    let size = entry.size();
                    return Some(Ok(Blob {
                        id,
                        size,
                        reader: entry,
                    }));
                }
                other => {
                    tracing::debug!(entry = ?other, "skipping archive entry with unusable name");
                }
            }
        }
    }
}

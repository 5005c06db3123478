//! Server-side archive store.
//!
//! Each account owns one tar archive in the store directory. An upload
//! either becomes the account's first archive ([`ArchiveStore::create`]) or
//! is merged into the existing one ([`ArchiveStore::merge`]). Both paths
//! stream blobs straight from the source archives, verify every blob digest
//! while copying, and only move a finished temp file into place.

use rand::RngCore;
use sbx_vault::archive::{ArchiveReader, ArchiveWriter, BlobEntries};
use sbx_vault::{Catalog, VaultError};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::SyncResult;

/// Counts reported after writing an archive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub records: usize,
    pub blobs: usize,
}

#[derive(Debug, Clone)]
pub struct ArchiveStore {
    dir: PathBuf,
}

impl ArchiveStore {
    pub fn new(dir: impl Into<PathBuf>) -> SyncResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store an account's first archive under a fresh random name.
    ///
    /// The upload is normalised rather than stored byte for byte: the stored
    /// archive holds the uploaded catalog followed by the digest-verified
    /// blobs of its live records, once per ID. An upload with a live record
    /// lacking its blob is rejected.
    pub fn create<R: Read>(&self, incoming: R) -> SyncResult<PathBuf> {
        let mut upload = ArchiveReader::new(incoming);
        let (catalog, blobs) = upload.open()?;

        let tmp = NamedTempFile::new_in(&self.dir)?;
        let mut writer = ArchiveWriter::new(BufWriter::new(tmp));
        writer.write_catalog(&catalog)?;

        let mut written = HashSet::new();
        copy_blobs(&mut writer, blobs, &catalog, &catalog, &mut written)?;
        ensure_complete(&catalog, &written)?;

        let tmp = finish(writer)?;
        let path = self.dir.join(format!("{}.tar", random_name()));
        tmp.persist_noclobber(&path).map_err(|e| e.error)?;

        info!(
            path = %path.display(),
            records = catalog.len(),
            blobs = written.len(),
            "archive created"
        );
        Ok(path)
    }

    /// Merge `incoming` into the archive at `existing`, replacing it.
    ///
    /// The incoming catalog takes the `b` side of the merge. For every
    /// surviving record the incoming blob is preferred when its record is
    /// the winner; otherwise the existing archive's copy is used. A live
    /// merged record with no blob on either side fails the merge. On any
    /// failure the existing archive is left untouched.
    pub fn merge<R: Read>(&self, existing: &Path, incoming: R) -> SyncResult<MergeStats> {
        let mut current = ArchiveReader::new(BufReader::new(File::open(existing)?));
        let mut upload = ArchiveReader::new(incoming);

        let (current_catalog, current_blobs) = current.open()?;
        let (incoming_catalog, incoming_blobs) = upload.open()?;
        let merged = Catalog::merge(&current_catalog, &incoming_catalog);

        let dir = existing.parent().unwrap_or(self.dir.as_path());
        let tmp = NamedTempFile::new_in(dir)?;
        let mut writer = ArchiveWriter::new(BufWriter::new(tmp));
        writer.write_catalog(&merged)?;

        let mut written = HashSet::new();
        copy_blobs(&mut writer, incoming_blobs, &incoming_catalog, &merged, &mut written)?;
        copy_blobs(&mut writer, current_blobs, &current_catalog, &merged, &mut written)?;

        ensure_complete(&merged, &written)?;

        let tmp = finish(writer)?;
        drop(current);
        tmp.persist(existing).map_err(|e| e.error)?;

        let stats = MergeStats {
            records: merged.len(),
            blobs: written.len(),
        };
        info!(
            path = %existing.display(),
            records = stats.records,
            blobs = stats.blobs,
            "archive merged"
        );
        Ok(stats)
    }
}

/// Copy blobs from one side whose record on that side is the one that
/// survived in `target`.
fn copy_blobs<W: io::Write, R: Read>(
    writer: &mut ArchiveWriter<W>,
    blobs: BlobEntries<'_, R>,
    side: &Catalog,
    target: &Catalog,
    written: &mut HashSet<String>,
) -> SyncResult<()> {
    for blob in blobs {
        let blob = blob?;
        let Some(record) = target.get(&blob.id) else {
            continue;
        };
        if record.tombstoned || written.contains(&blob.id) {
            continue;
        }
        let from_this_side = side
            .get(&blob.id)
            .is_some_and(|r| r.digest == record.digest && !r.tombstoned);
        if !from_this_side {
            debug!(id = %blob.id, "skipping superseded blob");
            continue;
        }
        writer.write_verified_blob(&blob.id, blob.size, blob.reader, &record.digest)?;
        written.insert(blob.id);
    }
    Ok(())
}

/// Every live record in `catalog` must have had its blob written.
fn ensure_complete(catalog: &Catalog, written: &HashSet<String>) -> SyncResult<()> {
    let missing = catalog.live().filter(|r| !written.contains(&r.id)).count();
    if missing > 0 {
        warn!(missing, "archive lacks blobs for live records");
        return Err(VaultError::Archive(format!("{missing} live records have no blob")).into());
    }
    Ok(())
}

fn finish(writer: ArchiveWriter<BufWriter<NamedTempFile>>) -> SyncResult<NamedTempFile> {
    let tmp = writer
        .finish()?
        .into_inner()
        .map_err(io::IntoInnerError::into_error)?;
    tmp.as_file().sync_all()?;
    Ok(tmp)
}

fn random_name() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

//! The on-disk secret vault.
//!
//! Layout under the vault root:
//! ```text
//! catalog.json   pretty JSON array of SecretRecord (tombstones included)
//! remote.json    {"address": ..., "token": ...}
//! data/<id>      AES-CTR ciphertext, one file per live record
//! ```
//! Both JSON files are rewritten atomically (temp + rename) after every
//! mutation. Blobs are always written to a temp file in `data/` and renamed
//! into place, never modified in place.

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use sbx_crypto::{
    generate_id, DecryptingReader, EncryptingReader, HashReader, HashWriter, PassphraseProvider,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::archive::{ArchiveReader, ArchiveWriter, DATA_DIR};
use crate::catalog::{Catalog, SecretRecord};
use crate::error::{VaultError, VaultResult};
use crate::kinds::{BankCard, LoginPassword, Secret, SecretKind, SecretPayload};
use crate::remote::RemoteConfig;

pub const CATALOG_FILE: &str = "catalog.json";
pub const REMOTE_FILE: &str = "remote.json";

pub struct Vault {
    root: PathBuf,
    data: PathBuf,
    catalog: Catalog,
    remote: RemoteConfig,
    passphrase: Box<dyn PassphraseProvider>,
    rng: Box<dyn RngCore + Send>,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("root", &self.root)
            .field("records", &self.catalog.len())
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl Vault {
    /// Open (or initialise) the vault at `root` with an OS-seeded RNG.
    pub fn open(
        root: impl Into<PathBuf>,
        passphrase: Box<dyn PassphraseProvider>,
    ) -> VaultResult<Self> {
        Self::open_with_rng(root, passphrase, Box::new(StdRng::from_entropy()))
    }

    /// Open with an explicit random source for IDs and IVs.
    pub fn open_with_rng(
        root: impl Into<PathBuf>,
        passphrase: Box<dyn PassphraseProvider>,
        rng: Box<dyn RngCore + Send>,
    ) -> VaultResult<Self> {
        let root = root.into();
        let data = root.join(DATA_DIR);
        fs::create_dir_all(&data)?;

        let catalog_path = root.join(CATALOG_FILE);
        let remote_path = root.join(REMOTE_FILE);
        let (catalog, remote) = std::thread::scope(|s| {
            let catalog = s.spawn(|| load_or_init::<Catalog>(&catalog_path));
            let remote = s.spawn(|| load_or_init::<RemoteConfig>(&remote_path));
            (join_loader(catalog), join_loader(remote))
        });
        let catalog = catalog?;
        let remote = remote?;

        debug!(root = %root.display(), records = catalog.len(), "vault opened");
        Ok(Self {
            root,
            data,
            catalog,
            remote,
            passphrase,
            rng,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// True when the catalog holds no records at all, tombstones included.
    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty()
    }

    pub fn remote(&self) -> &RemoteConfig {
        &self.remote
    }

    pub fn set_remote_address(&mut self, address: impl Into<String>) -> VaultResult<()> {
        self.remote.address = Some(address.into());
        save_json(&self.root.join(REMOTE_FILE), &self.remote)
    }

    pub fn set_remote_token(&mut self, token: impl Into<String>) -> VaultResult<()> {
        self.remote.token = Some(token.into());
        save_json(&self.root.join(REMOTE_FILE), &self.remote)
    }

    /// Encrypt and store a new secret under a fresh random ID.
    pub fn add(&mut self, description: &str, secret: Secret<'_>) -> VaultResult<String> {
        let id = generate_id(&mut *self.rng);
        self.write_secret(&id, description, secret)?;
        info!(id = %id, "secret added");
        Ok(id)
    }

    /// Overwrite an existing live secret, keeping its ID.
    pub fn update(&mut self, id: &str, description: &str, secret: Secret<'_>) -> VaultResult<()> {
        self.live_record(id)?;
        self.write_secret(id, description, secret)?;
        info!(id, "secret updated");
        Ok(())
    }

    /// Decrypted content of a live secret.
    ///
    /// Structured kinds are decoded, validated and rendered as one text line;
    /// binary content is streamed through the decrypting reader.
    pub fn get(&self, id: &str) -> VaultResult<Box<dyn Read + Send>> {
        let record = self.live_record(id)?;
        let passphrase = self.passphrase.passphrase()?;
        let blob = File::open(self.data.join(id))?;
        let mut plaintext = DecryptingReader::new(BufReader::new(blob), &passphrase, &record.meta)?;

        match record.kind {
            SecretKind::BankCard => render::<BankCard>(&mut plaintext),
            SecretKind::LoginPassword => render::<LoginPassword>(&mut plaintext),
            SecretKind::Binary | SecretKind::Unknown => Ok(Box::new(plaintext)),
        }
    }

    /// Remove the blob and tombstone the record so the deletion propagates.
    pub fn delete(&mut self, id: &str) -> VaultResult<()> {
        self.live_record(id)?;
        match fs::remove_file(self.data.join(id)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(id, "blob already missing while deleting");
            }
            Err(e) => return Err(e.into()),
        }

        let stamp = self.next_timestamp();
        if let Some(record) = self.catalog.get_mut(id) {
            record.tombstoned = true;
            record.last_modified = stamp;
        }
        self.save_catalog()?;
        info!(id, "secret deleted");
        Ok(())
    }

    /// Live records, in catalog order.
    pub fn list(&self) -> impl Iterator<Item = &SecretRecord> {
        self.catalog.live()
    }

    /// Serialize the catalog and every live blob into a temporary tar file,
    /// rewound to the start.
    pub fn pack(&self) -> VaultResult<File> {
        let file = tempfile::tempfile_in(&self.root)?;
        let mut archive = ArchiveWriter::new(BufWriter::new(file));
        archive.write_catalog(&self.catalog)?;

        let mut blobs = 0usize;
        for record in self.catalog.live() {
            let blob = File::open(self.data.join(&record.id))?;
            let size = blob.metadata()?.len();
            archive.write_blob(&record.id, size, BufReader::new(blob))?;
            blobs += 1;
        }

        let mut file = archive
            .finish()?
            .into_inner()
            .map_err(io::IntoInnerError::into_error)?;
        file.seek(SeekFrom::Start(0))?;
        debug!(records = self.catalog.len(), blobs, "vault packed");
        Ok(file)
    }

    /// Merge an incoming archive into this vault.
    ///
    /// Blobs for records that survive the merge are staged and digest-checked
    /// first; nothing is committed (blobs or catalog) unless every staged blob
    /// verifies and every record won by the incoming side has a blob.
    pub fn unpack<R: Read>(&mut self, src: R) -> VaultResult<()> {
        let mut reader = ArchiveReader::new(src);
        let (incoming, blobs) = reader.open()?;
        let merged = Catalog::merge(&self.catalog, &incoming);

        let mut staged: Vec<(String, NamedTempFile)> = Vec::new();
        for blob in blobs {
            let mut blob = blob?;
            let Some(record) = merged.get(&blob.id) else {
                continue;
            };
            // The incoming copy lost the merge; its bytes belong to another version.
            if incoming.get(&blob.id) != Some(record) {
                continue;
            }
            if self.catalog.get(&blob.id) == Some(record) && self.data.join(&blob.id).exists() {
                continue;
            }

            let tmp = NamedTempFile::new_in(&self.data)?;
            let mut writer = HashWriter::new(BufWriter::new(tmp));
            io::copy(&mut blob.reader, &mut writer)?;
            let actual = writer.checksum();
            if actual != record.digest {
                warn!(id = %blob.id, expected = %record.digest, actual = %actual, "incoming blob failed integrity check");
                return Err(VaultError::Integrity {
                    id: blob.id,
                    expected: record.digest.clone(),
                    actual,
                });
            }
            let tmp = writer
                .into_inner()
                .into_inner()
                .map_err(io::IntoInnerError::into_error)?;
            staged.push((blob.id, tmp));
        }

        // Every record taken from the incoming side needs bytes that match it.
        for record in merged.live() {
            if self.catalog.get(&record.id) == Some(record)
                || staged.iter().any(|(id, _)| *id == record.id)
            {
                continue;
            }
            if !self.blob_matches(&record.id, &record.digest)? {
                warn!(id = %record.id, "archive lacks blob for merged record");
                return Err(VaultError::Archive(format!(
                    "archive lacks blob for {}",
                    record.id
                )));
            }
        }

        let written = staged.len();
        for (id, tmp) in staged {
            tmp.persist(self.data.join(&id)).map_err(|e| e.error)?;
        }

        self.catalog = merged;
        self.save_catalog()?;
        let pruned = self.prune()?;
        info!(
            records = self.catalog.len(),
            blobs = written,
            pruned,
            "archive merged into vault"
        );
        Ok(())
    }

    /// Delete blob files that no live record refers to.
    pub fn prune(&self) -> VaultResult<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.data)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let referenced = name
                .to_str()
                .and_then(|n| self.catalog.get(n))
                .is_some_and(|r| !r.tombstoned);
            if !referenced {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "pruned orphaned blobs");
        }
        Ok(removed)
    }

    // ── Internals ─────────────────────────────────────────────────────────

    /// Whether `data/<id>` exists and hashes to `digest`.
    fn blob_matches(&self, id: &str, digest: &str) -> VaultResult<bool> {
        let blob = match File::open(self.data.join(id)) {
            Ok(blob) => blob,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let mut reader = HashReader::new(BufReader::new(blob));
        io::copy(&mut reader, &mut io::sink())?;
        Ok(reader.checksum() == digest)
    }

    fn live_record(&self, id: &str) -> VaultResult<&SecretRecord> {
        match self.catalog.get(id) {
            None => Err(VaultError::NotFound(id.to_string())),
            Some(record) if record.tombstoned => Err(VaultError::AlreadyDeleted(id.to_string())),
            Some(record) => Ok(record),
        }
    }

    /// `now`, or just past the newest record when the clock lags behind it.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.catalog.newest() {
            Some(newest) if newest >= now => newest + Duration::nanoseconds(1),
            _ => now,
        }
    }

    fn write_secret(&mut self, id: &str, description: &str, secret: Secret<'_>) -> VaultResult<()> {
        let kind = secret.kind();
        let (digest, meta) = match secret {
            Secret::Binary(src) => self.store_blob(id, src)?,
            Secret::BankCard(card) => self.store_payload(id, &card)?,
            Secret::LoginPassword(logpass) => self.store_payload(id, &logpass)?,
        };

        let record = SecretRecord {
            id: id.to_string(),
            kind,
            description: description.to_string(),
            digest,
            meta,
            last_modified: self.next_timestamp(),
            tombstoned: false,
        };
        self.catalog.upsert(record);
        self.save_catalog()
    }

    fn store_payload<P: SecretPayload>(
        &mut self,
        id: &str,
        payload: &P,
    ) -> VaultResult<(String, sbx_crypto::CipherMeta)> {
        payload.validate()?;
        let encoded = payload.encode();
        self.store_blob(id, &mut encoded.as_slice())
    }

    /// Encrypt `src` into `data/<id>`; returns the ciphertext digest and meta.
    fn store_blob(
        &mut self,
        id: &str,
        src: &mut dyn Read,
    ) -> VaultResult<(String, sbx_crypto::CipherMeta)> {
        let passphrase = self.passphrase.passphrase()?;
        let mut ciphertext = EncryptingReader::new(src, &passphrase, &mut *self.rng)?;

        let tmp = NamedTempFile::new_in(&self.data)?;
        let mut writer = HashWriter::new(BufWriter::new(tmp));
        io::copy(&mut ciphertext, &mut writer)?;
        writer.flush()?;

        let digest = writer.checksum();
        let meta = ciphertext.meta();
        let tmp = writer
            .into_inner()
            .into_inner()
            .map_err(io::IntoInnerError::into_error)?;
        tmp.persist(self.data.join(id)).map_err(|e| e.error)?;
        debug!(id, digest = %digest, "blob written");
        Ok((digest, meta))
    }

    fn save_catalog(&self) -> VaultResult<()> {
        save_json(&self.root.join(CATALOG_FILE), &self.catalog)
    }
}

fn render<P: SecretPayload>(src: &mut dyn Read) -> VaultResult<Box<dyn Read + Send>> {
    let mut plaintext = Zeroizing::new(Vec::new());
    src.read_to_end(&mut plaintext)?;
    let payload = P::decode(&plaintext)?;
    payload.validate()?;
    Ok(Box::new(Cursor::new(format!("{payload}\n").into_bytes())))
}

fn join_loader<T>(handle: std::thread::ScopedJoinHandle<'_, VaultResult<T>>) -> VaultResult<T> {
    handle
        .join()
        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
}

/// Read a JSON file, or write `T::default()` to it when it does not exist.
fn load_or_init<T: Default + Serialize + DeserializeOwned>(path: &Path) -> VaultResult<T> {
    if path.exists() {
        let content = fs::read(path)?;
        Ok(serde_json::from_slice(&content)?)
    } else {
        let value = T::default();
        save_json(path, &value)?;
        Ok(value)
    }
}

/// Atomic write: temp file beside the target, then rename.
fn save_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> VaultResult<()> {
    let mut json = serde_json::to_vec_pretty(value)?;
    json.push(b'\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &json)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

//! The envelope-encrypted KV store: a durable, transactional, single-writer
//! store of the secrets map, encrypted at rest.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs4::FileExt;

use crate::crypto::{self, DataKey, KeyEncryptionKey};
use crate::error::{CResult, Error};
use crate::model::{
    db_associated_data, Database, Envelope, SecretInfo, SecretValue, Version,
    CURRENT_SCHEMA_VERSION,
};

/// A single named, versioned KV store backed by one atomically-rewritten
/// file. All operations are synchronous and exclusive -- callers (the
/// database facade) are responsible for serializing access across threads;
/// `Store` itself does not take an internal lock beyond the advisory file
/// lock used to detect a second process opening the same path. The lock is
/// held on a sidecar `.lock` file rather than the data file itself, since
/// the data file's inode is replaced on every write (temp-file + rename)
/// and a lock on it would be silently released the moment a second process
/// opened the fresh inode at the same path.
pub struct Store {
    path: PathBuf,
    data_key: DataKey,
    db: Database,
    wrapped_data_key: Vec<u8>,
    /// Monotonic counter incremented on every successful durable save,
    /// sampled by the periodic backup task.
    write_generation: u64,
    _lock: File,
}

impl Store {
    /// Opens the store at `path`, unwrapping its data key via `kek`. If the
    /// file does not exist, a fresh store is created and persisted
    /// immediately. Any decrypt failure -- unknown schema version, a
    /// tampered envelope, a `kek` that rejects the wrapped key -- is fatal;
    /// `open` refuses to return a partially-initialized store.
    pub fn open(path: impl AsRef<Path>, kek: &dyn KeyEncryptionKey) -> CResult<Store> {
        let path = path.as_ref().to_path_buf();

        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }

        let lock_path = path.with_extension("lock");
        let lock_file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| Error::internal("store file is already locked by another process"))?;

        let data_file_is_empty = match fs::metadata(&path) {
            Ok(meta) => meta.len() == 0,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => true,
            Err(err) => return Err(err.into()),
        };

        if data_file_is_empty {
            let (data_key, wrapped) = crypto::generate_and_wrap(kek, CURRENT_SCHEMA_VERSION)?;
            let db = Database::empty();
            let mut store = Store {
                path,
                data_key,
                db,
                wrapped_data_key: wrapped.clone(),
                write_generation: 0,
                _lock: lock_file,
            };
            store.persist(wrapped)?;
            return Ok(store);
        }

        let contents = fs::read(&path)?;
        let envelope: Envelope = serde_json::from_slice(&contents)?;
        if envelope.schema_version != CURRENT_SCHEMA_VERSION {
            return Err(Error::internal(format!(
                "unsupported schema version {}",
                envelope.schema_version
            )));
        }

        let data_key = crypto::unwrap_data_key(
            kek,
            &envelope.wrapped_data_key.0,
            envelope.schema_version,
        )?;

        let aad = db_associated_data(envelope.schema_version);
        let plaintext = data_key.open(&envelope.ciphertext.0, &aad)?;
        let db: Database = serde_json::from_slice(&plaintext)?;

        Ok(Store {
            path,
            data_key,
            db,
            wrapped_data_key: envelope.wrapped_data_key.0,
            write_generation: 0,
            _lock: lock_file,
        })
    }

    /// Current write generation, used by the backup task to detect change
    /// without reading the file.
    pub fn write_generation(&self) -> u64 {
        self.write_generation
    }

    pub fn list(&self) -> Vec<String> {
        self.db.secrets.keys().cloned().collect()
    }

    pub fn info(&self, name: &str) -> CResult<SecretInfo> {
        let secret = self
            .db
            .secrets
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        Ok(SecretInfo {
            name: name.to_string(),
            versions: secret.versions.keys().copied().collect(),
            active_version: secret.active_version,
        })
    }

    pub fn get(&self, name: &str) -> CResult<SecretValue> {
        let secret = self
            .db
            .secrets
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        let value = secret.versions.get(&secret.active_version).ok_or_else(|| {
            Error::internal(format!(
                "invariant violated: active version {} missing for {name}",
                secret.active_version
            ))
        })?;
        Ok(SecretValue {
            value: value.0.clone(),
            version: secret.active_version,
        })
    }

    pub fn get_version(&self, name: &str, version: Version) -> CResult<SecretValue> {
        let secret = self
            .db
            .secrets
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        let value = secret
            .versions
            .get(&version)
            .ok_or_else(|| Error::NotFound(format!("{name}@{version}")))?;
        Ok(SecretValue {
            value: value.0.clone(),
            version,
        })
    }

    /// Creates or appends a version. Idempotent: re-putting the bytes
    /// already stored at `latest_version` returns that version unchanged
    /// rather than minting a new one.
    pub fn put(&mut self, name: &str, bytes: Vec<u8>) -> CResult<Version> {
        self.mutate(|db| {
            let already_existed = db.secrets.contains_key(name);
            let secret = db.get_or_create(name, bytes.clone());

            if !already_existed {
                // get_or_create just created version 1 with these bytes.
                return Ok(1);
            }

            if let Some(latest) = secret.versions.get(&secret.latest_version) {
                if latest.0 == bytes {
                    return Ok(secret.latest_version);
                }
            }

            secret.latest_version += 1;
            secret
                .versions
                .insert(secret.latest_version, crate::model::ByteBuf(bytes));
            Ok(secret.latest_version)
        })
    }

    /// Sets the active version. No-op if already active.
    pub fn set_active(&mut self, name: &str, version: Version) -> CResult<()> {
        if version == 0 {
            return Err(Error::BadRequest("version must not be zero".into()));
        }
        self.mutate(|db| {
            let secret = db
                .secrets
                .get_mut(name)
                .ok_or_else(|| Error::NotFound(name.to_string()))?;
            if !secret.versions.contains_key(&version) {
                return Err(Error::NotFound(format!("{name}@{version}")));
            }
            secret.active_version = version;
            Ok(())
        })
    }

    /// Removes one version. Refuses to remove the active version, and
    /// never decreases `latest_version` -- so a subsequent `put` still
    /// assigns `latest + 1`, never a reused number.
    pub fn delete_version(&mut self, name: &str, version: Version) -> CResult<()> {
        if version == 0 {
            return Err(Error::BadRequest("version must not be zero".into()));
        }
        self.mutate(|db| {
            let secret = db
                .secrets
                .get_mut(name)
                .ok_or_else(|| Error::NotFound(name.to_string()))?;
            if !secret.versions.contains_key(&version) {
                return Err(Error::NotFound(format!("{name}@{version}")));
            }
            if version == secret.active_version {
                return Err(Error::BadRequest(format!(
                    "cannot delete the active version of {name}"
                )));
            }
            secret.versions.remove(&version);
            Ok(())
        })
    }

    /// Removes all versions of a secret. Idempotent.
    pub fn delete(&mut self, name: &str) -> CResult<()> {
        self.mutate(|db| {
            db.secrets.remove(name);
            Ok(())
        })
    }

    /// Runs `f` against a clone of the in-memory database, and only commits
    /// the result -- both in memory and on disk -- if `f` succeeds and the
    /// durable write succeeds. On any failure the in-memory state is left
    /// exactly as it was.
    ///
    /// The in-memory mutation (applied to a clone of `self.db`) is only
    /// committed to `self` after the durable write has fully succeeded; any
    /// failure -- in `f` itself, in encryption, or in the file write --
    /// leaves `self.db` untouched.
    fn mutate<T>(&mut self, f: impl FnOnce(&mut Database) -> CResult<T>) -> CResult<T> {
        let mut candidate = self.db.clone();
        let result = f(&mut candidate)?;

        let aad = db_associated_data(CURRENT_SCHEMA_VERSION);
        let serialized = serde_json::to_vec(&candidate)?;
        let ciphertext = self.data_key.seal(&serialized, &aad)?;

        self.persist_ciphertext(ciphertext)?;
        self.db = candidate;
        Ok(result)
    }

    fn persist(&mut self, wrapped_data_key: Vec<u8>) -> CResult<()> {
        self.wrapped_data_key = wrapped_data_key;
        let aad = db_associated_data(CURRENT_SCHEMA_VERSION);
        let serialized = serde_json::to_vec(&self.db)?;
        let ciphertext = self.data_key.seal(&serialized, &aad)?;
        self.persist_ciphertext(ciphertext)
    }

    /// Atomic durable write: serialize to a sibling temp file, fsync,
    /// rename over the target. Does not touch `self.db` -- callers decide
    /// whether to commit the in-memory mutation based on this call's
    /// outcome.
    fn persist_ciphertext(&mut self, ciphertext: Vec<u8>) -> CResult<()> {
        let envelope = Envelope {
            schema_version: CURRENT_SCHEMA_VERSION,
            wrapped_data_key: crate::model::ByteBuf(self.wrapped_data_key.clone()),
            ciphertext: crate::model::ByteBuf(ciphertext),
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = File::options()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            tmp.write_all(&bytes)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }

        self.write_generation += 1;
        Ok(())
    }
}

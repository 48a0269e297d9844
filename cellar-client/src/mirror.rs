//! The local-mirror sink contract (§6) and a default file-backed
//! implementation, grounded on the same atomic-temp-file-then-rename
//! protocol `cellar_core::store::Store` uses for the server's own
//! durability (§4.1), widened here to the client's best-effort mirror.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use cellar_core::error::CResult;
use cellar_core::model::{ByteBuf, Version};
use serde_derive::{Deserialize, Serialize};

/// `read()` returns empty bytes (never an error) when no mirror exists
/// yet; `write(bytes)` persists atomically.
pub trait Mirror: Send + Sync {
    fn read(&self) -> CResult<Vec<u8>>;
    fn write(&self, bytes: &[u8]) -> CResult<()>;
}

/// One mirrored secret: its last-observed value/version plus the
/// unix-seconds timestamp of last access, used to expire lookup-added
/// entries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MirrorSecret {
    #[serde(rename = "Value")]
    pub value: ByteBuf,
    #[serde(rename = "Version")]
    pub version: Version,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MirrorEntry {
    pub secret: MirrorSecret,
    #[serde(rename = "lastAccess")]
    pub last_access: String,
}

/// The mirror document: a JSON object keyed by secret name.
pub type MirrorDocument = BTreeMap<String, MirrorEntry>;

pub fn decode(bytes: &[u8]) -> CResult<MirrorDocument> {
    if bytes.is_empty() {
        return Ok(MirrorDocument::new());
    }
    Ok(serde_json::from_slice(bytes)?)
}

pub fn encode(doc: &MirrorDocument) -> CResult<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(doc)?)
}

/// A `Mirror` backed by one file on disk, atomically rewritten (temp file
/// + rename), `0600`-mode. `read` treats "file does not exist" as "empty
/// mirror", never an error.
pub struct FileMirror {
    path: PathBuf,
}

impl FileMirror {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileMirror { path: path.into() }
    }
}

impl Mirror for FileMirror {
    fn read(&self) -> CResult<Vec<u8>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, bytes: &[u8]) -> CResult<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, bytes)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
        }

        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

/// An in-memory [`Mirror`], useful for tests that don't want to touch the
/// filesystem at all.
#[derive(Default)]
pub struct MemoryMirror {
    bytes: std::sync::Mutex<Vec<u8>>,
}

impl MemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(initial: Vec<u8>) -> Self {
        MemoryMirror {
            bytes: std::sync::Mutex::new(initial),
        }
    }
}

impl Mirror for MemoryMirror {
    fn read(&self) -> CResult<Vec<u8>> {
        Ok(self.bytes.lock().unwrap().clone())
    }

    fn write(&self, bytes: &[u8]) -> CResult<()> {
        *self.bytes.lock().unwrap() = bytes.to_vec();
        Ok(())
    }
}

//! The default audit sink: JSON-lines, append-only, `0600`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use cellar_core::audit::{AuditEntry, AuditSink};
use cellar_core::error::CResult;

pub struct FileAuditSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileAuditSink {
    pub fn open(path: impl AsRef<Path>) -> CResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(FileAuditSink {
            path,
            file: Mutex::new(file),
        })
    }
}

impl AuditSink for FileAuditSink {
    fn write_entries(&self, entries: &[AuditEntry]) -> CResult<()> {
        let mut file = self.file.lock().unwrap();
        for entry in entries {
            let line = serde_json::to_string(entry)?;
            writeln!(file, "{line}")?;
        }
        file.sync_all()?;
        Ok(())
    }

    fn sync(&self) -> CResult<()> {
        self.file.lock().unwrap().sync_all()?;
        Ok(())
    }
}

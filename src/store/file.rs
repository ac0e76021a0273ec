//! File-backed tunnel store
//!
//! Each tunnel lives in `<dir>/<id>.json`. Records are written to a hidden
//! temporary file first and renamed into place, so a reader sees either the
//! old record or the new one.

use crate::config::validation;
use crate::error::{GuardError, Result};
use crate::store::TunnelStore;
use crate::wireguard::Tunnel;
use std::fs;
use std::io::{ErrorKind as IoErrorKind, Write};
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

const RECORD_EXTENSION: &str = "json";

/// Tunnel store persisted as one JSON file per tunnel
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    /// Serializes writers within this process
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open a store rooted at `dir`, creating the directory if needed
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            GuardError::Infrastructure(format!("Failed to create state directory {:?}: {}", dir, e))
        })?;

        debug!("Opened tunnel store at {:?}", dir);
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Directory holding the records
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> Result<PathBuf> {
        // IDs become file names; refuse anything that could escape the directory
        validation::validate_id(id)?;
        Ok(self.dir.join(format!("{}.{}", id, RECORD_EXTENSION)))
    }

    fn read_record(path: &Path) -> Result<Tunnel> {
        let contents = fs::read(path)?;
        serde_json::from_slice(&contents).map_err(|e| {
            GuardError::Serialization(format!("Corrupt tunnel record {:?}: {}", path, e))
        })
    }

    fn write_record(&self, tunnel: &Tunnel) -> Result<()> {
        let path = self.record_path(&tunnel.id)?;
        let tmp = self.dir.join(format!(".{}.{}.tmp", tunnel.id, RECORD_EXTENSION));
        let encoded = serde_json::to_vec_pretty(tunnel)?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        // Records hold private keys
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&tmp).map_err(|e| {
            GuardError::Infrastructure(format!("Failed to create {:?}: {}", tmp, e))
        })?;
        file.write_all(&encoded)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &path).map_err(|e| {
            GuardError::Infrastructure(format!("Failed to commit {:?}: {}", path, e))
        })?;

        debug!("Wrote tunnel record {:?}", path);
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| GuardError::Infrastructure("tunnel store lock poisoned".to_string()))
    }
}

impl TunnelStore for FileStore {
    fn get(&self, id: &str) -> Result<Tunnel> {
        let path = self.record_path(id)?;
        match Self::read_record(&path) {
            Err(GuardError::Io(e)) if e.kind() == IoErrorKind::NotFound => {
                Err(GuardError::tunnel_not_found(id))
            }
            other => other,
        }
    }

    fn create(&self, tunnel: &Tunnel) -> Result<()> {
        let _guard = self.lock()?;
        if self.record_path(&tunnel.id)?.exists() {
            return Err(GuardError::tunnel_exists(&tunnel.id));
        }
        self.write_record(tunnel)
    }

    fn put(&self, tunnel: &Tunnel) -> Result<()> {
        let _guard = self.lock()?;
        self.write_record(tunnel)
    }

    fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.lock()?;
        let path = self.record_path(id)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed tunnel record {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => Err(GuardError::tunnel_not_found(id)),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<Vec<Tunnel>> {
        let mut tunnels = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_record = path.extension().is_some_and(|ext| ext == RECORD_EXTENSION)
                && !path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with('.'));
            if !is_record {
                continue;
            }

            match Self::read_record(&path) {
                Ok(tunnel) => tunnels.push(tunnel),
                // Deleted between read_dir and read
                Err(GuardError::Io(e)) if e.kind() == IoErrorKind::NotFound => {
                    warn!("Tunnel record {:?} vanished during listing", path);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(tunnels)
    }
}

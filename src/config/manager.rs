//! Snapshot manager: re-reads and parses the config file, installing the
//! result only when the whole load succeeded.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::SystemTime;

use md5::{Digest, Md5};

use crate::config::{parse, Config};
use crate::error::{ProxyError, Result};

/// A successfully loaded config plus its file provenance.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub config: Config,
    pub loaded_at: SystemTime,
    pub bytes: usize,
    pub md5_hex: String,
    pub source_path: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct ManagerStats {
    pub check_calls: u64,
    pub reload_calls: u64,
    pub reload_success: u64,
    pub last_error: String,
}

pub struct Manager {
    path: PathBuf,
    current: RwLock<Option<Snapshot>>,

    check_calls: AtomicU64,
    reload_calls: AtomicU64,
    reload_success: AtomicU64,
    last_err: RwLock<String>,
}

impl Manager {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Manager {
            path: path.as_ref().to_path_buf(),
            current: RwLock::new(None),
            check_calls: AtomicU64::new(0),
            reload_calls: AtomicU64::new(0),
            reload_success: AtomicU64::new(0),
            last_err: RwLock::new(String::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read and parse the file without installing the result.
    pub fn check(&self) -> Result<Snapshot> {
        self.check_calls.fetch_add(1, Ordering::Relaxed);
        let data = std::fs::read(&self.path).map_err(|e| ProxyError::ConfigRead {
            path: self.path.display().to_string(),
            source: e,
        })?;
        let text = String::from_utf8_lossy(&data);
        let config = parse(&text)?;

        Ok(Snapshot {
            config,
            loaded_at: SystemTime::now(),
            bytes: data.len(),
            md5_hex: hex::encode(Md5::digest(&data)),
            source_path: self.path.clone(),
        })
    }

    /// Check and, only on success, install. A failed reload leaves the
    /// previously installed snapshot untouched.
    pub fn reload(&self) -> Result<Snapshot> {
        self.reload_calls.fetch_add(1, Ordering::Relaxed);
        let snapshot = match self.check() {
            Ok(s) => s,
            Err(e) => {
                self.set_last_error(e.to_string());
                return Err(e);
            }
        };

        *self.current.write().expect("manager lock") = Some(snapshot.clone());
        self.set_last_error(String::new());
        self.reload_success.fetch_add(1, Ordering::Relaxed);
        Ok(snapshot)
    }

    pub fn current(&self) -> Option<Snapshot> {
        self.current.read().expect("manager lock").clone()
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            check_calls: self.check_calls.load(Ordering::Relaxed),
            reload_calls: self.reload_calls.load(Ordering::Relaxed),
            reload_success: self.reload_success.load(Ordering::Relaxed),
            last_error: self.last_err.read().expect("manager lock").clone(),
        }
    }

    fn set_last_error(&self, s: String) {
        *self.last_err.write().expect("manager lock") = s;
    }
}

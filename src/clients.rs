#![allow(clippy::module_name_repetitions)]
//! Discovery of installed base clients with an explicit, refreshable cache.
//!
//! The cache remembers when it last scanned and the modification time of the
//! clients directory at that moment; `refresh(false)` rescans only when the
//! directory changed since.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::bundle::{BaseClient, BUNDLE_EXTENSION};
use crate::errors::{Result, SandboxError};

#[derive(Debug)]
pub struct BaseClientCache {
    root: PathBuf,
    clients: Vec<BaseClient>,
    last_scan: Option<SystemTime>,
    root_mtime: Option<SystemTime>,
}

impl BaseClientCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            clients: Vec::new(),
            last_scan: None,
            root_mtime: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn last_scan(&self) -> Option<SystemTime> {
        self.last_scan
    }

    /// Rescan when forced, never scanned, or the clients directory changed.
    /// Returns true when a scan happened.
    pub fn refresh(&mut self, force: bool) -> Result<bool> {
        let current_mtime = fs::metadata(&self.root).and_then(|m| m.modified()).ok();
        let stale = self.last_scan.is_none() || current_mtime != self.root_mtime;
        if !force && !stale {
            return Ok(false);
        }
        self.clients = scan_clients(&self.root)?;
        self.root_mtime = current_mtime;
        self.last_scan = Some(SystemTime::now());
        Ok(true)
    }

    pub fn clients(&self) -> &[BaseClient] {
        &self.clients
    }

    /// Look up a client by name, refreshing first if the directory changed.
    pub fn resolve(&mut self, name: &str) -> Result<BaseClient> {
        self.refresh(false)?;
        self.clients
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .ok_or_else(|| SandboxError::UnknownClient(name.to_string()))
    }
}

/// Every `<Name>.app` directory directly under `root`, sorted by name.
/// A missing root yields an empty list.
pub fn scan_clients(root: &Path) -> Result<Vec<BaseClient>> {
    let rd = match fs::read_dir(root) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(SandboxError::fs("list", root, e)),
    };
    let mut out = Vec::new();
    for entry in rd {
        let entry = entry.map_err(|e| SandboxError::fs("list", root, e))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some(BUNDLE_EXTENSION) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            out.push(BaseClient::new(stem, path.clone()));
        }
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

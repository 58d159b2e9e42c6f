//! Account registry: which identities exist, which base client they use, and
//! the synthetic client name provisioning assigned to them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SandboxError};
use crate::launcher::ClientFamily;
use crate::util::fs::{read_string, write_atomic};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    pub client: String,
    #[serde(default)]
    pub family: ClientFamily,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthetic_client: Option<String>,
}

impl Account {
    pub fn new(username: impl Into<String>, client: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            client: client.into(),
            family: ClientFamily::Desktop,
            synthetic_client: None,
        }
    }

    pub fn with_family(mut self, family: ClientFamily) -> Self {
        self.family = family;
        self
    }

    /// Parse `user:client`.
    pub fn parse_pair(s: &str) -> std::result::Result<Self, String> {
        match s.split_once(':') {
            Some((u, c)) if !u.trim().is_empty() && !c.trim().is_empty() => {
                Ok(Self::new(u.trim(), c.trim()))
            }
            _ => Err(format!("expected <user>:<client>, got '{s}'")),
        }
    }
}

pub trait AccountRegistry: Send + Sync {
    fn accounts(&self) -> Result<Vec<Account>>;
    fn get(&self, username: &str) -> Result<Option<Account>> {
        Ok(self.accounts()?.into_iter().find(|a| a.username == username))
    }
    /// Add or replace the account's client and family; keeps a recorded synthetic name.
    fn upsert(&self, account: Account) -> Result<()>;
    fn record_synthetic_client(&self, username: &str, synthetic: &str) -> Result<()>;
}

fn merge(map: &mut BTreeMap<String, Account>, account: Account) {
    match map.get_mut(&account.username) {
        Some(existing) => {
            if existing.client != account.client {
                existing.synthetic_client = None;
            }
            existing.client = account.client;
            existing.family = account.family;
        }
        None => {
            map.insert(account.username.clone(), account);
        }
    }
}

fn record(map: &mut BTreeMap<String, Account>, username: &str, synthetic: &str) -> Result<()> {
    let a = map
        .get_mut(username)
        .ok_or_else(|| SandboxError::Config(format!("unknown account '{username}'")))?;
    a.synthetic_client = Some(synthetic.to_string());
    Ok(())
}

#[derive(Debug, Default)]
pub struct MemoryRegistry {
    accounts: Mutex<BTreeMap<String, Account>>,
}

impl MemoryRegistry {
    pub fn new(accounts: impl IntoIterator<Item = Account>) -> Self {
        let map = accounts
            .into_iter()
            .map(|a| (a.username.clone(), a))
            .collect();
        Self {
            accounts: Mutex::new(map),
        }
    }
}

impl AccountRegistry for MemoryRegistry {
    fn accounts(&self) -> Result<Vec<Account>> {
        let map = self.accounts.lock().unwrap_or_else(|p| p.into_inner());
        Ok(map.values().cloned().collect())
    }

    fn upsert(&self, account: Account) -> Result<()> {
        let mut map = self.accounts.lock().unwrap_or_else(|p| p.into_inner());
        merge(&mut map, account);
        Ok(())
    }

    fn record_synthetic_client(&self, username: &str, synthetic: &str) -> Result<()> {
        let mut map = self.accounts.lock().unwrap_or_else(|p| p.into_inner());
        record(&mut map, username, synthetic)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    accounts: Vec<Account>,
}

/// Registry persisted as `accounts.json`; every mutation rewrites the file atomically.
#[derive(Debug)]
pub struct JsonFileRegistry {
    path: PathBuf,
    guard: Mutex<()>,
}

impl JsonFileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<BTreeMap<String, Account>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let text = read_string(&self.path)?;
        let file: RegistryFile = serde_json::from_str(&text)
            .map_err(|e| SandboxError::Config(format!("{}: {e}", self.path.display())))?;
        Ok(file
            .accounts
            .into_iter()
            .map(|a| (a.username.clone(), a))
            .collect())
    }

    fn write(&self, map: BTreeMap<String, Account>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            crate::util::fs::ensure_dirs([parent])?;
        }
        let file = RegistryFile {
            accounts: map.into_values().collect(),
        };
        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| SandboxError::Config(format!("account registry: {e}")))?;
        write_atomic(&self.path, &json)
    }

    fn update(&self, f: impl FnOnce(&mut BTreeMap<String, Account>) -> Result<()>) -> Result<()> {
        let _g = self.guard.lock().unwrap_or_else(|p| p.into_inner());
        let mut map = self.read()?;
        f(&mut map)?;
        self.write(map)
    }
}

impl AccountRegistry for JsonFileRegistry {
    fn accounts(&self) -> Result<Vec<Account>> {
        let _g = self.guard.lock().unwrap_or_else(|p| p.into_inner());
        Ok(self.read()?.into_values().collect())
    }

    fn upsert(&self, account: Account) -> Result<()> {
        self.update(|m| {
            merge(m, account);
            Ok(())
        })
    }

    fn record_synthetic_client(&self, username: &str, synthetic: &str) -> Result<()> {
        self.update(|m| record(m, username, synthetic))
    }
}

#![allow(clippy::module_name_repetitions)]
//! Runtime configuration.
//!
//! Precedence (lowest to highest):
//! 1) built-in defaults derived from the home directory,
//! 2) YAML file at CLIENTFORGE_CONFIG or `<data_root>/config.yml`,
//! 3) CLIENTFORGE_* environment variables.
//!
//! Durations accept humantime syntax ("90s", "2m", "500ms").

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::errors::{Result, SandboxError};

pub const ENV_DATA_DIR: &str = "CLIENTFORGE_DATA_DIR";
pub const ENV_CONFIG: &str = "CLIENTFORGE_CONFIG";
pub const ENV_CLIENTS_DIR: &str = "CLIENTFORGE_CLIENTS_DIR";
pub const ENV_PATCH_CATALOG: &str = "CLIENTFORGE_PATCH_CATALOG";
pub const ENV_SIGN_TIMEOUT: &str = "CLIENTFORGE_SIGN_TIMEOUT";
pub const ENV_KEYCHAIN_TIMEOUT: &str = "CLIENTFORGE_KEYCHAIN_TIMEOUT";
pub const ENV_LAUNCH_STAGGER: &str = "CLIENTFORGE_LAUNCH_STAGGER";
pub const ENV_TERMINATE_GRACE: &str = "CLIENTFORGE_TERMINATE_GRACE";
pub const ENV_CODESIGN: &str = "CLIENTFORGE_CODESIGN";
pub const ENV_SECURITY: &str = "CLIENTFORGE_SECURITY";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Root of clones, profiles and the config file.
    pub data_root: PathBuf,
    /// Directory holding the installed `<Name>.app` base clients.
    pub clients_root: PathBuf,
    /// Patch catalog YAML; the built-in catalog is used when unset.
    pub catalog_path: Option<PathBuf>,
    pub sign_timeout: Duration,
    pub keychain_timeout: Duration,
    /// Minimum delay between two process starts.
    pub launch_stagger: Duration,
    pub terminate_grace: Duration,
    pub codesign: PathBuf,
    pub security: PathBuf,
    /// Folders under the profile home the client expects to exist.
    pub document_dirs: Vec<String>,
    /// Folders for companion script payloads loaded by the client.
    pub companion_dirs: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    clients_dir: Option<PathBuf>,
    patch_catalog: Option<PathBuf>,
    sign_timeout: Option<String>,
    keychain_timeout: Option<String>,
    launch_stagger: Option<String>,
    terminate_grace: Option<String>,
    codesign: Option<PathBuf>,
    security: Option<PathBuf>,
    document_dirs: Option<Vec<String>>,
    companion_dirs: Option<Vec<String>>,
}

fn default_data_root(home: Option<&Path>) -> PathBuf {
    let home = home
        .map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir);
    if cfg!(target_os = "macos") {
        home.join("Library")
            .join("Application Support")
            .join("clientforge")
    } else {
        home.join(".local").join("share").join("clientforge")
    }
}

fn default_tool(name: &str) -> PathBuf {
    which::which(name).unwrap_or_else(|_| PathBuf::from("/usr/bin").join(name))
}

fn parse_duration(what: &str, s: &str) -> Result<Duration> {
    humantime::parse_duration(s.trim())
        .map_err(|e| SandboxError::Config(format!("{what}: invalid duration '{s}': {e}")))
}

impl Config {
    /// Defaults only; no file or environment is consulted.
    pub fn defaults(home: Option<&Path>) -> Self {
        let data_root = default_data_root(home);
        Self {
            clients_root: data_root.join("clients"),
            data_root,
            catalog_path: option_env!("CLIENTFORGE_BAKED_CATALOG").map(PathBuf::from),
            sign_timeout: Duration::from_secs(120),
            keychain_timeout: Duration::from_secs(30),
            launch_stagger: Duration::from_secs(3),
            terminate_grace: Duration::from_secs(5),
            codesign: default_tool("codesign"),
            security: default_tool("security"),
            document_dirs: vec![
                "Documents/Client".to_string(),
                "Documents/Client/Screenshots".to_string(),
                "Documents/Client/Logs".to_string(),
            ],
            companion_dirs: vec![
                "Documents/Client/Scripts".to_string(),
                "Documents/Client/Scripts/autoload".to_string(),
            ],
        }
    }

    /// Load from the process environment and the home directory.
    pub fn load() -> Result<Self> {
        let home = home::home_dir();
        Self::load_with(home.as_deref(), |k| {
            std::env::var(k).ok().filter(|v| !v.trim().is_empty())
        })
    }

    /// Load with an explicit variable lookup (used by tests).
    pub fn load_with(home: Option<&Path>, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::defaults(home);
        if let Some(d) = var(ENV_DATA_DIR) {
            cfg.data_root = PathBuf::from(d);
            cfg.clients_root = cfg.data_root.join("clients");
        }

        let (file_path, explicit) = match var(ENV_CONFIG) {
            Some(p) => (PathBuf::from(p), true),
            None => (cfg.data_root.join("config.yml"), false),
        };
        match std::fs::read_to_string(&file_path) {
            Ok(text) => {
                let file: ConfigFile = serde_yaml::from_str(&text).map_err(|e| {
                    SandboxError::Config(format!("{}: {e}", file_path.display()))
                })?;
                cfg.apply_file(file)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {}
            Err(e) => return Err(SandboxError::fs("read", &file_path, e)),
        }

        if let Some(v) = var(ENV_CLIENTS_DIR) {
            cfg.clients_root = PathBuf::from(v);
        }
        if let Some(v) = var(ENV_PATCH_CATALOG) {
            cfg.catalog_path = Some(PathBuf::from(v));
        }
        if let Some(v) = var(ENV_SIGN_TIMEOUT) {
            cfg.sign_timeout = parse_duration(ENV_SIGN_TIMEOUT, &v)?;
        }
        if let Some(v) = var(ENV_KEYCHAIN_TIMEOUT) {
            cfg.keychain_timeout = parse_duration(ENV_KEYCHAIN_TIMEOUT, &v)?;
        }
        if let Some(v) = var(ENV_LAUNCH_STAGGER) {
            cfg.launch_stagger = parse_duration(ENV_LAUNCH_STAGGER, &v)?;
        }
        if let Some(v) = var(ENV_TERMINATE_GRACE) {
            cfg.terminate_grace = parse_duration(ENV_TERMINATE_GRACE, &v)?;
        }
        if let Some(v) = var(ENV_CODESIGN) {
            cfg.codesign = PathBuf::from(v);
        }
        if let Some(v) = var(ENV_SECURITY) {
            cfg.security = PathBuf::from(v);
        }
        Ok(cfg)
    }

    fn apply_file(&mut self, f: ConfigFile) -> Result<()> {
        if let Some(v) = f.clients_dir {
            self.clients_root = v;
        }
        if let Some(v) = f.patch_catalog {
            self.catalog_path = Some(v);
        }
        if let Some(v) = f.sign_timeout {
            self.sign_timeout = parse_duration("sign_timeout", &v)?;
        }
        if let Some(v) = f.keychain_timeout {
            self.keychain_timeout = parse_duration("keychain_timeout", &v)?;
        }
        if let Some(v) = f.launch_stagger {
            self.launch_stagger = parse_duration("launch_stagger", &v)?;
        }
        if let Some(v) = f.terminate_grace {
            self.terminate_grace = parse_duration("terminate_grace", &v)?;
        }
        if let Some(v) = f.codesign {
            self.codesign = v;
        }
        if let Some(v) = f.security {
            self.security = v;
        }
        if let Some(v) = f.document_dirs {
            self.document_dirs = v;
        }
        if let Some(v) = f.companion_dirs {
            self.companion_dirs = v;
        }
        Ok(())
    }

    pub fn clones_root(&self) -> PathBuf {
        self.data_root.join("clones")
    }

    pub fn profiles_root(&self) -> PathBuf {
        self.data_root.join("profiles")
    }
}

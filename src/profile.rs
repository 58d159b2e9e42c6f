#![allow(clippy::module_name_repetitions)]
//! Per-identity profile environment: a private home tree and a secret store.
//!
//! Layout under `<profiles_root>/<username>/`:
//!   home/                      HOME for the launched client
//!   home/Library/{Keychains,Caches,Preferences,Application Support}
//!   home/<document_dirs...>    folders the client expects
//!   home/<companion_dirs...>   companion script payload folders
//!   tmp/                       TMPDIR
//!   logs/                      stdout.log / stderr.log of launched clients
//!   instance.json              last launched instance

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "otel")]
use tracing::instrument;

use crate::color::{log, LogLevel};
use crate::errors::{Result, SandboxError};
use crate::util::exec::{run_checked, CommandRunner};
use crate::util::fs::ensure_dirs;

pub const KEYCHAIN_FILE: &str = "login.keychain-db";

const SECURITY_FAILURE_MARKERS: &[&str] = &[
    "could not be found",
    "the user name or passphrase you entered is not correct",
];

const LIBRARY_DIRS: &[&str] = &[
    "Library/Keychains",
    "Library/Caches",
    "Library/Preferences",
    "Library/Application Support",
];

/// Paths of one identity's profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileEnvironment {
    pub username: String,
    pub root: PathBuf,
}

impl ProfileEnvironment {
    pub fn new(profiles_root: &Path, username: &str) -> Self {
        Self {
            username: username.to_string(),
            root: profiles_root.join(username),
        }
    }

    pub fn home(&self) -> PathBuf {
        self.root.join("home")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn stdout_log(&self) -> PathBuf {
        self.logs_dir().join("stdout.log")
    }

    pub fn stderr_log(&self) -> PathBuf {
        self.logs_dir().join("stderr.log")
    }

    pub fn application_support(&self) -> PathBuf {
        self.home().join("Library").join("Application Support")
    }

    pub fn keychain_path(&self) -> PathBuf {
        self.home().join("Library").join("Keychains").join(KEYCHAIN_FILE)
    }

    pub fn instance_file(&self) -> PathBuf {
        self.root.join("instance.json")
    }
}

/// Creates profile trees and provisions each profile's keychain.
#[derive(Clone)]
pub struct ProfileEnvironmentManager {
    profiles_root: PathBuf,
    document_dirs: Vec<String>,
    companion_dirs: Vec<String>,
    runner: Arc<dyn CommandRunner>,
    security: PathBuf,
    timeout: Duration,
}

impl std::fmt::Debug for ProfileEnvironmentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileEnvironmentManager")
            .field("profiles_root", &self.profiles_root)
            .field("security", &self.security)
            .finish()
    }
}

fn checked_relative(rel: &str) -> Result<&Path> {
    let p = Path::new(rel);
    let escapes = p.components().any(|c| {
        !matches!(c, std::path::Component::Normal(_) | std::path::Component::CurDir)
    });
    if rel.trim().is_empty() || escapes {
        return Err(SandboxError::Config(format!(
            "profile folder '{rel}' must be a relative path inside the profile home"
        )));
    }
    Ok(p)
}

impl ProfileEnvironmentManager {
    pub fn new(
        profiles_root: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
        security: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            profiles_root: profiles_root.into(),
            document_dirs: Vec::new(),
            companion_dirs: Vec::new(),
            runner,
            security: security.into(),
            timeout,
        }
    }

    pub fn with_folders(mut self, document_dirs: Vec<String>, companion_dirs: Vec<String>) -> Self {
        self.document_dirs = document_dirs;
        self.companion_dirs = companion_dirs;
        self
    }

    pub fn environment(&self, username: &str) -> ProfileEnvironment {
        ProfileEnvironment::new(&self.profiles_root, username)
    }

    /// Create every folder of the profile; existing folders are left alone.
    pub fn ensure_tree(&self, username: &str) -> Result<ProfileEnvironment> {
        let env = self.environment(username);
        let home = env.home();
        let mut dirs = vec![home.clone(), env.tmp_dir(), env.logs_dir()];
        dirs.extend(LIBRARY_DIRS.iter().map(|d| home.join(d)));
        for rel in self.document_dirs.iter().chain(self.companion_dirs.iter()) {
            dirs.push(home.join(checked_relative(rel)?));
        }
        ensure_dirs(&dirs)?;
        Ok(env)
    }

    /// Create the profile keychain when absent, then unlock it. Both commands
    /// run with HOME pointing at the profile home.
    #[cfg_attr(
        feature = "otel",
        instrument(level = "info", err, skip(self, env), fields(user = %env.username))
    )]
    pub fn ensure_secret_store(&self, env: &ProfileEnvironment) -> Result<()> {
        let keychain = env.keychain_path();
        let home = vec![("HOME".to_string(), env.home().display().to_string())];
        let security = self.security.display().to_string();
        let path = keychain.display().to_string();

        if !keychain.exists() {
            log(
                LogLevel::Debug,
                &format!("{}: creating keychain {path}", env.username),
            );
            let argv = [security.as_str(), "create-keychain", "-p", "", path.as_str()].map(String::from);
            run_checked(
                self.runner.as_ref(),
                &argv,
                &home,
                self.timeout,
                SECURITY_FAILURE_MARKERS,
            )?;
        }
        let argv = [security.as_str(), "unlock-keychain", "-p", "", path.as_str()].map(String::from);
        run_checked(
            self.runner.as_ref(),
            &argv,
            &home,
            self.timeout,
            SECURITY_FAILURE_MARKERS,
        )?;
        Ok(())
    }
}

#![allow(clippy::module_name_repetitions)]
//! Per-identity clone provisioning.
//!
//! State machine (terminal: Ready / Failed):
//!   CheckClone -> CheckStale -> Ready                       (fingerprint unchanged)
//!   CheckClone -> Clone -> Patch -> RecordFingerprint -> Ready
//!
//! Invariants
//! - The base client is only ever read; every write target is checked to lie outside it.
//! - The sidecar is removed before the clone is touched and written only after a
//!   successful patch, so an interrupted attempt is always seen as stale next time.
//! - The recorded fingerprint is computed from the bytes actually copied into the clone.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(feature = "otel")]
use tracing::instrument;

use crate::bundle::{main_executable, BaseClient};
use crate::color::{log, LogLevel};
use crate::errors::{Result, SandboxError};
use crate::hasher::{format_fingerprint, hash_executable, hash_executable_bytes, parse_fingerprint};
use crate::macho;
use crate::patch::{PatchCatalog, PatchReport};
use crate::util::fs::{
    copy_dir_recursive, read_bytes, refuse_inside, remove_dir_if_exists, remove_file_if_exists,
    write_atomic,
};
use crate::util::id::synthetic_client_name;

pub const SIDECAR_EXTENSION: &str = "fingerprint";

/// One account's private copy of a base client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityClone {
    pub username: String,
    pub base_name: String,
    pub synthetic_name: String,
    /// `<clones_root>/<username>/<synthetic>.app`
    pub path: PathBuf,
    /// `<clones_root>/<username>/<synthetic>.fingerprint`
    pub sidecar: PathBuf,
}

impl IdentityClone {
    pub fn new(clones_root: &Path, username: &str, base: &BaseClient) -> Self {
        let synthetic_name = synthetic_client_name(&base.name, username);
        let dir = clones_root.join(username);
        Self {
            username: username.to_string(),
            base_name: base.name.clone(),
            path: dir.join(format!("{synthetic_name}.app")),
            sidecar: dir.join(format!("{synthetic_name}.{SIDECAR_EXTENSION}")),
            synthetic_name,
        }
    }

    /// Fingerprint recorded at the last successful provisioning, if any.
    pub fn recorded_fingerprint(&self) -> Option<u64> {
        std::fs::read_to_string(&self.sidecar)
            .ok()
            .and_then(|s| parse_fingerprint(&s))
    }

    /// Write the sidecar; the clone is current from here on.
    pub fn record_fingerprint(&self, fingerprint: u64) -> Result<()> {
        write_atomic(
            &self.sidecar,
            format!("{}\n", format_fingerprint(fingerprint)).as_bytes(),
        )
    }

    /// Drop the sidecar so the clone reads as stale until it is recorded again.
    pub fn clear_fingerprint(&self) -> Result<()> {
        remove_file_if_exists(&self.sidecar)
    }

    /// Remove the clone and its sidecar (explicit reset or account deletion).
    pub fn reset(&self) -> Result<()> {
        remove_file_if_exists(&self.sidecar)?;
        remove_dir_if_exists(&self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
    CheckClone,
    CheckStale,
    Clone,
    Patch,
    RecordFingerprint,
    Ready,
    Failed,
}

impl ProvisionState {
    /// Verb phrase used in the user-facing failure line.
    pub fn action(&self) -> &'static str {
        match self {
            ProvisionState::CheckClone => "inspect clone",
            ProvisionState::CheckStale => "fingerprint base client",
            ProvisionState::Clone => "copy base client",
            ProvisionState::Patch => "patch client executable",
            ProvisionState::RecordFingerprint => "record fingerprint",
            ProvisionState::Ready | ProvisionState::Failed => "provision client",
        }
    }
}

/// Why a clone had to be (re)created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    NoClone,
    NoFingerprint,
    FingerprintChanged { recorded: u64 },
    MissingExecutable,
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaleReason::NoClone => write!(f, "no clone yet"),
            StaleReason::NoFingerprint => write!(f, "fingerprint missing"),
            StaleReason::FingerprintChanged { recorded } => {
                write!(f, "base client changed since {}", format_fingerprint(*recorded))
            }
            StaleReason::MissingExecutable => write!(f, "clone executable missing"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    Fresh { fingerprint: u64 },
    Stale { fingerprint: u64, reason: StaleReason },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    UpToDate {
        fingerprint: u64,
    },
    Provisioned {
        fingerprint: u64,
        reason: StaleReason,
        report: PatchReport,
    },
}

impl ProvisionOutcome {
    pub fn fingerprint(&self) -> u64 {
        match self {
            ProvisionOutcome::UpToDate { fingerprint }
            | ProvisionOutcome::Provisioned { fingerprint, .. } => *fingerprint,
        }
    }

    pub fn did_work(&self) -> bool {
        matches!(self, ProvisionOutcome::Provisioned { .. })
    }
}

/// A failed provisioning attempt and the state it failed in.
#[derive(Debug)]
pub struct ProvisionFailure {
    pub state: ProvisionState,
    pub error: SandboxError,
}

impl fmt::Display for ProvisionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::errors::display_for_sandbox_error(
            self.state.action(),
            &self.error,
        ))
    }
}

impl std::error::Error for ProvisionFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

fn at<T>(state: ProvisionState, r: Result<T>) -> std::result::Result<T, ProvisionFailure> {
    r.map_err(|error| ProvisionFailure { state, error })
}

#[derive(Debug, Clone)]
pub struct AppBundleProvisioner {
    catalog: Arc<PatchCatalog>,
}

impl AppBundleProvisioner {
    pub fn new(catalog: Arc<PatchCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &PatchCatalog {
        &self.catalog
    }

    /// Compare the base client's current fingerprint against the clone's sidecar.
    pub fn check(&self, base: &BaseClient, clone: &IdentityClone) -> Result<Staleness> {
        let fingerprint = hash_executable(&base.main_executable()?)?;
        if !clone.path.is_dir() {
            return Ok(Staleness::Stale {
                fingerprint,
                reason: StaleReason::NoClone,
            });
        }
        let reason = match clone.recorded_fingerprint() {
            None => StaleReason::NoFingerprint,
            Some(recorded) if recorded != fingerprint => {
                StaleReason::FingerprintChanged { recorded }
            }
            Some(_) => {
                if main_executable(&clone.path).is_err() {
                    StaleReason::MissingExecutable
                } else {
                    return Ok(Staleness::Fresh { fingerprint });
                }
            }
        };
        Ok(Staleness::Stale {
            fingerprint,
            reason,
        })
    }

    /// Bring `clone` up to date with `base`, copying and patching only when stale.
    #[cfg_attr(
        feature = "otel",
        instrument(
            level = "info",
            skip(self, base, clone),
            fields(client = %base.name, user = %clone.username)
        )
    )]
    pub fn provision(
        &self,
        base: &BaseClient,
        clone: &IdentityClone,
    ) -> std::result::Result<ProvisionOutcome, ProvisionFailure> {
        at(ProvisionState::CheckClone, refuse_inside(&clone.path, &base.path))?;
        at(ProvisionState::CheckClone, refuse_inside(&clone.sidecar, &base.path))?;

        let reason = match at(ProvisionState::CheckStale, self.check(base, clone))? {
            Staleness::Fresh { fingerprint } => {
                log(
                    LogLevel::Debug,
                    &format!(
                        "{}: clone of {} is current ({})",
                        clone.username,
                        base.name,
                        format_fingerprint(fingerprint)
                    ),
                );
                return Ok(ProvisionOutcome::UpToDate { fingerprint });
            }
            Staleness::Stale { reason, .. } => reason,
        };
        log(
            LogLevel::Info,
            &format!("{}: provisioning {} ({reason})", clone.username, base.name),
        );

        // Clone
        at(ProvisionState::Clone, clone.clear_fingerprint())?;
        at(ProvisionState::Clone, remove_dir_if_exists(&clone.path))?;
        let copied = at(ProvisionState::Clone, copy_dir_recursive(&base.path, &clone.path))?;
        log(
            LogLevel::Debug,
            &format!("{}: copied {copied} bytes into {}", clone.username, clone.path.display()),
        );

        // Patch
        let (fingerprint, report) = at(ProvisionState::Patch, self.patch_clone(base, clone))?;

        // RecordFingerprint
        at(ProvisionState::RecordFingerprint, clone.record_fingerprint(fingerprint))?;

        log(
            LogLevel::Info,
            &format!(
                "{}: {} ready; catalog {}: {} applied, {} already applied, {} not found",
                clone.username,
                clone.synthetic_name,
                report.catalog_version,
                report.applied(),
                report.already_applied(),
                report.missing()
            ),
        );
        Ok(ProvisionOutcome::Provisioned {
            fingerprint,
            reason,
            report,
        })
    }

    fn patch_clone(&self, base: &BaseClient, clone: &IdentityClone) -> Result<(u64, PatchReport)> {
        let base_exe = base.main_executable()?;
        let rel = base_exe
            .strip_prefix(&base.path)
            .map_err(|_| SandboxError::MissingExecutable(base_exe.clone()))?;
        let exe = clone.path.join(rel);
        if !exe.is_file() {
            return Err(SandboxError::MissingExecutable(exe));
        }
        let mut bytes = read_bytes(&exe)?;
        macho::parse(&bytes)?;
        let fingerprint = hash_executable_bytes(&bytes)?;
        let report = self.catalog.apply(&mut bytes);
        if report.changed() {
            write_atomic(&exe, &bytes)?;
        }
        Ok((fingerprint, report))
    }
}

//! clientforge: per-identity sandboxes for a single-instance desktop client.
//!
//! Architecture
//! - Binary glue (src/main.rs, src/cli.rs) parses the CLI, loads configuration and drives `Pipeline`.
//! - macho::*: bounds-checked Mach-O 64 parsing (`ByteCursor`) and masked byte search.
//! - hasher.rs: FNV-1a fingerprint of the __TEXT segment, the staleness key of a clone.
//! - patch.rs: versioned patch catalog (YAML) applied idempotently to executable bytes.
//! - provision.rs: clone, patch and fingerprint one identity's copy of a base client.
//! - identity.rs: per-identity bundle identifier and ad-hoc re-signing.
//! - profile.rs: private home tree and keychain per identity.
//! - launcher.rs: isolated environment, logs, process groups, staggered starts, termination.
//! - pipeline.rs: the per-identity flow, run for many identities in parallel.
//! - util::*: process execution (`CommandRunner`), filesystem and naming helpers.
//!
//! Environment
//! - CLIENTFORGE_DATA_DIR / CLIENTFORGE_CONFIG and the other CLIENTFORGE_* overrides (see config.rs).
//! - CLIENTFORGE_COLOR / NO_COLOR: color control for stderr/stdout helpers.
//! - CLIENTFORGE_VERBOSE=1: debug lines from `log`.
//! - CLIENTFORGE_TRACING=1 with feature `otel`: tracing events through tracing-subscriber.
//!
//! Invariants
//! - Base client bundles are only ever read.
//! - A clone's fingerprint sidecar exists only after a complete, successful provisioning.

pub mod accounts;
pub mod bundle;
pub mod clients;
mod color;
pub mod config;
mod errors;
pub mod hasher;
pub mod identity;
pub mod launcher;
pub mod lock;
pub mod macho;
pub mod patch;
pub mod pipeline;
pub mod profile;
pub mod provision;
#[cfg(feature = "otel")]
mod telemetry;
pub mod util;

pub use accounts::{Account, AccountRegistry, JsonFileRegistry, MemoryRegistry};
pub use bundle::{main_executable, BaseClient};
pub use clients::BaseClientCache;
pub use color::*;
pub use config::{Config, ENV_DATA_DIR};
pub use errors::*;
pub use hasher::{format_fingerprint, hash_executable, hash_executable_bytes, parse_fingerprint};
pub use identity::{IdentityRewriter, RewriteOutcome};
pub use launcher::{
    launch_environment, stop_instance, terminate, ClientFamily, LaunchGate, LaunchRequest, RunningInstance,
    SandboxLauncher, TerminateOutcome,
};
pub use patch::{PatchCatalog, PatchReport, PatchTarget, TargetOutcome};
pub use pipeline::{load_catalog, LaunchReport, Pipeline, PipelineError, PreparedIdentity};
pub use profile::{ProfileEnvironment, ProfileEnvironmentManager};
pub use provision::{
    AppBundleProvisioner, IdentityClone, ProvisionFailure, ProvisionOutcome, ProvisionState,
    StaleReason, Staleness,
};
#[cfg(feature = "otel")]
pub use telemetry::telemetry_init;
pub use util::exec::{CommandRunner, RecordingRunner, SystemRunner, ToolOutput};
pub use util::fs::{read_bytes, write_atomic};
pub use util::id::{identity_bundle_id, synthetic_client_name};

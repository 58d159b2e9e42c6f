#![allow(clippy::module_name_repetitions)]
//! One identity's path from account to running client:
//!   validate -> resolve base client -> lock -> provision -> re-identify ->
//!   profile tree -> secret store (warning only) -> launch -> instance record.
//!
//! Every failure is reported as one `PipelineError` line and leaves the
//! identity retryable; other identities are unaffected.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[cfg(feature = "otel")]
use tracing::instrument;

use crate::accounts::{Account, AccountRegistry};
use crate::bundle::{main_executable, BaseClient};
use crate::clients::BaseClientCache;
use crate::color::{log, LogLevel};
use crate::config::Config;
use crate::errors::{display_for_sandbox_error, SandboxError};
use crate::identity::{bundle_identifier, IdentityRewriter, RewriteOutcome};
use crate::launcher::{stop_instance, LaunchRequest, RunningInstance, SandboxLauncher, TerminateOutcome};
use crate::lock::{acquire_identity_lock, identity_lock_path, IdentityLock};
use crate::patch::PatchCatalog;
use crate::profile::{ProfileEnvironment, ProfileEnvironmentManager};
use crate::provision::{AppBundleProvisioner, IdentityClone, ProvisionOutcome};
use crate::util::exec::{CommandRunner, SystemRunner};
use crate::util::fs::remove_file_if_exists;
use crate::util::id::{identity_bundle_id, validate_username};

/// How long a pipeline waits for another process holding the same identity.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(30);

/// A failed identity pipeline, rendered as "failed to <step>: <reason>".
#[derive(Debug)]
pub struct PipelineError {
    pub username: String,
    pub step: &'static str,
    pub error: SandboxError,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&display_for_sandbox_error(self.step, &self.error))
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Result of preparing an identity for launch.
#[derive(Debug)]
pub struct PreparedIdentity {
    pub account: Account,
    pub clone: IdentityClone,
    pub bundle_id: String,
    pub executable: PathBuf,
    pub profile: ProfileEnvironment,
    pub provision: ProvisionOutcome,
    pub rewrite: RewriteOutcome,
    /// Non-fatal problems (secret store, registry updates).
    pub warnings: Vec<String>,
}

#[derive(Debug)]
pub struct LaunchReport {
    pub prepared: PreparedIdentity,
    pub instance: RunningInstance,
}

pub struct Pipeline {
    config: Config,
    cache: Mutex<BaseClientCache>,
    provisioner: AppBundleProvisioner,
    rewriter: IdentityRewriter,
    profiles: ProfileEnvironmentManager,
    launcher: SandboxLauncher,
    registry: Arc<dyn AccountRegistry>,
    lock_wait: Duration,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("data_root", &self.config.data_root)
            .field("catalog", &self.provisioner.catalog().version())
            .finish()
    }
}

/// Catalog from `config.catalog_path`, or the built-in one.
pub fn load_catalog(config: &Config) -> crate::errors::Result<PatchCatalog> {
    match &config.catalog_path {
        Some(p) => PatchCatalog::load(p),
        None => PatchCatalog::builtin(),
    }
}

impl Pipeline {
    pub fn new(
        config: Config,
        catalog: Arc<PatchCatalog>,
        runner: Arc<dyn CommandRunner>,
        registry: Arc<dyn AccountRegistry>,
    ) -> Self {
        let rewriter = IdentityRewriter::new(runner.clone(), &config.codesign, config.sign_timeout);
        let profiles = ProfileEnvironmentManager::new(
            config.profiles_root(),
            runner,
            &config.security,
            config.keychain_timeout,
        )
        .with_folders(config.document_dirs.clone(), config.companion_dirs.clone());
        Self {
            cache: Mutex::new(BaseClientCache::new(&config.clients_root)),
            provisioner: AppBundleProvisioner::new(catalog),
            launcher: SandboxLauncher::new(config.launch_stagger),
            rewriter,
            profiles,
            registry,
            config,
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    /// Pipeline with the configured catalog and the real codesign/security tools.
    pub fn from_config(config: Config, registry: Arc<dyn AccountRegistry>) -> crate::errors::Result<Self> {
        let catalog = Arc::new(load_catalog(&config)?);
        Ok(Self::new(config, catalog, Arc::new(SystemRunner::new()), registry))
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &dyn AccountRegistry {
        self.registry.as_ref()
    }

    pub fn catalog(&self) -> &PatchCatalog {
        self.provisioner.catalog()
    }

    /// Installed base clients; `force` rescans even if the directory looks unchanged.
    pub fn clients(&self, force: bool) -> crate::errors::Result<Vec<BaseClient>> {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.refresh(force)?;
        Ok(cache.clients().to_vec())
    }

    fn resolve(&self, name: &str) -> crate::errors::Result<BaseClient> {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.resolve(name)
    }

    fn lock(&self, username: &str) -> crate::errors::Result<IdentityLock> {
        let p = identity_lock_path(&self.config.data_root.join("locks"), username);
        acquire_identity_lock(&p, self.lock_wait)
    }

    fn clone_for(&self, account: &Account, base: &BaseClient) -> IdentityClone {
        IdentityClone::new(&self.config.clones_root(), &account.username, base)
    }

    /// Provision, re-identify and set up the profile, without launching.
    pub fn prepare(&self, account: &Account) -> Result<PreparedIdentity, PipelineError> {
        let _lock = self.begin(account)?;
        self.prepare_locked(account)
    }

    fn begin(&self, account: &Account) -> Result<IdentityLock, PipelineError> {
        let fail = |step: &'static str, error: SandboxError| PipelineError {
            username: account.username.clone(),
            step,
            error,
        };
        validate_username(&account.username)
            .map_err(|m| fail("validate account", SandboxError::Config(m)))?;
        self.lock(&account.username)
            .map_err(|e| fail("lock identity", e))
    }

    #[cfg_attr(
        feature = "otel",
        instrument(level = "info", skip(self, account), fields(user = %account.username, client = %account.client))
    )]
    fn prepare_locked(&self, account: &Account) -> Result<PreparedIdentity, PipelineError> {
        let fail = |step: &'static str, error: SandboxError| PipelineError {
            username: account.username.clone(),
            step,
            error,
        };
        let base = self
            .resolve(&account.client)
            .map_err(|e| fail("resolve base client", e))?;
        let clone = self.clone_for(account, &base);

        let provision = self
            .provisioner
            .provision(&base, &clone)
            .map_err(|f| fail(f.state.action(), f.error))?;

        let base_id = bundle_identifier(&base.path).map_err(|e| fail("read bundle identifier", e))?;
        let bundle_id = identity_bundle_id(&base_id, &account.username);
        // The sidecar is withheld while the clone is re-identified, so an
        // interrupted plist write or codesign is re-provisioned next time.
        let touches = provision.did_work()
            || self
                .rewriter
                .needs_rewrite(&clone.path, &bundle_id)
                .map_err(|e| fail("re-sign client", e))?;
        if touches {
            clone
                .clear_fingerprint()
                .map_err(|e| fail("re-sign client", e))?;
        }
        let rewrite = self
            .rewriter
            .ensure(&clone.path, &bundle_id, provision.did_work())
            .map_err(|e| fail("re-sign client", e))?;
        if touches {
            clone
                .record_fingerprint(provision.fingerprint())
                .map_err(|e| fail("record fingerprint", e))?;
        }
        let executable = main_executable(&clone.path).map_err(|e| fail("locate clone executable", e))?;

        let profile = self
            .profiles
            .ensure_tree(&account.username)
            .map_err(|e| fail("prepare profile", e))?;

        let mut warnings = Vec::new();
        if let Err(e) = self.profiles.ensure_secret_store(&profile) {
            warnings.push(display_for_sandbox_error("prepare keychain", &e));
        }
        if let Err(e) = self
            .registry
            .record_synthetic_client(&account.username, &clone.synthetic_name)
        {
            warnings.push(display_for_sandbox_error("record synthetic client", &e));
        }
        for w in &warnings {
            log(LogLevel::Warn, &format!("{}: {w}", account.username));
        }

        Ok(PreparedIdentity {
            account: account.clone(),
            clone,
            bundle_id,
            executable,
            profile,
            provision,
            rewrite,
            warnings,
        })
    }

    /// Prepare then start the client, waiting for the launch gate.
    pub fn launch(&self, account: &Account, deep_link: Option<&str>) -> Result<LaunchReport, PipelineError> {
        let _lock = self.begin(account)?;
        let mut prepared = self.prepare_locked(account)?;
        let instance = self
            .launcher
            .launch(&LaunchRequest {
                username: &account.username,
                client: &account.client,
                executable: &prepared.executable,
                profile: &prepared.profile,
                family: account.family,
                deep_link,
            })
            .map_err(|error| PipelineError {
                username: account.username.clone(),
                step: "launch client",
                error,
            })?;
        if let Err(e) = instance.save(&prepared.profile.instance_file()) {
            let w = display_for_sandbox_error("record instance", &e);
            log(LogLevel::Warn, &format!("{}: {w}", account.username));
            prepared.warnings.push(w);
        }
        Ok(LaunchReport { prepared, instance })
    }

    /// Run several identities: provisioning in parallel, starts staggered by the gate.
    /// Results come back in input order; one failure never affects the others.
    pub fn run_many(
        &self,
        accounts: &[Account],
        deep_link: Option<&str>,
    ) -> Vec<(String, Result<LaunchReport, PipelineError>)> {
        std::thread::scope(|s| {
            let handles: Vec<_> = accounts
                .iter()
                .enumerate()
                .map(|(i, account)| {
                    let duplicate = accounts[..i].iter().any(|a| a.username == account.username);
                    s.spawn(move || {
                        if duplicate {
                            return Err(PipelineError {
                                username: account.username.clone(),
                                step: "schedule identity",
                                error: SandboxError::Config(format!(
                                    "'{}' is listed more than once",
                                    account.username
                                )),
                            });
                        }
                        self.launch(account, deep_link)
                    })
                })
                .collect();
            accounts
                .iter()
                .zip(handles)
                .map(|(a, h)| {
                    let res = h.join().unwrap_or_else(|_| {
                        Err(PipelineError {
                            username: a.username.clone(),
                            step: "run identity",
                            error: SandboxError::Config("worker thread panicked".to_string()),
                        })
                    });
                    (a.username.clone(), res)
                })
                .collect()
        })
    }

    /// Stop the identity's last launched client. `Ok(None)` when nothing was recorded.
    pub fn stop(&self, username: &str, grace: Duration) -> crate::errors::Result<Option<TerminateOutcome>> {
        validate_username(username).map_err(SandboxError::Config)?;
        let profile = self.profiles.environment(username);
        let path = profile.instance_file();
        let Some(inst) = RunningInstance::load(&path)? else {
            return Ok(None);
        };
        let outcome = stop_instance(&inst, grace)?;
        remove_file_if_exists(&path)?;
        log(
            LogLevel::Info,
            &format!("{username}: stopped {} (pid {}): {outcome:?}", inst.client, inst.pid),
        );
        Ok(Some(outcome))
    }

    /// Remove the identity's clone and fingerprint so the next run re-provisions.
    pub fn reset(&self, account: &Account) -> Result<(), PipelineError> {
        let _lock = self.begin(account)?;
        let fail = |step: &'static str, error: SandboxError| PipelineError {
            username: account.username.clone(),
            step,
            error,
        };
        let base = self
            .resolve(&account.client)
            .map_err(|e| fail("resolve base client", e))?;
        self.clone_for(account, &base)
            .reset()
            .map_err(|e| fail("reset clone", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::MemoryRegistry;
    use crate::bundle::info_plist_path;
    use crate::macho::testutil::image;
    use crate::patch::PatchTarget;
    use crate::util::exec::{RecordingRunner, ToolOutput};
    use std::fs;
    use std::path::Path;

    fn install_base(clients: &Path, name: &str) {
        let b = clients.join(format!("{name}.app"));
        fs::create_dir_all(b.join("Contents/MacOS")).unwrap();
        fs::write(
            info_plist_path(&b),
            format!(
                "<plist><dict>\n<key>CFBundleExecutable</key>\n<string>{name}</string>\n<key>CFBundleIdentifier</key>\n<string>com.example.client</string>\n</dict></plist>\n"
            ),
        )
        .unwrap();
        fs::write(b.join("Contents/MacOS").join(name), image(0, 128, 256)).unwrap();
    }

    fn pipeline(root: &Path, runner: Arc<RecordingRunner>, registry: Arc<MemoryRegistry>) -> Pipeline {
        let mut cfg = Config::defaults(Some(root));
        cfg.data_root = root.join("data");
        cfg.clients_root = root.join("clients");
        cfg.codesign = PathBuf::from("/usr/bin/codesign");
        cfg.security = PathBuf::from("/usr/bin/security");
        cfg.launch_stagger = Duration::ZERO;
        let t = PatchTarget::from_hex("t", "CF FA ED FE", "DE AD BE EF", 110).unwrap();
        Pipeline::new(
            cfg,
            Arc::new(PatchCatalog::new("test-1", vec![t])),
            runner,
            registry,
        )
        .with_lock_wait(Duration::from_millis(200))
    }

    #[test]
    fn test_prepare_provisions_once_and_signs_once() {
        let td = tempfile::tempdir().expect("tmpdir");
        install_base(&td.path().join("clients"), "Default");
        let runner = Arc::new(RecordingRunner::succeeding());
        let registry = Arc::new(MemoryRegistry::new([Account::new("alice", "Default")]));
        let p = pipeline(td.path(), runner.clone(), registry.clone());
        let alice = Account::new("alice", "Default");

        let first = p.prepare(&alice).expect("prepare");
        assert!(first.provision.did_work());
        assert_eq!(first.rewrite, RewriteOutcome::Rewritten);
        assert_eq!(first.bundle_id, "com.example.client.alice");
        assert!(first.warnings.is_empty(), "{:?}", first.warnings);
        assert_eq!(bundle_identifier(&first.clone.path).unwrap(), first.bundle_id);
        assert_eq!(
            registry.get("alice").unwrap().unwrap().synthetic_client,
            Some(first.clone.synthetic_name.clone())
        );

        let second = p.prepare(&alice).expect("prepare again");
        assert!(!second.provision.did_work());
        assert_eq!(second.rewrite, RewriteOutcome::Unchanged);
        assert_eq!(runner.calls_to("codesign").len(), 1);
    }

    #[test]
    fn test_secret_store_failure_is_only_a_warning() {
        let td = tempfile::tempdir().expect("tmpdir");
        install_base(&td.path().join("clients"), "Default");
        let runner = Arc::new(RecordingRunner::with(|argv| {
            if argv[0].ends_with("security") {
                ToolOutput::failed(1, "security: keychain subsystem unavailable")
            } else {
                ToolOutput::ok("")
            }
        }));
        let p = pipeline(td.path(), runner, Arc::new(MemoryRegistry::default()));
        let prepared = p.prepare(&Account::new("bob", "Default")).expect("prepare");
        assert_eq!(prepared.warnings.len(), 2, "{:?}", prepared.warnings);
        assert!(prepared.warnings[0].starts_with("failed to prepare keychain:"));
    }

    #[test]
    fn test_failures_are_single_line_and_isolated() {
        let td = tempfile::tempdir().expect("tmpdir");
        install_base(&td.path().join("clients"), "Default");
        let runner = Arc::new(RecordingRunner::with(|argv| {
            if argv[0].ends_with("codesign") && argv[5].contains("/carol/") {
                ToolOutput::failed(1, "carol.app: a sealed resource is missing or invalid")
            } else {
                ToolOutput::ok("")
            }
        }));
        let p = pipeline(td.path(), runner, Arc::new(MemoryRegistry::default()));

        let err = p.prepare(&Account::new("dave", "Nope")).unwrap_err();
        assert_eq!(err.to_string(), "failed to resolve base client: unknown base client 'Nope'");

        let err = p.prepare(&Account::new("carol", "Default")).unwrap_err();
        assert_eq!(err.step, "re-sign client");
        assert!(!err.to_string().contains('\n'));
        let base = BaseClient::new("Default", td.path().join("clients/Default.app"));
        let carol = IdentityClone::new(&p.config().clones_root(), "carol", &base);
        assert!(carol.path.exists());
        assert!(!carol.sidecar.exists(), "a failed re-sign must leave the clone stale");

        assert!(p.prepare(&Account::new("erin", "Default")).is_ok());
        let err = p.prepare(&Account::new("../x", "Default")).unwrap_err();
        assert_eq!(err.step, "validate account");
    }

    #[test]
    fn test_identity_lock_blocks_second_pipeline() {
        let td = tempfile::tempdir().expect("tmpdir");
        install_base(&td.path().join("clients"), "Default");
        let p = pipeline(
            td.path(),
            Arc::new(RecordingRunner::succeeding()),
            Arc::new(MemoryRegistry::default()),
        );
        let held = p.lock("alice").unwrap();
        let err = p.prepare(&Account::new("alice", "Default")).unwrap_err();
        assert_eq!(err.step, "lock identity");
        drop(held);
        assert!(p.prepare(&Account::new("alice", "Default")).is_ok());
    }

    #[test]
    fn test_run_many_rejects_duplicates_and_reports_in_order() {
        let td = tempfile::tempdir().expect("tmpdir");
        let p = pipeline(
            td.path(),
            Arc::new(RecordingRunner::succeeding()),
            Arc::new(MemoryRegistry::default()),
        );
        let accounts = [
            Account::new("alice", "Missing"),
            Account::new("bob", "Missing"),
            Account::new("alice", "Missing"),
        ];
        let results = p.run_many(&accounts, None);
        let names: Vec<&str> = results.iter().map(|(u, _)| u.as_str()).collect();
        assert_eq!(names, ["alice", "bob", "alice"]);
        assert_eq!(results[0].1.as_ref().unwrap_err().step, "resolve base client");
        assert_eq!(results[2].1.as_ref().unwrap_err().step, "schedule identity");
    }

    #[test]
    fn test_stop_without_instance_and_reset() {
        let td = tempfile::tempdir().expect("tmpdir");
        install_base(&td.path().join("clients"), "Default");
        let p = pipeline(
            td.path(),
            Arc::new(RecordingRunner::succeeding()),
            Arc::new(MemoryRegistry::default()),
        );
        assert_eq!(p.stop("alice", Duration::from_millis(10)).unwrap(), None);

        let alice = Account::new("alice", "Default");
        let prepared = p.prepare(&alice).unwrap();
        p.reset(&alice).unwrap();
        assert!(!prepared.clone.path.exists());
        assert!(p.prepare(&alice).unwrap().provision.did_work());
    }

    #[test]
    fn test_interrupted_resign_is_reprovisioned() {
        let td = tempfile::tempdir().expect("tmpdir");
        install_base(&td.path().join("clients"), "Default");
        let alice = Account::new("alice", "Default");

        // The process dies inside codesign, after the plist was rewritten.
        let crashing = Arc::new(RecordingRunner::with(|argv| {
            if argv[0].ends_with("codesign") {
                panic!("killed during codesign");
            }
            ToolOutput::ok("")
        }));
        let p = pipeline(td.path(), crashing, Arc::new(MemoryRegistry::default()));
        let died = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| p.prepare(&alice)));
        assert!(died.is_err());
        let base = BaseClient::new("Default", td.path().join("clients/Default.app"));
        let clone = IdentityClone::new(&p.config().clones_root(), "alice", &base);
        assert_eq!(bundle_identifier(&clone.path).unwrap(), "com.example.client.alice");
        assert!(!clone.sidecar.exists());

        let runner = Arc::new(RecordingRunner::succeeding());
        let p = pipeline(td.path(), runner.clone(), Arc::new(MemoryRegistry::default()));
        let prepared = p.prepare(&alice).expect("prepare after crash");
        assert!(prepared.provision.did_work());
        assert_eq!(prepared.rewrite, RewriteOutcome::Rewritten);
        assert_eq!(runner.calls_to("codesign").len(), 1);
        assert_eq!(
            clone.recorded_fingerprint(),
            Some(prepared.provision.fingerprint())
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_stop_with_stale_record_leaves_reused_pid_alone() {
        let td = tempfile::tempdir().expect("tmpdir");
        let p = pipeline(
            td.path(),
            Arc::new(RecordingRunner::succeeding()),
            Arc::new(MemoryRegistry::default()),
        );
        let mut unrelated = std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("exec sleep 30")
            .spawn()
            .expect("spawn sleep");
        let record = p.profiles.environment("alice").instance_file();
        fs::create_dir_all(record.parent().unwrap()).unwrap();
        RunningInstance {
            pid: unrelated.id(),
            username: "alice".to_string(),
            client: "Default".to_string(),
            executable: td.path().join("clones/alice/Default.app/Contents/MacOS/Default"),
            family: Default::default(),
            launched_at: 0,
        }
        .save(&record)
        .unwrap();

        assert_eq!(
            p.stop("alice", Duration::from_millis(500)).unwrap(),
            Some(TerminateOutcome::AlreadyExited)
        );
        assert!(!record.exists());
        assert!(unrelated.try_wait().unwrap().is_none(), "unrelated process was signalled");
        let _ = unrelated.kill();
        let _ = unrelated.wait();
    }
}

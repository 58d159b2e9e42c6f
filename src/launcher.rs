#![allow(clippy::module_name_repetitions)]
//! Launching a provisioned clone inside its profile environment.
//!
//! - The child sees only the variables built by `launch_environment`.
//! - stdout/stderr are appended to the profile's log files.
//! - The child leads its own process group; a reaper thread collects its status.
//! - Starts are serialized through a `LaunchGate` with a minimum spacing.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::sys::signal::{kill, killpg, Signal};
#[cfg(unix)]
use nix::unistd::{getpgid, Pid};
use serde::{Deserialize, Serialize};

#[cfg(feature = "otel")]
use tracing::instrument;

use crate::color::{log, LogLevel};
use crate::errors::{Result, SandboxError};
use crate::profile::ProfileEnvironment;
#[cfg(unix)]
use crate::util::exec::{ExecRequest, ExecService};
use crate::util::fs::{read_string, write_atomic};

/// PATH handed to launched clients.
pub const LAUNCH_PATH: &str = "/usr/bin:/bin:/usr/sbin:/sbin";
const DEFAULT_LANG: &str = "en_US.UTF-8";
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientFamily {
    #[default]
    Desktop,
    /// Mobile app wrapped for the desktop; keeps its data under XDG_DATA_HOME.
    Mobile,
}

/// Persisted record of a launched client (`<profile>/instance.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningInstance {
    pub pid: u32,
    pub username: String,
    pub client: String,
    pub executable: PathBuf,
    #[serde(default)]
    pub family: ClientFamily,
    /// Seconds since the Unix epoch.
    pub launched_at: u64,
}

impl RunningInstance {
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| SandboxError::Config(format!("instance record: {e}")))?;
        write_atomic(path, &json)
    }

    /// Load a record; a missing file is `Ok(None)`.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = read_string(path)?;
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| SandboxError::Config(format!("{}: {e}", path.display())))
    }
}

/// Environment for a launched client. Nothing is inherited except LANG and the
/// login name of the account running clientforge.
pub fn launch_environment(profile: &ProfileEnvironment, family: ClientFamily) -> Vec<(String, String)> {
    let home = profile.home().display().to_string();
    let mut tmp = profile.tmp_dir().display().to_string();
    if !tmp.ends_with('/') {
        tmp.push('/');
    }
    let login = std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| profile.username.clone());
    let lang = std::env::var("LANG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_LANG.to_string());

    let mut env = vec![
        ("HOME".to_string(), home.clone()),
        ("CFFIXED_USER_HOME".to_string(), home),
        ("TMPDIR".to_string(), tmp),
        ("USER".to_string(), login.clone()),
        ("LOGNAME".to_string(), login),
        ("PATH".to_string(), LAUNCH_PATH.to_string()),
        ("LANG".to_string(), lang),
    ];
    if family == ClientFamily::Mobile {
        env.push((
            "XDG_DATA_HOME".to_string(),
            profile.application_support().display().to_string(),
        ));
    }
    env
}

/// Enforces a minimum delay between consecutive process starts.
#[derive(Debug)]
pub struct LaunchGate {
    stagger: Duration,
    last: Mutex<Option<Instant>>,
}

impl LaunchGate {
    pub fn new(stagger: Duration) -> Self {
        Self {
            stagger,
            last: Mutex::new(None),
        }
    }

    pub fn stagger(&self) -> Duration {
        self.stagger
    }

    /// Wait for this caller's turn, run `start`, and mark the start time.
    /// Callers are admitted one at a time.
    pub fn pass<T>(&self, start: impl FnOnce() -> T) -> T {
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(prev) = *last {
            let since = prev.elapsed();
            if since < self.stagger {
                std::thread::sleep(self.stagger - since);
            }
        }
        let out = start();
        *last = Some(Instant::now());
        out
    }
}

/// What launching needs to know about one identity.
#[derive(Debug, Clone, Copy)]
pub struct LaunchRequest<'a> {
    pub username: &'a str,
    pub client: &'a str,
    pub executable: &'a Path,
    pub profile: &'a ProfileEnvironment,
    pub family: ClientFamily,
    pub deep_link: Option<&'a str>,
}

#[derive(Debug)]
pub struct SandboxLauncher {
    gate: LaunchGate,
}

fn open_append(p: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(p)
        .map_err(|e| SandboxError::fs("open log", p, e))
}

impl SandboxLauncher {
    pub fn new(stagger: Duration) -> Self {
        Self {
            gate: LaunchGate::new(stagger),
        }
    }

    pub fn gate(&self) -> &LaunchGate {
        &self.gate
    }

    /// Start the client and return without waiting for it.
    #[cfg_attr(
        feature = "otel",
        instrument(
            level = "info",
            err,
            skip(self, req),
            fields(user = %req.username, client = %req.client)
        )
    )]
    pub fn launch(&self, req: &LaunchRequest<'_>) -> Result<RunningInstance> {
        if !req.executable.is_file() {
            return Err(SandboxError::MissingExecutable(req.executable.to_path_buf()));
        }
        let stdout = open_append(&req.profile.stdout_log())?;
        let stderr = open_append(&req.profile.stderr_log())?;

        let mut cmd = Command::new(req.executable);
        cmd.env_clear()
            .envs(launch_environment(req.profile, req.family))
            .current_dir(req.profile.home())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        if let Some(link) = req.deep_link {
            cmd.arg(link);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = self
            .gate
            .pass(|| cmd.spawn())
            .map_err(|e| SandboxError::fs("launch", req.executable, e))?;
        let pid = child.id();
        log(
            LogLevel::Info,
            &format!("{}: launched {} (pid {pid})", req.username, req.client),
        );
        spawn_reaper(child, req.username.to_string());

        Ok(RunningInstance {
            pid,
            username: req.username.to_string(),
            client: req.client.to_string(),
            executable: req.executable.to_path_buf(),
            family: req.family,
            launched_at: crate::util::unix_now(),
        })
    }
}

fn spawn_reaper(mut child: std::process::Child, username: String) {
    let pid = child.id();
    let res = std::thread::Builder::new()
        .name(format!("reap-{pid}"))
        .spawn(move || match child.wait() {
            Ok(status) => log(
                LogLevel::Debug,
                &format!("{username}: pid {pid} exited ({status})"),
            ),
            Err(e) => log(
                LogLevel::Warn,
                &format!("{username}: waiting for pid {pid} failed: {e}"),
            ),
        });
    if let Err(e) = res {
        log(
            LogLevel::Warn,
            &format!("could not start reaper for pid {pid}: {e}"),
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// No such process when asked to stop.
    AlreadyExited,
    /// Exited after SIGTERM within the grace period.
    Terminated,
    /// Needed SIGKILL.
    Killed,
}

#[cfg(unix)]
fn signal_error(pid: u32, e: Errno) -> SandboxError {
    SandboxError::ExternalToolFailure {
        tool: "kill".to_string(),
        code: e as i32,
        output: format!("pid {pid}: {}", e.desc()),
    }
}

/// Send `sig` to the process group led by `pid`. Launched clients always
/// lead their own group, so a pid outside one is never signalled.
#[cfg(unix)]
fn signal_group(pid: Pid, sig: Signal) -> std::result::Result<(), Errno> {
    killpg(pid, sig)
}

/// Path of the program `pid` is running, if it can be determined.
#[cfg(unix)]
fn process_executable(pid: u32) -> Option<PathBuf> {
    let proc_exe = PathBuf::from(format!("/proc/{pid}/exe"));
    if let Ok(target) = std::fs::read_link(&proc_exe) {
        let s = target.to_string_lossy();
        return Some(PathBuf::from(s.strip_suffix(" (deleted)").unwrap_or(&s)));
    }
    // No procfs (macOS): ps reports the full executable path as comm.
    let out = ExecService::new(Duration::from_secs(5))
        .run(
            ExecRequest::new("/bin/ps")
                .args(["-o", "comm=", "-p", &pid.to_string()])
                .inherit_env(true)
                .capture_output(true),
        )
        .ok()?;
    let comm = out.stdout.trim();
    (out.status.success() && !comm.is_empty()).then(|| PathBuf::from(comm))
}

#[cfg(unix)]
fn same_file(a: &Path, b: &Path) -> bool {
    let canon = |p: &Path| std::fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf());
    canon(a) == canon(b)
}

impl RunningInstance {
    /// True while the recorded pid still leads its own process group and runs
    /// the recorded executable. A reused pid fails one of the two.
    #[cfg(unix)]
    pub fn is_live(&self) -> bool {
        let Some(raw) = i32::try_from(self.pid).ok().filter(|p| *p > 1) else {
            return false;
        };
        let pid = Pid::from_raw(raw);
        if getpgid(Some(pid)).ok() != Some(pid) {
            return false;
        }
        process_executable(self.pid)
            .map(|exe| same_file(&exe, &self.executable))
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    pub fn is_live(&self) -> bool {
        false
    }
}

/// Stop the client a record describes. A record whose pid no longer belongs
/// to that client is `AlreadyExited` and nothing is signalled.
pub fn stop_instance(inst: &RunningInstance, grace: Duration) -> Result<TerminateOutcome> {
    if !inst.is_live() {
        log(
            LogLevel::Debug,
            &format!("{}: pid {} is no longer {}", inst.username, inst.pid, inst.executable.display()),
        );
        return Ok(TerminateOutcome::AlreadyExited);
    }
    terminate(inst.pid, grace)
}

#[cfg(unix)]
fn alive(pid: Pid) -> bool {
    !matches!(kill(pid, None), Err(Errno::ESRCH))
}

#[cfg(unix)]
fn wait_gone(pid: Pid, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    loop {
        if !alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Stop a launched client: SIGTERM, wait up to `grace`, then SIGKILL.
#[cfg(unix)]
pub fn terminate(pid: u32, grace: Duration) -> Result<TerminateOutcome> {
    let raw = i32::try_from(pid)
        .ok()
        .filter(|p| *p > 1)
        .ok_or_else(|| SandboxError::Config(format!("refusing to signal pid {pid}")))?;
    let target = Pid::from_raw(raw);

    match signal_group(target, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return Ok(TerminateOutcome::AlreadyExited),
        Err(e) => return Err(signal_error(pid, e)),
    }
    if wait_gone(target, grace) {
        return Ok(TerminateOutcome::Terminated);
    }

    log(
        LogLevel::Warn,
        &format!("pid {pid} ignored SIGTERM for {grace:?}; sending SIGKILL"),
    );
    match signal_group(target, Signal::SIGKILL) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return Ok(TerminateOutcome::Terminated),
        Err(e) => return Err(signal_error(pid, e)),
    }
    wait_gone(target, Duration::from_secs(2));
    Ok(TerminateOutcome::Killed)
}

#[cfg(not(unix))]
pub fn terminate(pid: u32, _grace: Duration) -> Result<TerminateOutcome> {
    Err(SandboxError::Config(format!(
        "terminating pid {pid} is only supported on unix"
    )))
}

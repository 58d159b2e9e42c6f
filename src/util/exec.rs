//! External command execution: the timed `ExecService` and the `CommandRunner`
//! capability used for codesign/security so tests can substitute a fake.

use std::ffi::OsString;
use std::io;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use wait_timeout::ChildExt;

/// Structured command execution with timeouts.
#[derive(Debug, Clone)]
pub struct ExecService {
    default_timeout: Duration,
}

impl ExecService {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    pub fn run(&self, request: ExecRequest) -> Result<ExecOutput> {
        let mut cmd = Command::new(&request.program);
        for arg in &request.args {
            cmd.arg(arg);
        }
        if !request.inherit_env {
            cmd.env_clear();
        }

        for (key, value) in request.env {
            cmd.env(&key, &value);
        }

        if request.capture_output {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "failed to spawn {:?} with args {:?}",
                request.program, request.args
            )
        })?;

        // Drain both pipes while the child runs; a full pipe would stall it.
        let stdout_reader = request
            .capture_output
            .then(|| child.stdout.take().map(spawn_reader))
            .flatten();
        let stderr_reader = request
            .capture_output
            .then(|| child.stderr.take().map(spawn_reader))
            .flatten();

        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let status = if timeout.is_zero() {
            child.wait().context("failed to wait for process")?
        } else {
            match child
                .wait_timeout(timeout)
                .context("failed to wait with timeout")?
            {
                Some(status) => status,
                None => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(anyhow!(
                        "command {:?} timed out after {:?}",
                        request.program,
                        timeout
                    ));
                }
            }
        };

        let stdout = join_reader(stdout_reader)?;
        let stderr = join_reader(stderr_reader)?;

        Ok(ExecOutput {
            status,
            stdout,
            stderr,
        })
    }
}

type Reader = JoinHandle<io::Result<String>>;

fn spawn_reader(mut stream: impl io::Read + Send + 'static) -> Reader {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    })
}

fn join_reader(reader: Option<Reader>) -> Result<String> {
    match reader {
        Some(handle) => handle
            .join()
            .map_err(|_| anyhow!("output reader panicked"))?
            .context("failed to read process output"),
        None => Ok(String::new()),
    }
}

impl Default for ExecService {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[derive(Debug, Default)]
pub struct ExecRequest {
    program: OsString,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    inherit_env: bool,
    timeout: Option<Duration>,
    capture_output: bool,
}

impl ExecRequest {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            inherit_env: false,
            ..Self::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn inherit_env(mut self, inherit: bool) -> Self {
        self.inherit_env = inherit;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }
}

#[derive(Debug)]
pub struct ExecOutput {
    pub status: std::process::ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    /// stdout followed by stderr, the way the tools' messages are matched.
    pub fn combined(&self) -> String {
        let mut s = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !s.is_empty() && !s.ends_with('\n') {
                s.push('\n');
            }
            s.push_str(&self.stderr);
        }
        s
    }
}

/// Exit code and combined output of an external tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub code: i32,
    pub output: String,
}

impl ToolOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            code: 0,
            output: output.into(),
        }
    }

    pub fn failed(code: i32, output: impl Into<String>) -> Self {
        Self {
            code,
            output: output.into(),
        }
    }
}

/// Capability to run an external program. `env` entries are applied on top
/// of the inherited environment.
pub trait CommandRunner: Send + Sync {
    fn run(&self, argv: &[String], env: &[(String, String)], timeout: Duration) -> Result<ToolOutput>;
}

/// Runs real processes through `ExecService`.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    exec: ExecService,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, argv: &[String], env: &[(String, String)], timeout: Duration) -> Result<ToolOutput> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("empty command line"))?;
        let mut req = ExecRequest::new(program)
            .args(args)
            .inherit_env(true)
            .capture_output(true)
            .timeout(timeout);
        for (k, v) in env {
            req = req.env(k, v);
        }
        let out = self.exec.run(req)?;
        Ok(ToolOutput {
            code: out.status.code().unwrap_or(-1),
            output: out.combined(),
        })
    }
}

type Responder = Box<dyn Fn(&[String]) -> ToolOutput + Send + Sync>;

/// Invocation captured by `RecordingRunner`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Fake runner that records every call and answers from a closure.
pub struct RecordingRunner {
    calls: Mutex<Vec<RecordedCall>>,
    respond: Responder,
}

impl RecordingRunner {
    /// Every call succeeds with empty output.
    pub fn succeeding() -> Self {
        Self::with(|_| ToolOutput::ok(""))
    }

    pub fn with(respond: impl Fn(&[String]) -> ToolOutput + Send + Sync + 'static) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Calls whose program (argv[0] file name) equals `tool`.
    pub fn calls_to(&self, tool: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| {
                c.argv
                    .first()
                    .and_then(|p| std::path::Path::new(p).file_name())
                    .map(|n| n == tool)
                    .unwrap_or(false)
            })
            .collect()
    }
}

impl std::fmt::Debug for RecordingRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingRunner")
            .field("calls", &self.calls().len())
            .finish()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, argv: &[String], env: &[(String, String)], _timeout: Duration) -> Result<ToolOutput> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                argv: argv.to_vec(),
                env: env.to_vec(),
            });
        }
        Ok((self.respond)(argv))
    }
}

/// Run a tool and require exit code 0 and none of `failure_markers`
/// (matched case-insensitively) in its combined output.
pub fn run_checked(
    runner: &dyn CommandRunner,
    argv: &[String],
    env: &[(String, String)],
    timeout: Duration,
    failure_markers: &[&str],
) -> crate::errors::Result<String> {
    let tool = argv
        .first()
        .and_then(|p| std::path::Path::new(p).file_name())
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "command".to_string());
    let out = runner
        .run(argv, env, timeout)
        .map_err(|e| crate::errors::SandboxError::ExternalToolFailure {
            tool: tool.clone(),
            code: -1,
            output: format!("{e:#}"),
        })?;
    let lower = out.output.to_ascii_lowercase();
    let marker_hit = failure_markers
        .iter()
        .any(|m| lower.contains(&m.to_ascii_lowercase()));
    if out.code != 0 || marker_hit {
        return Err(crate::errors::SandboxError::ExternalToolFailure {
            tool,
            code: out.code,
            output: out.output,
        });
    }
    Ok(out.output)
}

//! Error mapping guide:
//! - Map io::ErrorKind::NotFound to exit code 127; all others to 1.
//! - SandboxError carries the failure class; `display_for_sandbox_error` renders the
//!   single user-facing line surfaced for a failed identity pipeline.
//! - Patch targets that do not match and already-applied patches are report entries, never errors.
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Map an io::Error to a process exit code:
/// - 127 for NotFound (command not found)
/// - 1 for all other errors
pub fn exit_code_for_io_error(e: &io::Error) -> u8 {
    if e.kind() == io::ErrorKind::NotFound {
        127
    } else {
        1
    }
}

/// Failure classes of the provisioning and launch core.
#[derive(Debug)]
pub enum SandboxError {
    /// File does not start with the 64-bit Mach-O magic or its load commands are malformed.
    NotExecutableFormat(String),
    /// Copy/remove/create/read/write failure with the path it happened on.
    Filesystem {
        context: &'static str,
        path: PathBuf,
        source: io::Error,
    },
    /// codesign/security returned non-zero or printed a known failure.
    ExternalToolFailure {
        tool: String,
        code: i32,
        output: String,
    },
    /// The bundle has no main executable where one was expected.
    MissingExecutable(PathBuf),
    /// Info.plist missing or lacking a bundle identifier.
    MissingMetadata(String),
    /// No base client of that name is installed.
    UnknownClient(String),
    /// Invalid configuration or patch catalog data.
    Config(String),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

impl SandboxError {
    pub fn fs(context: &'static str, path: &Path, source: io::Error) -> Self {
        SandboxError::Filesystem {
            context,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn format(msg: impl Into<String>) -> Self {
        SandboxError::NotExecutableFormat(msg.into())
    }
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxError::NotExecutableFormat(msg) => write!(f, "not a Mach-O 64 executable: {msg}"),
            SandboxError::Filesystem {
                context,
                path,
                source,
            } => write!(f, "{context} {}: {source}", path.display()),
            SandboxError::ExternalToolFailure { tool, code, output } => {
                let out = output.trim();
                if out.is_empty() {
                    write!(f, "{tool} failed with exit code {code}")
                } else {
                    write!(f, "{tool} failed with exit code {code}: {out}")
                }
            }
            SandboxError::MissingExecutable(p) => {
                write!(f, "main executable not found in bundle {}", p.display())
            }
            SandboxError::MissingMetadata(msg) => write!(f, "bundle metadata: {msg}"),
            SandboxError::UnknownClient(name) => write!(f, "unknown base client '{name}'"),
            SandboxError::Config(msg) => write!(f, "configuration: {msg}"),
        }
    }
}

impl std::error::Error for SandboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SandboxError::Filesystem { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Convert SandboxError to exit code (parity with io::Error mapping).
pub fn exit_code_for_sandbox_error(e: &SandboxError) -> u8 {
    match e {
        SandboxError::Filesystem { source, .. } => exit_code_for_io_error(source),
        SandboxError::MissingExecutable(_) | SandboxError::UnknownClient(_) => 127,
        _ => 1,
    }
}

/// Render the single user-facing line for a failed pipeline step, e.g.
/// "failed to copy base client: copy /x/y: No space left on device".
pub fn display_for_sandbox_error(step: &str, e: &SandboxError) -> String {
    format!("failed to {step}: {e}")
}

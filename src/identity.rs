#![allow(clippy::module_name_repetitions)]
//! Re-identification and ad-hoc re-signing of a clone.
//!
//! The check (`needs_rewrite`) only reads Info.plist, so launches after the
//! first skip the expensive codesign run entirely.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "otel")]
use tracing::instrument;

use crate::bundle::{info_plist_path, plist_string_value, KEY_IDENTIFIER};
use crate::color::{log, LogLevel};
use crate::errors::{Result, SandboxError};
use crate::util::exec::{run_checked, CommandRunner};
use crate::util::fs::{read_string, write_atomic};

/// Output fragments codesign prints on failures it still exits 0 for in some versions.
pub const CODESIGN_FAILURE_MARKERS: &[&str] = &[
    "no identity found",
    "resource fork, finder information, or similar detritus not allowed",
    "invalid or unsupported format",
    "errsecinternalcomponent",
    "a sealed resource is missing or invalid",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteOutcome {
    /// Identifier already correct and no re-sign was requested.
    Unchanged,
    /// Identifier correct, bundle re-signed because its code changed.
    Resigned,
    /// Identifier rewritten and bundle re-signed.
    Rewritten,
}

#[derive(Clone)]
pub struct IdentityRewriter {
    runner: Arc<dyn CommandRunner>,
    codesign: PathBuf,
    timeout: Duration,
}

impl std::fmt::Debug for IdentityRewriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityRewriter")
            .field("codesign", &self.codesign)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Replace the CFBundleIdentifier value in plist text.
pub fn replace_bundle_identifier(plist: &str, new_id: &str) -> Result<String> {
    let (range, _) = plist_string_value(plist, KEY_IDENTIFIER)
        .ok_or_else(|| SandboxError::MissingMetadata(format!("no {KEY_IDENTIFIER} entry")))?;
    let mut out = String::with_capacity(plist.len() + new_id.len());
    out.push_str(&plist[..range.start]);
    out.push_str(new_id);
    out.push_str(&plist[range.end..]);
    Ok(out)
}

/// The identifier a bundle declares.
pub fn bundle_identifier(bundle: &Path) -> Result<String> {
    let p = info_plist_path(bundle);
    if !p.is_file() {
        return Err(SandboxError::MissingMetadata(format!(
            "{} not found",
            p.display()
        )));
    }
    let text = read_string(&p)?;
    plist_string_value(&text, KEY_IDENTIFIER)
        .map(|(_, v)| v.trim().to_string())
        .ok_or_else(|| {
            SandboxError::MissingMetadata(format!("{} has no {KEY_IDENTIFIER}", p.display()))
        })
}

impl IdentityRewriter {
    pub fn new(runner: Arc<dyn CommandRunner>, codesign: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            runner,
            codesign: codesign.into(),
            timeout,
        }
    }

    /// True when the clone does not yet declare `identifier`.
    pub fn needs_rewrite(&self, clone: &Path, identifier: &str) -> Result<bool> {
        Ok(bundle_identifier(clone)? != identifier)
    }

    /// Write `identifier` into the clone's Info.plist, then re-sign.
    pub fn rewrite(&self, clone: &Path, identifier: &str) -> Result<()> {
        let p = info_plist_path(clone);
        let text = read_string(&p)?;
        let updated = replace_bundle_identifier(&text, identifier)?;
        write_atomic(&p, updated.as_bytes())?;
        self.resign(clone)
    }

    /// Ad-hoc sign the whole bundle, replacing any existing signature.
    #[cfg_attr(
        feature = "otel",
        instrument(level = "info", err, skip(self), fields(bundle = %clone.display()))
    )]
    pub fn resign(&self, clone: &Path) -> Result<()> {
        let argv = vec![
            self.codesign.display().to_string(),
            "--force".to_string(),
            "--deep".to_string(),
            "--sign".to_string(),
            "-".to_string(),
            clone.display().to_string(),
        ];
        log(
            LogLevel::Debug,
            &format!("signing: {}", crate::util::shell_join(&argv)),
        );
        run_checked(
            self.runner.as_ref(),
            &argv,
            &[],
            self.timeout,
            CODESIGN_FAILURE_MARKERS,
        )?;
        Ok(())
    }

    /// Rewrite when the identifier differs; otherwise re-sign only if `code_changed`.
    pub fn ensure(&self, clone: &Path, identifier: &str, code_changed: bool) -> Result<RewriteOutcome> {
        if self.needs_rewrite(clone, identifier)? {
            self.rewrite(clone, identifier)?;
            return Ok(RewriteOutcome::Rewritten);
        }
        if code_changed {
            self.resign(clone)?;
            return Ok(RewriteOutcome::Resigned);
        }
        Ok(RewriteOutcome::Unchanged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::exec::{RecordingRunner, ToolOutput};
    use std::fs;

    const PLIST: &str = "<plist><dict>\n<key>CFBundleIdentifier</key>\n<string>com.example.client</string>\n</dict></plist>\n";

    fn bundle(root: &Path) -> PathBuf {
        let b = root.join("Default-0011.app");
        fs::create_dir_all(b.join("Contents")).unwrap();
        fs::write(info_plist_path(&b), PLIST).unwrap();
        b
    }

    #[test]
    fn test_replace_bundle_identifier() {
        let out = replace_bundle_identifier(PLIST, "com.example.client.alice").unwrap();
        assert!(out.contains("<string>com.example.client.alice</string>"));
        assert_eq!(out.len(), PLIST.len() + ".alice".len());
        assert!(matches!(
            replace_bundle_identifier("<plist/>", "x"),
            Err(SandboxError::MissingMetadata(_))
        ));
    }

    #[test]
    fn test_ensure_rewrites_once_then_skips_signing() {
        let td = tempfile::tempdir().expect("tmpdir");
        let b = bundle(td.path());
        let runner = Arc::new(RecordingRunner::succeeding());
        let rw = IdentityRewriter::new(runner.clone(), "/usr/bin/codesign", Duration::from_secs(5));

        assert!(rw.needs_rewrite(&b, "com.example.client.alice").unwrap());
        assert_eq!(
            rw.ensure(&b, "com.example.client.alice", true).unwrap(),
            RewriteOutcome::Rewritten
        );
        assert_eq!(bundle_identifier(&b).unwrap(), "com.example.client.alice");
        let calls = runner.calls_to("codesign");
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].argv[1..5],
            ["--force", "--deep", "--sign", "-"].map(String::from)
        );
        assert_eq!(calls[0].argv[5], b.display().to_string());

        assert_eq!(
            rw.ensure(&b, "com.example.client.alice", false).unwrap(),
            RewriteOutcome::Unchanged
        );
        assert_eq!(runner.calls_to("codesign").len(), 1);

        assert_eq!(
            rw.ensure(&b, "com.example.client.alice", true).unwrap(),
            RewriteOutcome::Resigned
        );
        assert_eq!(runner.calls_to("codesign").len(), 2);
    }

    #[test]
    fn test_codesign_failure_surfaces_output() {
        let td = tempfile::tempdir().expect("tmpdir");
        let b = bundle(td.path());
        let runner = Arc::new(RecordingRunner::with(|_| {
            ToolOutput::failed(1, "Default.app: resource fork, Finder information, or similar detritus not allowed")
        }));
        let rw = IdentityRewriter::new(runner, "codesign", Duration::from_secs(5));
        match rw.rewrite(&b, "com.example.client.bob") {
            Err(SandboxError::ExternalToolFailure { tool, code, output }) => {
                assert_eq!(tool, "codesign");
                assert_eq!(code, 1);
                assert!(output.contains("detritus"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_missing_plist_is_metadata_error() {
        let td = tempfile::tempdir().expect("tmpdir");
        let rw = IdentityRewriter::new(
            Arc::new(RecordingRunner::succeeding()),
            "codesign",
            Duration::from_secs(5),
        );
        assert!(matches!(
            rw.needs_rewrite(td.path(), "x"),
            Err(SandboxError::MissingMetadata(_))
        ));
    }
}

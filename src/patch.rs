#![allow(clippy::module_name_repetitions)]
//! Patch targets and the catalog that applies them to an executable image.
//!
//! Invariants
//! - Targets are independent: each is searched against the full buffer.
//! - A target whose pattern is absent is skipped and reported, never an error.
//! - Bytes already equal to the replacement are left alone, so applying a
//!   catalog twice is a no-op the second time.
//! - The catalog never touches the disk; writing back is the caller's decision.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::color::{log, LogLevel};
use crate::errors::{Result, SandboxError};
use crate::macho::scan::find_masked;

const BUILTIN_CATALOG: &str = include_str!("../catalogs/default.yml");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchTarget {
    pub name: String,
    pub pattern: Vec<u8>,
    pub mask: Vec<u8>,
    pub replacement: Vec<u8>,
    /// Write location relative to the match start; may be negative.
    pub offset: i64,
}

impl PatchTarget {
    pub fn new(
        name: impl Into<String>,
        pattern: Vec<u8>,
        mask: Vec<u8>,
        replacement: Vec<u8>,
        offset: i64,
    ) -> Result<Self> {
        let name = name.into();
        if pattern.is_empty() {
            return Err(SandboxError::Config(format!(
                "patch target '{name}': empty pattern"
            )));
        }
        if pattern.len() != mask.len() {
            return Err(SandboxError::Config(format!(
                "patch target '{name}': pattern has {} bytes but mask has {}",
                pattern.len(),
                mask.len()
            )));
        }
        if mask.iter().all(|m| *m == 0) {
            return Err(SandboxError::Config(format!(
                "patch target '{name}': mask is all wildcards"
            )));
        }
        if replacement.is_empty() {
            return Err(SandboxError::Config(format!(
                "patch target '{name}': empty replacement"
            )));
        }
        Ok(Self {
            name,
            pattern,
            mask,
            replacement,
            offset,
        })
    }

    /// Build from hex text, e.g. `"AA ?? CC"`; `??` positions become wildcards.
    pub fn from_hex(name: &str, pattern: &str, replacement: &str, offset: i64) -> Result<Self> {
        let (pat, mask) = parse_hex_pattern(pattern)?;
        let (rep, rep_mask) = parse_hex_pattern(replacement)?;
        if rep_mask.iter().any(|m| *m != 0xFF) {
            return Err(SandboxError::Config(format!(
                "patch target '{name}': replacement may not contain wildcards"
            )));
        }
        Self::new(name, pat, mask, rep, offset)
    }
}

/// Parse hex bytes separated by optional whitespace; `??` is a wildcard byte.
/// Returns (pattern, mask).
pub fn parse_hex_pattern(s: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let compact: Vec<char> = s.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() % 2 != 0 {
        return Err(SandboxError::Config(format!(
            "hex pattern '{s}' has an odd number of digits"
        )));
    }
    let mut pattern = Vec::with_capacity(compact.len() / 2);
    let mut mask = Vec::with_capacity(compact.len() / 2);
    for pair in compact.chunks(2) {
        if pair == ['?', '?'] {
            pattern.push(0);
            mask.push(0);
            continue;
        }
        let hi = pair[0].to_digit(16);
        let lo = pair[1].to_digit(16);
        match (hi, lo) {
            (Some(h), Some(l)) => {
                pattern.push(((h << 4) | l) as u8);
                mask.push(0xFF);
            }
            _ => {
                return Err(SandboxError::Config(format!(
                    "invalid hex byte '{}{}' in '{s}'",
                    pair[0], pair[1]
                )))
            }
        }
    }
    Ok((pattern, mask))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOutcome {
    Applied { at: usize },
    AlreadyApplied { at: usize },
    NotFound,
    /// The pattern matched but the write location falls outside the buffer.
    OutOfRange { matched: usize },
}

impl fmt::Display for TargetOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetOutcome::Applied { at } => write!(f, "applied at 0x{at:x}"),
            TargetOutcome::AlreadyApplied { at } => write!(f, "already applied at 0x{at:x}"),
            TargetOutcome::NotFound => write!(f, "pattern not found"),
            TargetOutcome::OutOfRange { matched } => {
                write!(f, "matched at 0x{matched:x} but write location is out of range")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchReport {
    pub catalog_version: String,
    pub entries: Vec<(String, TargetOutcome)>,
}

impl PatchReport {
    /// Number of targets newly written in this run.
    pub fn applied(&self) -> usize {
        self.count(|o| matches!(o, TargetOutcome::Applied { .. }))
    }

    pub fn already_applied(&self) -> usize {
        self.count(|o| matches!(o, TargetOutcome::AlreadyApplied { .. }))
    }

    pub fn missing(&self) -> usize {
        self.count(|o| {
            matches!(
                o,
                TargetOutcome::NotFound | TargetOutcome::OutOfRange { .. }
            )
        })
    }

    pub fn changed(&self) -> bool {
        self.applied() > 0
    }

    fn count(&self, f: impl Fn(&TargetOutcome) -> bool) -> usize {
        self.entries.iter().filter(|(_, o)| f(o)).count()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    version: String,
    #[serde(default)]
    targets: Vec<TargetFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TargetFile {
    name: String,
    pattern: String,
    #[serde(default)]
    mask: Option<String>,
    replacement: String,
    #[serde(default)]
    offset: i64,
}

/// Versioned, immutable list of patch targets. Shared read-only across workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchCatalog {
    version: String,
    targets: Vec<PatchTarget>,
}

impl PatchCatalog {
    pub fn new(version: impl Into<String>, targets: Vec<PatchTarget>) -> Self {
        Self {
            version: version.into(),
            targets,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn targets(&self) -> &[PatchTarget] {
        &self.targets
    }

    /// The catalog compiled into the binary.
    pub fn builtin() -> Result<Self> {
        Self::from_yaml_str(BUILTIN_CATALOG)
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let file: CatalogFile = serde_yaml::from_str(s)
            .map_err(|e| SandboxError::Config(format!("patch catalog: {e}")))?;
        let mut targets = Vec::with_capacity(file.targets.len());
        for t in file.targets {
            let (pattern, derived_mask) = parse_hex_pattern(&t.pattern)?;
            let mask = match t.mask {
                Some(m) => {
                    let (mask, mask_mask) = parse_hex_pattern(&m)?;
                    if mask_mask.iter().any(|b| *b != 0xFF) {
                        return Err(SandboxError::Config(format!(
                            "patch target '{}': mask may not contain wildcards",
                            t.name
                        )));
                    }
                    mask
                }
                None => derived_mask,
            };
            let (replacement, rep_mask) = parse_hex_pattern(&t.replacement)?;
            if rep_mask.iter().any(|b| *b != 0xFF) {
                return Err(SandboxError::Config(format!(
                    "patch target '{}': replacement may not contain wildcards",
                    t.name
                )));
            }
            targets.push(PatchTarget::new(t.name, pattern, mask, replacement, t.offset)?);
        }
        Ok(Self::new(file.version, targets))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let s = fs::read_to_string(path).map_err(|e| SandboxError::fs("read", path, e))?;
        Self::from_yaml_str(&s)
    }

    /// Apply every target to `buf` in place.
    pub fn apply(&self, buf: &mut [u8]) -> PatchReport {
        let mut report = PatchReport {
            catalog_version: self.version.clone(),
            entries: Vec::with_capacity(self.targets.len()),
        };
        for target in &self.targets {
            let outcome = apply_target(target, buf);
            match outcome {
                TargetOutcome::Applied { .. } | TargetOutcome::AlreadyApplied { .. } => {
                    log(LogLevel::Debug, &format!("patch '{}': {}", target.name, outcome))
                }
                TargetOutcome::NotFound | TargetOutcome::OutOfRange { .. } => log(
                    LogLevel::Info,
                    &format!("patch '{}': {}; skipping", target.name, outcome),
                ),
            }
            report.entries.push((target.name.clone(), outcome));
        }
        report
    }
}

fn apply_target(target: &PatchTarget, buf: &mut [u8]) -> TargetOutcome {
    let matched = match find_masked(buf, &target.pattern, &target.mask) {
        Some(m) => m,
        None => return TargetOutcome::NotFound,
    };
    let at = match i64::try_from(matched)
        .ok()
        .and_then(|m| m.checked_add(target.offset))
        .and_then(|a| usize::try_from(a).ok())
    {
        Some(a) => a,
        None => return TargetOutcome::OutOfRange { matched },
    };
    let end = match at.checked_add(target.replacement.len()) {
        Some(e) if e <= buf.len() => e,
        _ => return TargetOutcome::OutOfRange { matched },
    };
    if buf[at..end] == target.replacement[..] {
        return TargetOutcome::AlreadyApplied { at };
    }
    buf[at..end].copy_from_slice(&target.replacement);
    TargetOutcome::Applied { at }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(targets: Vec<PatchTarget>) -> PatchCatalog {
        PatchCatalog::new("test", targets)
    }

    #[test]
    fn test_parse_hex_pattern_wildcards() {
        let (p, m) = parse_hex_pattern("AA ?? cc").unwrap();
        assert_eq!(p, vec![0xAA, 0x00, 0xCC]);
        assert_eq!(m, vec![0xFF, 0x00, 0xFF]);
        let (p, _) = parse_hex_pattern("deadbeef").unwrap();
        assert_eq!(p, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(parse_hex_pattern("ABC").is_err());
        assert!(parse_hex_pattern("ZZ").is_err());
    }

    #[test]
    fn test_target_validation() {
        assert!(PatchTarget::new("t", vec![1, 2], vec![0xFF], vec![1], 0).is_err());
        assert!(PatchTarget::new("t", vec![], vec![], vec![1], 0).is_err());
        assert!(PatchTarget::new("t", vec![1], vec![0], vec![1], 0).is_err());
        assert!(PatchTarget::from_hex("t", "AA", "??", 0).is_err());
    }

    #[test]
    fn test_apply_twice_is_idempotent() {
        let t = PatchTarget::from_hex("t", "11 22 ?? 44", "DE AD BE EF", 4).unwrap();
        let cat = catalog(vec![t]);
        let mut buf = vec![0u8; 32];
        buf[8..12].copy_from_slice(&[0x11, 0x22, 0x99, 0x44]);

        let first = cat.apply(&mut buf);
        assert_eq!(first.applied(), 1);
        assert_eq!(&buf[12..16], &[0xDE, 0xAD, 0xBE, 0xEF]);
        let after_first = buf.clone();

        let second = cat.apply(&mut buf);
        assert_eq!(second.applied(), 0);
        assert_eq!(second.already_applied(), 1);
        assert_eq!(buf, after_first);
    }

    #[test]
    fn test_missing_target_does_not_block_others() {
        let present = PatchTarget::from_hex("present", "AB CD", "00 00", 0).unwrap();
        let absent = PatchTarget::from_hex("absent", "FE FE FE", "00", 0).unwrap();
        let cat = catalog(vec![absent, present]);
        let mut buf = vec![0x10, 0xAB, 0xCD, 0x10];
        let report = cat.apply(&mut buf);
        assert_eq!(report.applied(), 1);
        assert_eq!(report.missing(), 1);
        assert_eq!(report.entries[0], ("absent".to_string(), TargetOutcome::NotFound));
        assert_eq!(buf, vec![0x10, 0x00, 0x00, 0x10]);
    }

    #[test]
    fn test_out_of_range_offsets_are_skipped() {
        let neg = PatchTarget::from_hex("neg", "AB", "00", -5).unwrap();
        let far = PatchTarget::from_hex("far", "AB", "00 00", 3).unwrap();
        let cat = catalog(vec![neg, far]);
        let mut buf = vec![0x00, 0xAB, 0x00, 0x00];
        let report = cat.apply(&mut buf);
        assert_eq!(report.applied(), 0);
        assert_eq!(report.missing(), 2);
        assert_eq!(buf, vec![0x00, 0xAB, 0x00, 0x00]);
    }

    #[test]
    fn test_negative_offset_within_buffer() {
        let t = PatchTarget::from_hex("back", "CC", "99", -2).unwrap();
        let cat = catalog(vec![t]);
        let mut buf = vec![0x00, 0x00, 0x00, 0xCC];
        assert_eq!(cat.apply(&mut buf).applied(), 1);
        assert_eq!(buf, vec![0x00, 0x99, 0x00, 0xCC]);
    }

    #[test]
    fn test_yaml_catalog_with_explicit_mask() {
        let yaml = r#"
version: "2"
targets:
  - name: nibble
    pattern: "30 AA"
    mask: "F0 FF"
    replacement: "00"
    offset: 1
"#;
        let cat = PatchCatalog::from_yaml_str(yaml).expect("catalog");
        assert_eq!(cat.version(), "2");
        let mut buf = vec![0x3F, 0xAA];
        assert_eq!(cat.apply(&mut buf).applied(), 1);
        assert_eq!(buf, vec![0x3F, 0x00]);
    }

    #[test]
    fn test_yaml_rejects_unknown_fields_and_bad_lengths() {
        assert!(PatchCatalog::from_yaml_str("version: x\nbogus: 1\n").is_err());
        let bad = "version: x\ntargets:\n  - name: t\n    pattern: \"AA BB\"\n    mask: \"FF\"\n    replacement: \"00\"\n";
        assert!(PatchCatalog::from_yaml_str(bad).is_err());
    }

    #[test]
    fn test_builtin_catalog_parses() {
        let cat = PatchCatalog::builtin().expect("builtin");
        assert!(!cat.version().is_empty());
        assert!(!cat.targets().is_empty());
        for t in cat.targets() {
            assert_eq!(t.pattern.len(), t.mask.len(), "target {}", t.name);
        }
    }
}

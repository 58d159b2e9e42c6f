#![allow(clippy::module_name_repetitions)]
//! Application bundle layout: `<Name>.app/Contents/{Info.plist,MacOS/<exe>}`.
//!
//! Info.plist is treated as text. Only the `<key>K</key><string>V</string>`
//! shape of the XML property list is understood, which is what the client
//! ships; binary plists are reported as missing metadata.

use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::errors::{Result, SandboxError};

pub const BUNDLE_EXTENSION: &str = "app";
pub const KEY_EXECUTABLE: &str = "CFBundleExecutable";
pub const KEY_IDENTIFIER: &str = "CFBundleIdentifier";

/// A read-only application bundle template shared by every identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseClient {
    pub name: String,
    pub path: PathBuf,
}

impl BaseClient {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    pub fn main_executable(&self) -> Result<PathBuf> {
        main_executable(&self.path)
    }
}

pub fn info_plist_path(bundle: &Path) -> PathBuf {
    bundle.join("Contents").join("Info.plist")
}

pub fn macos_dir(bundle: &Path) -> PathBuf {
    bundle.join("Contents").join("MacOS")
}

/// Byte range of the `<string>` value following `<key>{key}</key>`, plus the value.
pub fn plist_string_value<'a>(text: &'a str, key: &str) -> Option<(Range<usize>, &'a str)> {
    let needle = format!("<key>{key}</key>");
    let key_end = text.find(&needle)? + needle.len();
    let rest = &text[key_end..];
    let trimmed = rest.trim_start();
    let open = "<string>";
    if !trimmed.starts_with(open) {
        return None;
    }
    let value_start = key_end + (rest.len() - trimmed.len()) + open.len();
    let value_len = text[value_start..].find("</string>")?;
    let range = value_start..value_start + value_len;
    Some((range.clone(), &text[range]))
}

/// Read a string value from the bundle's Info.plist, if present.
pub fn read_plist_value(bundle: &Path, key: &str) -> Result<Option<String>> {
    let p = info_plist_path(bundle);
    let text = match fs::read_to_string(&p) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(SandboxError::fs("read", &p, e)),
    };
    Ok(plist_string_value(&text, key).map(|(_, v)| v.trim().to_string()))
}

/// Locate the bundle's main executable: `CFBundleExecutable` from Info.plist,
/// else a file in Contents/MacOS named after the bundle, else the only file there.
pub fn main_executable(bundle: &Path) -> Result<PathBuf> {
    let dir = macos_dir(bundle);
    if let Some(name) = read_plist_value(bundle, KEY_EXECUTABLE)? {
        let p = dir.join(&name);
        if p.is_file() {
            return Ok(p);
        }
        return Err(SandboxError::MissingExecutable(p));
    }

    if let Some(stem) = bundle.file_stem() {
        let p = dir.join(stem);
        if p.is_file() {
            return Ok(p);
        }
    }

    let mut files: Vec<PathBuf> = match fs::read_dir(&dir) {
        Ok(rd) => rd
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect(),
        Err(_) => Vec::new(),
    };
    if files.len() == 1 {
        return Ok(files.remove(0));
    }
    Err(SandboxError::MissingExecutable(bundle.to_path_buf()))
}

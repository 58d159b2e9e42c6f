//! Filesystem helpers for clone provisioning. Every failure is reported as
//! `SandboxError::Filesystem` carrying the path it happened on.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::errors::{Result, SandboxError};

/// Create every directory in `dirs`; existing directories are fine.
pub fn ensure_dirs<I, P>(dirs: I) -> Result<()>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    for d in dirs {
        let d = d.as_ref();
        fs::create_dir_all(d).map_err(|e| SandboxError::fs("create directory", d, e))?;
    }
    Ok(())
}

/// Remove a directory tree; a missing directory is not an error.
pub fn remove_dir_if_exists(p: &Path) -> Result<()> {
    match fs::symlink_metadata(p) {
        Ok(md) if md.is_dir() => {
            fs::remove_dir_all(p).map_err(|e| SandboxError::fs("remove", p, e))
        }
        Ok(_) => fs::remove_file(p).map_err(|e| SandboxError::fs("remove", p, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SandboxError::fs("stat", p, e)),
    }
}

pub fn remove_file_if_exists(p: &Path) -> Result<()> {
    match fs::remove_file(p) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SandboxError::fs("remove", p, e)),
    }
}

/// Recursively copy `src` into `dst` (which must not exist yet). Symlinks are
/// recreated as symlinks; regular files keep their permission bits.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<u64> {
    let mut copied = 0u64;
    fs::create_dir_all(dst).map_err(|e| SandboxError::fs("create directory", dst, e))?;
    for entry in WalkDir::new(src).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            let ioe = e
                .into_io_error()
                .unwrap_or_else(|| io::Error::other("filesystem loop"));
            SandboxError::fs("walk", &path, ioe)
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|_| SandboxError::fs("walk", entry.path(), io::Error::other("outside source")))?;
        let target = dst.join(rel);
        let ft = entry.file_type();
        if ft.is_dir() {
            fs::create_dir_all(&target)
                .map_err(|e| SandboxError::fs("create directory", &target, e))?;
        } else if ft.is_symlink() {
            let link = fs::read_link(entry.path())
                .map_err(|e| SandboxError::fs("read link", entry.path(), e))?;
            make_symlink(&link, &target)?;
        } else {
            copied += fs::copy(entry.path(), &target)
                .map_err(|e| SandboxError::fs("copy", entry.path(), e))?;
        }
    }
    Ok(copied)
}

#[cfg(unix)]
fn make_symlink(link: &Path, target: &Path) -> Result<()> {
    std::os::unix::fs::symlink(link, target).map_err(|e| SandboxError::fs("symlink", target, e))
}

#[cfg(not(unix))]
fn make_symlink(link: &Path, target: &Path) -> Result<()> {
    let _ = link;
    Err(SandboxError::fs(
        "symlink",
        target,
        io::Error::other("symlinks in bundles are only supported on unix"),
    ))
}

/// Replace `path` with `bytes` via a temp file in the same directory and a
/// rename. Permission bits of an existing file are carried over.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| SandboxError::fs("create temp file in", dir, e))?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| SandboxError::fs("write", tmp.path(), e))?;
    if let Ok(md) = fs::metadata(path) {
        fs::set_permissions(tmp.path(), md.permissions())
            .map_err(|e| SandboxError::fs("set permissions on", tmp.path(), e))?;
    }
    tmp.persist(path)
        .map_err(|e| SandboxError::fs("rename onto", path, e.error))?;
    Ok(())
}

pub fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| SandboxError::fs("read", path, e))
}

pub fn read_string(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| SandboxError::fs("read", path, e))
}

fn absolute(p: &Path) -> PathBuf {
    fs::canonicalize(p).unwrap_or_else(|_| {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|c| c.join(p))
                .unwrap_or_else(|_| p.to_path_buf())
        }
    })
}

/// Refuse to operate on `target` when it lies inside (or equals) `protected`.
/// Used to keep base client bundles read-only.
pub fn refuse_inside(target: &Path, protected: &Path) -> Result<()> {
    let t = absolute(target);
    let p = absolute(protected);
    if t.starts_with(&p) || p.starts_with(&t) {
        return Err(SandboxError::fs(
            "refusing to modify",
            target,
            io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("overlaps base client {}", protected.display()),
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_dir_recursive_files_dirs_symlinks() {
        let td = tempfile::tempdir().expect("tmpdir");
        let src = td.path().join("src");
        fs::create_dir_all(src.join("a/b")).unwrap();
        fs::write(src.join("a/b/f.txt"), "hello").unwrap();
        fs::write(src.join("top"), "x").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("top", src.join("link")).unwrap();

        let dst = td.path().join("dst");
        let n = copy_dir_recursive(&src, &dst).expect("copy");
        assert_eq!(n, 6);
        assert_eq!(fs::read_to_string(dst.join("a/b/f.txt")).unwrap(), "hello");
        #[cfg(unix)]
        assert_eq!(fs::read_link(dst.join("link")).unwrap(), Path::new("top"));
    }

    #[cfg(unix)]
    #[test]
    fn test_write_atomic_keeps_mode() {
        use std::os::unix::fs::PermissionsExt;
        let td = tempfile::tempdir().expect("tmpdir");
        let p = td.path().join("exe");
        fs::write(&p, b"old").unwrap();
        fs::set_permissions(&p, fs::Permissions::from_mode(0o755)).unwrap();
        write_atomic(&p, b"new").unwrap();
        assert_eq!(fs::read(&p).unwrap(), b"new");
        assert_eq!(fs::metadata(&p).unwrap().permissions().mode() & 0o777, 0o755);
    }

    #[test]
    fn test_remove_helpers_tolerate_missing() {
        let td = tempfile::tempdir().expect("tmpdir");
        assert!(remove_dir_if_exists(&td.path().join("nope")).is_ok());
        assert!(remove_file_if_exists(&td.path().join("nope")).is_ok());
        let d = td.path().join("d/e");
        ensure_dirs([&d, &d]).unwrap();
        remove_dir_if_exists(&td.path().join("d")).unwrap();
        assert!(!td.path().join("d").exists());
    }

    #[test]
    fn test_refuse_inside() {
        let td = tempfile::tempdir().expect("tmpdir");
        let base = td.path().join("clients/Default.app");
        fs::create_dir_all(&base).unwrap();
        assert!(refuse_inside(&base.join("Contents/MacOS/x"), &base).is_err());
        assert!(refuse_inside(&base, &base).is_err());
        assert!(refuse_inside(td.path(), &base).is_err());
        assert!(refuse_inside(&td.path().join("clones/alice/Default.app"), &base).is_ok());
    }
}

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[cfg(feature = "otel")]
use tracing::instrument;

use crate::errors::{Result, SandboxError};

/// Identity-scoped lock guard; the flock is released on drop.
#[derive(Debug)]
pub struct IdentityLock {
    file: File,
    path: PathBuf,
}

impl IdentityLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for IdentityLock {
    fn drop(&mut self) {
        // The file stays on disk: every contender must lock the same inode.
        let _ = self.file.unlock();
    }
}

/// Lock file for one identity: `<locks_dir>/<username>.lock`.
pub fn identity_lock_path(locks_dir: &Path, username: &str) -> PathBuf {
    locks_dir.join(format!("{username}.lock"))
}

fn open_lock_file(p: &Path) -> io::Result<File> {
    if let Some(parent) = p.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(true)
        .open(p)
}

#[cfg_attr(
    feature = "otel",
    instrument(level = "info", err, skip(), fields(lock = %p.display()))
)]
/// Acquire an exclusive lock at `p`, retrying until `wait` has elapsed.
/// A zero `wait` makes a single non-blocking attempt.
pub fn acquire_identity_lock(p: &Path, wait: Duration) -> Result<IdentityLock> {
    let deadline = Instant::now() + wait;
    loop {
        let f = open_lock_file(p).map_err(|e| SandboxError::fs("open lock file", p, e))?;
        match f.try_lock_exclusive() {
            Ok(()) => {
                return Ok(IdentityLock {
                    file: f,
                    path: p.to_path_buf(),
                })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    #[cfg(feature = "otel")]
                    tracing::error!("identity lock held by another process");
                    return Err(SandboxError::fs(
                        "lock",
                        p,
                        io::Error::new(
                            io::ErrorKind::WouldBlock,
                            "identity is busy in another clientforge process (lock held); please try again later",
                        ),
                    ));
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => return Err(SandboxError::fs("lock", p, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_lock_is_exclusive_and_released_on_drop() {
        let td = tempfile::tempdir().expect("tmpdir");
        let p = identity_lock_path(&td.path().join("locks"), "alice");
        let held = acquire_identity_lock(&p, Duration::ZERO).expect("first lock");
        assert_eq!(held.path(), p.as_path());

        let err = acquire_identity_lock(&p, Duration::from_millis(150)).unwrap_err();
        assert!(err.to_string().contains("lock held"), "{err}");

        // Other identities are independent.
        let other = identity_lock_path(&td.path().join("locks"), "bob");
        let _bob = acquire_identity_lock(&other, Duration::ZERO).expect("bob lock");

        drop(held);
        assert!(p.exists(), "lock file is kept for later contenders");
        let _again = acquire_identity_lock(&p, Duration::ZERO).expect("relock");
    }

    #[test]
    fn test_waiter_on_released_lock_excludes_newcomers() {
        let td = tempfile::tempdir().expect("tmpdir");
        let p = identity_lock_path(td.path(), "alice");
        let first = acquire_identity_lock(&p, Duration::ZERO).expect("first lock");

        // A waiter that opened the file while it was held.
        let waiter = open_lock_file(&p).expect("open");
        drop(first);
        waiter.try_lock_exclusive().expect("waiter takes the lock");

        let err = acquire_identity_lock(&p, Duration::ZERO).unwrap_err();
        assert!(err.to_string().contains("lock held"), "{err}");

        let _ = waiter.unlock();
        let _next = acquire_identity_lock(&p, Duration::ZERO).expect("after waiter");
    }
}

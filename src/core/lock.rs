//! Cross-process file leases.
//!
//! A lease is a sibling `*.lock` file created with `create_new`, which gives
//! single-winner semantics per path across processes and threads alike. Each
//! lease file carries a unique token, and a guard only removes the file on drop
//! while it still holds that token.
//!
//! Lease files left behind by a crashed holder are reclaimed once they are
//! older than `stale_after`. Reclaiming is serialized through a second
//! `*.lock.reclaim` lease and moves the stale file aside by rename, so a lease
//! created after the staleness check is never deleted.

use crate::core::error::LanegateError;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

static LEASE_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy)]
pub struct LockPolicy {
    /// Upper bound on how long `acquire` keeps retrying.
    pub timeout: Duration,
    /// Lease files older than this are treated as abandoned.
    pub stale_after: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            stale_after: Duration::from_secs(300),
        }
    }
}

/// Exclusive lease on a guarded resource. Released on drop.
#[derive(Debug)]
pub struct FileLease {
    path: PathBuf,
    token: String,
    _file: File,
}

impl FileLease {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for FileLease {
    fn drop(&mut self) {
        // The file may have been reclaimed and replaced by another holder's lease.
        if read_token(&self.path).as_deref() == Some(self.token.as_str()) {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Lock path guarding `target` (e.g. `coverage.ndjson` -> `coverage.ndjson.lock`).
pub fn lock_path_for(target: &Path) -> PathBuf {
    with_suffix(target, ".lock")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Acquire the lease guarding `target`, retrying with jitter until `policy.timeout`.
pub fn acquire(target: &Path, policy: &LockPolicy) -> Result<FileLease, LanegateError> {
    let lock_path = lock_path_for(target);
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent).map_err(LanegateError::IoError)?;
    }

    let start = Instant::now();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        if let Some(lease) = try_acquire(&lock_path)? {
            if attempts > 1 {
                debug!(lock = %lock_path.display(), attempts, "lease acquired after contention");
            }
            return Ok(lease);
        }

        if is_stale(&lock_path, policy.stale_after) && reclaim_stale(&lock_path, policy.stale_after)? {
            continue;
        }

        if start.elapsed() >= policy.timeout {
            return Err(LanegateError::LockTimeout {
                path: lock_path,
                waited_ms: start.elapsed().as_millis(),
            });
        }
        std::thread::sleep(Duration::from_millis(5 + jitter_ms(20)));
    }
}

fn try_acquire(lock_path: &Path) -> Result<Option<FileLease>, LanegateError> {
    let mut file = match OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path)
    {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(None),
        Err(err) => return Err(LanegateError::IoError(err)),
    };

    let token = new_token();
    let _ = write!(file, "pid={}\ntoken={}\n", std::process::id(), token);
    let _ = file.sync_data();

    Ok(Some(FileLease {
        path: lock_path.to_path_buf(),
        token,
        _file: file,
    }))
}

/// Move an abandoned lease out of the way. Returns `true` when this caller
/// removed a stale lease and should retry immediately.
fn reclaim_stale(lock_path: &Path, stale_after: Duration) -> Result<bool, LanegateError> {
    let guard_path = with_suffix(lock_path, ".reclaim");
    let Some(_guard) = try_acquire(&guard_path)? else {
        // A reclaimer that crashed mid-reclaim leaves its guard behind.
        if is_stale(&guard_path, stale_after) {
            warn!(guard = %guard_path.display(), "removing abandoned reclaim guard");
            let _ = fs::remove_file(&guard_path);
        }
        return Ok(false);
    };

    // Re-check under the guard: the lease may already have been replaced.
    if !is_stale(lock_path, stale_after) {
        return Ok(false);
    }
    let observed = read_token(lock_path);

    let aside = with_suffix(lock_path, &format!(".stale.{}", new_token()));
    match fs::rename(lock_path, &aside) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(LanegateError::IoError(err)),
    }

    if is_stale(&aside, stale_after) && read_token(&aside) == observed {
        warn!(lock = %lock_path.display(), "reclaimed stale lease");
        let _ = fs::remove_file(&aside);
        return Ok(true);
    }

    // A stale holder released between the check and the rename and a new
    // holder took the path. Put its lease back without overwriting anything.
    if let Err(err) = fs::hard_link(&aside, lock_path) {
        warn!(lock = %lock_path.display(), error = %err, "could not restore displaced lease");
    }
    let _ = fs::remove_file(&aside);
    Ok(false)
}

fn read_token(path: &Path) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    content
        .lines()
        .find_map(|line| line.strip_prefix("token="))
        .map(str::to_string)
}

fn new_token() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!(
        "{}-{}-{}",
        std::process::id(),
        nanos,
        LEASE_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

fn is_stale(lock_path: &Path, stale_after: Duration) -> bool {
    fs::metadata(lock_path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > stale_after)
}

fn jitter_ms(max_exclusive: u64) -> u64 {
    if max_exclusive <= 1 {
        return 0;
    }
    let now_ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    (now_ns ^ u64::from(std::process::id())) % max_exclusive
}

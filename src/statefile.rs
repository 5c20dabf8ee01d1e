use crate::states::State;
use log::debug;
use nix::unistd::{getegid, geteuid, getgid, getuid};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Version of the on-disk line format this library writes and accepts.
pub const STATE_FORMAT_VERSION: u32 = 1;

/// Fallback state directory when the environment provides none.
const DEFAULT_STATE_DIR: &str = "/var/lib/monitoring-plugins";

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum StateError {
    #[error("state key '{0}' contains characters outside [A-Za-z0-9_]")]
    InvalidKey(String),

    #[error("state file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not persist state file: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// A previously stored sample.
#[derive(Clone, Debug, PartialEq)]
pub struct StateEntry {
    /// Unix timestamp of the write.
    pub timestamp: i64,
    pub payload: String,
}

/// Handle to one persistent state bucket.
///
/// Concurrent writers to the same key race: the rename keeps every write
/// individually atomic, so a reader sees either the full old or the full
/// new content, but one of two racing updates may be lost. State is
/// advisory (rate memoization between runs), not authoritative.
#[derive(Clone, Debug)]
pub struct StateHandle {
    path: PathBuf,
    data_version: u32,
}

/// SHA-256 fingerprint of the argv vector, hex encoded. Arguments are
/// fed NUL-separated so that reordered argument boundaries cannot
/// collide.
pub fn state_key(argv: &[String]) -> String {
    let mut hasher = Sha256::new();
    for arg in argv {
        hasher.update(arg.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Where state files live. `MP_STATE_PATH` is honored only when the
/// process is not privilege-elevated; a setuid/setgid invocation must
/// not trust its environment.
fn state_root() -> PathBuf {
    let elevated = geteuid() != getuid() || getegid() != getgid();
    if !elevated {
        if let Ok(path) = std::env::var("MP_STATE_PATH") {
            if !path.is_empty() {
                return PathBuf::from(path);
            }
        }
    }
    PathBuf::from(DEFAULT_STATE_DIR)
}

/// Open a state bucket under an explicit root directory.
///
/// `key` defaults to the argv fingerprint when not supplied. A caller
/// supplied key outside `[A-Za-z0-9_]` is a programming error and is
/// rejected; the caller surfaces that as Unknown.
pub fn enable_state_in(
    root: &Path,
    plugin_name: &str,
    key: Option<&str>,
    data_version: u32,
    argv: &[String],
) -> Result<StateHandle, StateError> {
    let key = match key {
        Some(key) => {
            if !valid_key(key) {
                return Err(StateError::InvalidKey(key.to_string()));
            }
            key.to_string()
        }
        None => state_key(argv),
    };

    let path = root
        .join(geteuid().as_raw().to_string())
        .join(plugin_name)
        .join(&key);
    debug!("State file for this invocation: {}", path.display());

    Ok(StateHandle { path, data_version })
}

/// Open a state bucket under the environment-selected root.
pub fn enable_state(
    plugin_name: &str,
    key: Option<&str>,
    data_version: u32,
    argv: &[String],
) -> Result<StateHandle, StateError> {
    enable_state_in(&state_root(), plugin_name, key, data_version, argv)
}

fn unix_now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs() as i64,
        Err(_) => 0,
    }
}

impl StateHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored sample. Every failure mode reads as absent: a
    /// missing or malformed file, a data-version mismatch, or a
    /// timestamp from the future (clock anomaly).
    pub fn read(&self) -> Option<StateEntry> {
        let content = fs::read_to_string(&self.path).ok()?;
        // Comment lines are only valid before the header; a payload may
        // well start with '#'.
        let mut lines = content.lines().skip_while(|line| line.starts_with('#'));

        let format_version: u32 = lines.next()?.trim().parse().ok()?;
        if format_version != STATE_FORMAT_VERSION {
            debug!("State file has unknown format version {}", format_version);
            return None;
        }

        let data_version: u32 = lines.next()?.trim().parse().ok()?;
        if data_version != self.data_version {
            debug!(
                "State file data version {} does not match expected {}",
                data_version, self.data_version
            );
            return None;
        }

        let timestamp: i64 = lines.next()?.trim().parse().ok()?;
        if timestamp > unix_now() {
            debug!("State file timestamp {} is in the future", timestamp);
            return None;
        }

        let payload = lines.next()?.to_string();
        Some(StateEntry { timestamp, payload })
    }

    /// Write a sample stamped with the current time.
    pub fn write(&self, payload: &str) -> Result<(), StateError> {
        self.write_with_time(unix_now(), payload)
    }

    /// Write a sample with an explicit timestamp. The write is atomic:
    /// a sibling temp file is filled, synced and renamed over the
    /// target; on any failure the target is left untouched and the temp
    /// file is unlinked.
    pub fn write_with_time(&self, timestamp: i64, payload: &str) -> Result<(), StateError> {
        let parent = self.path.parent().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "state path has no parent")
        })?;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(parent)?;

        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        writeln!(temp, "# state file written by check_icmp runtime")?;
        writeln!(temp, "{}", STATE_FORMAT_VERSION)?;
        writeln!(temp, "{}", self.data_version)?;
        writeln!(temp, "{}", timestamp)?;
        writeln!(temp, "{}", payload)?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path)?;

        debug!("Wrote state file {}", self.path.display());
        Ok(())
    }
}

/// Result of a rate computation between this run and the previous one.
#[derive(Clone, Debug, PartialEq)]
pub struct RateResult {
    pub state: State,
    pub message: String,
    /// Events per second since the previous run; `None` on the first
    /// run or after a counter reset.
    pub rate: Option<f64>,
}

/// Compute the per-second rate of a monotonically increasing counter,
/// memoized through the state store. The first run has nothing to
/// compare against and reports Ok, never Unknown.
pub fn rate_from_counter(handle: &StateHandle, value: u64) -> Result<RateResult, StateError> {
    let now = unix_now();
    let previous = handle.read();
    handle.write_with_time(now, &value.to_string())?;

    let previous = match previous {
        Some(entry) => entry,
        None => {
            return Ok(RateResult {
                state: State::Ok,
                message: "No previous data - collecting baseline".to_string(),
                rate: None,
            })
        }
    };

    let elapsed = now - previous.timestamp;
    if elapsed <= 0 {
        return Ok(RateResult {
            state: State::Ok,
            message: "No previous data - samples too close together".to_string(),
            rate: None,
        });
    }

    let previous_value: u64 = match previous.payload.trim().parse() {
        Ok(parsed) => parsed,
        Err(_) => {
            return Ok(RateResult {
                state: State::Ok,
                message: "No previous data - stored sample unreadable".to_string(),
                rate: None,
            })
        }
    };

    if value < previous_value {
        return Ok(RateResult {
            state: State::Ok,
            message: "Counter reset detected - collecting baseline".to_string(),
            rate: None,
        });
    }

    let rate = (value - previous_value) as f64 / elapsed as f64;
    Ok(RateResult {
        state: State::Ok,
        message: format!("{:.3}/s over {}s", rate, elapsed),
        rate: Some(rate),
    })
}

#[cfg(test)]
mod key_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_key_is_stable() {
        let a = state_key(&argv(&["check_icmp", "-H", "host"]));
        let b = state_key(&argv(&["check_icmp", "-H", "host"]));
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_is_hex_sha256() {
        let key = state_key(&argv(&["check_icmp"]));
        assert_eq!(key.len(), 64);
        assert!(key.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn test_different_argv_different_key() {
        let a = state_key(&argv(&["check_icmp", "-H", "host-a"]));
        let b = state_key(&argv(&["check_icmp", "-H", "host-b"]));
        assert_ne!(a, b);
    }

    #[test]
    fn test_argument_boundaries_matter() {
        let a = state_key(&argv(&["ab", "c"]));
        let b = state_key(&argv(&["a", "bc"]));
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_explicit_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = enable_state_in(dir.path(), "check_icmp", Some("../escape"), 1, &[]);
        assert!(matches!(result, Err(StateError::InvalidKey(_))));
    }

    #[test]
    fn test_valid_explicit_key_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let handle = enable_state_in(dir.path(), "check_icmp", Some("my_key_1"), 1, &[]).unwrap();
        assert!(handle.path().ends_with("check_icmp/my_key_1"));
    }
}

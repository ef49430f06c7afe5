//! Process-wide TLS keylog file.
//!
//! There is one keylog file per process, shared by every TLS context. It is
//! opened lazily, at most once, either from the `SSLKEYLOGFILE` environment
//! variable or from an explicit path, and secrets are appended one line at a
//! time in the NSS key log format so captured QUIC traffic can be decrypted
//! offline.
//!
//! Opening is idempotent: redundant calls from multiple contexts keep the
//! first handle. Writes are append-only and order-independent across
//! connections.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use tracing::debug;

struct Keylog {
    path: PathBuf,
    file: Mutex<File>,
}

static KEYLOG: OnceLock<Keylog> = OnceLock::new();

/// Open the keylog file named by `SSLKEYLOGFILE`, if set and not already
/// open. Returns whether keylog export is enabled afterwards.
pub fn open() -> bool {
    if KEYLOG.get().is_some() {
        return true;
    }
    if let Some(path) = std::env::var_os("SSLKEYLOGFILE") {
        let _ = open_at(Path::new(&path));
    }
    enabled()
}

/// Open the keylog file at an explicit path. A no-op if a keylog file is
/// already open; the first successful open wins for the whole process.
pub fn open_at(path: &Path) -> io::Result<()> {
    if KEYLOG.get().is_some() {
        return Ok(());
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let _ = KEYLOG.set(Keylog {
        path: path.to_path_buf(),
        file: Mutex::new(file),
    });
    debug!(path = %path.display(), "keylog file opened");
    Ok(())
}

/// Whether keylog export is enabled for this process.
pub fn enabled() -> bool {
    KEYLOG.get().is_some()
}

/// The path of the open keylog file, if any.
pub fn current_path() -> Option<PathBuf> {
    KEYLOG.get().map(|k| k.path.clone())
}

/// Append one secret line. Does nothing when no keylog file is open; write
/// errors are swallowed since there is no useful recovery at this point.
pub fn write_line(line: &str) {
    if let Some(keylog) = KEYLOG.get() {
        let mut file = match keylog.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = writeln!(file, "{}", line.trim_end_matches(['\r', '\n']));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    // The keylog handle is process-global, so this single test covers open,
    // idempotency and writing without depending on test ordering.
    #[test]
    fn test_open_write_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keylog.txt");
        open_at(&path).unwrap();
        assert!(enabled());
        assert!(open());

        // A second open elsewhere must keep the first handle.
        let other = dir.path().join("other.txt");
        open_at(&other).unwrap();
        let active = current_path().unwrap();

        write_line("CLIENT_RANDOM 0abc 0def\n");
        let mut contents = String::new();
        File::open(&active)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert!(contents.contains("CLIENT_RANDOM 0abc 0def\n"));
        // The trailing newline from the caller must not double up.
        assert!(!contents.contains("\n\n"));
    }
}

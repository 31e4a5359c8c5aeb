use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{OnceLock, RwLock};

use chrono::{Local, SecondsFormat, Utc};
use rand::Rng;

use crate::error::{io_error, Result};

pub const LOG_FILE: &str = "logs.txt";
pub const DEFAULT_DIR_NAME: &str = ".provenant";

static LOG_DIR: OnceLock<RwLock<Option<PathBuf>>> = OnceLock::new();

/// Returns the default data directory. Uses PROVENANT_HOME if set;
/// otherwise `$HOME/.provenant`, falling back to `./.provenant`.
pub fn default_root() -> PathBuf {
    if let Ok(dir) = env::var("PROVENANT_HOME") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_DIR_NAME)
}

/// Point the log file at `<root>/logs.txt`. Creates the file if missing.
pub fn init_logging(root: &Path) -> Result<()> {
    fs::create_dir_all(root).map_err(|e| io_error("init_logging", Some(root), e))?;
    let log_path = root.join(LOG_FILE);
    if !log_path.exists() {
        File::create(&log_path).map_err(|e| io_error("init_logging", Some(&log_path), e))?;
    }
    let cell = LOG_DIR.get_or_init(|| RwLock::new(None));
    if let Ok(mut guard) = cell.write() {
        *guard = Some(root.to_path_buf());
    }
    Ok(())
}

fn log_dir() -> Option<PathBuf> {
    LOG_DIR.get()?.read().ok()?.clone()
}

fn is_quiet() -> bool {
    if env::var("PROVENANT_QUIET").map(|v| v == "1" || v == "true").unwrap_or(false) {
        return true;
    }
    env::var("PROVENANT_LOG")
        .map(|v| v.to_lowercase() == "quiet" || v.to_lowercase() == "error")
        .unwrap_or(false)
}

pub fn log(message: &str) {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    let log_message = format!("[{}] {}", timestamp, message);

    // stdout is reserved for command output
    if !is_quiet() {
        eprintln!("{}", log_message);
    }

    if let Some(dir) = log_dir() {
        let log_path = dir.join(LOG_FILE);
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&log_path) {
            let _ = writeln!(file, "{}", log_message);
        }
    }
}

pub fn log_error(message: &str) {
    log(&format!("ERROR: {}", message));
}

/// RFC 3339 UTC instant with microseconds, e.g. `2024-05-01T12:00:00.000000Z`.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Filesystem-safe UTC stamp, e.g. `20240501T120000.123456Z`.
pub fn compact_stamp() -> String {
    Utc::now().format("%Y%m%dT%H%M%S%.6fZ").to_string()
}

pub fn random_hex(bytes: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..bytes).map(|_| format!("{:02x}", rng.gen::<u8>())).collect()
}

/// Write `content` to `path` through a sibling temp file and a rename.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| io_error("write_atomic", Some(parent), e))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let temp_path = parent.join(format!(".{}.tmp-{}", file_name, random_hex(4)));
    {
        let mut file =
            File::create(&temp_path).map_err(|e| io_error("write_atomic", Some(&temp_path), e))?;
        file.write_all(content)
            .map_err(|e| io_error("write_atomic", Some(&temp_path), e))?;
        file.sync_all()
            .map_err(|e| io_error("write_atomic", Some(&temp_path), e))?;
    }
    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(io_error("write_atomic", Some(path), e));
    }
    Ok(())
}

/// Capsule ids end up in file names; keep `[A-Za-z0-9._-]`, map the rest to `_`.
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "capsule".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_rfc3339_is_utc() {
        let ts = now_rfc3339();
        assert!(ts.ends_with('Z'));
        assert!(ts.contains('T'));
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("CAP-1"), "CAP-1");
        assert_eq!(sanitize_component("a/b c"), "a_b_c");
        assert_eq!(sanitize_component(".."), "capsule");
    }

    #[test]
    fn test_random_hex_length() {
        assert_eq!(random_hex(4).len(), 8);
    }
}

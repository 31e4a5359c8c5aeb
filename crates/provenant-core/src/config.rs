//! Optional config from .provenantrc or ~/.provenantrc (JSON). Merged with env and CLI.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ProvenanceError, Result};
use crate::utils;

pub const RC_FILE: &str = ".provenantrc";
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 10_000;

/// Resolved configuration. CLI flags override env, env overrides the rc file.
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory holding ledger, CAS, archives and blackboard state
    pub root: PathBuf,
    /// Replica/writer identity used for blackboard timestamps
    pub writer_id: String,
    /// How long an append waits for the cross-process ledger lock
    pub lock_timeout: Duration,
    pub quiet: bool,
}

impl Config {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writer_id: default_writer_id(),
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            quiet: false,
        }
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root.join("ledger.jsonl")
    }

    pub fn cas_dir(&self) -> PathBuf {
        self.root.join("cas")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join("archives")
    }

    pub fn blackboard_path(&self) -> PathBuf {
        self.root.join("blackboard.json")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::with_root(utils::default_root())
    }
}

/// Values read from a single rc file; every field optional.
#[derive(Default, Debug)]
struct RcFile {
    root: Option<String>,
    writer_id: Option<String>,
    lock_timeout_ms: Option<u64>,
    quiet: Option<bool>,
}

fn read_rc(path: &Path) -> Result<RcFile> {
    let s = std::fs::read_to_string(path).map_err(|e| ProvenanceError::Config {
        field: None,
        source: format!("cannot read {}: {}", path.display(), e),
    })?;
    let v = serde_json::from_str::<serde_json::Value>(&s).map_err(|e| ProvenanceError::Config {
        field: None,
        source: format!("invalid JSON in {}: {}", path.display(), e),
    })?;
    let mut rc = RcFile::default();
    if let Some(r) = v.get("root").and_then(|x| x.as_str()) {
        rc.root = Some(r.to_string());
    }
    if let Some(w) = v.get("writerId").and_then(|x| x.as_str()) {
        rc.writer_id = Some(w.to_string());
    }
    if let Some(t) = v.get("lockTimeoutMs") {
        rc.lock_timeout_ms = Some(t.as_u64().ok_or_else(|| ProvenanceError::Config {
            field: Some("lockTimeoutMs".to_string()),
            source: "expected a non-negative integer".to_string(),
        })?);
    }
    if let Some(q) = v.get("quiet").and_then(|x| x.as_bool()) {
        rc.quiet = Some(q);
    }
    Ok(rc)
}

/// Load config from .provenantrc in dir, then ~/.provenantrc. The first file found wins.
/// A missing file means defaults; a present but malformed file is an error.
pub fn load_config(dir: &Path) -> Result<Config> {
    let mut cfg = Config::default();
    let mut candidates = vec![dir.join(RC_FILE)];
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(RC_FILE));
    }
    for path in &candidates {
        if path.is_file() {
            let rc = read_rc(path)?;
            if let Some(root) = rc.root {
                cfg.root = PathBuf::from(root);
            }
            if let Some(w) = rc.writer_id {
                cfg.writer_id = w;
            }
            if let Some(ms) = rc.lock_timeout_ms {
                cfg.lock_timeout = Duration::from_millis(ms);
            }
            if let Some(q) = rc.quiet {
                cfg.quiet = q;
            }
            break;
        }
    }
    apply_env(&mut cfg);
    Ok(cfg)
}

fn apply_env(cfg: &mut Config) {
    if let Ok(root) = std::env::var("PROVENANT_HOME") {
        if !root.trim().is_empty() {
            cfg.root = PathBuf::from(root);
        }
    }
    if let Ok(w) = std::env::var("PROVENANT_WRITER_ID") {
        if !w.trim().is_empty() {
            cfg.writer_id = w;
        }
    }
}

fn default_writer_id() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "local".to_string());
    format!("{}-{}", host, std::process::id())
}

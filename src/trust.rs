//! Durable trust store: uid → "always" decision.
//!
//! ## File format
//! One record per line:
//!
//! ```text
//! # comment
//! 10010
//! 10030 allow 2026-10-19T08:15:00Z
//! 10040 deny 2026-10-19T08:16:12Z
//! ```
//!
//! A bare uid is a legacy allow grant. Blank, comment, and malformed lines
//! are skipped on load so a torn write from a previous crash never takes the
//! whole store down.
//!
//! ## Security invariants
//! - Store directory is created 0700; the file is written 0600.
//! - A group/world-writable file or directory is refused at open.
//! - Saves are atomic: write temp → fsync → rename.
//! - A record is on disk before it becomes visible to `lookup`.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{BrokerError, Result};
use crate::wire::Outcome;

// ── Constants ───────────────────────────────────────────────

/// Mode for the store file.
const STORE_FILE_MODE: u32 = 0o600;

/// Mode for a store directory we create.
const STORE_DIR_MODE: u32 = 0o700;

/// Bits that must never be set on the store file or its directory.
const FORBIDDEN_WRITE_BITS: u32 = 0o022;

/// Default store path.
pub const DEFAULT_TRUST_PATH: &str = "/var/lib/rootgate/trusted.txt";

// ── Records ─────────────────────────────────────────────────

/// A persisted "always" decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustRecord {
    pub uid: u32,
    pub decision: Outcome,
    pub created_at: DateTime<Utc>,
}

impl TrustRecord {
    pub fn new(uid: u32, decision: Outcome) -> Self {
        Self {
            uid,
            decision,
            created_at: Utc::now(),
        }
    }

    fn to_line(&self) -> String {
        format!(
            "{} {} {}",
            self.uid,
            self.decision.as_str(),
            self.created_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

/// Parse one line. `None` for blank and comment lines.
pub fn parse_line(line: &str) -> Option<std::result::Result<TrustRecord, String>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    Some(parse_fields(line))
}

fn parse_fields(line: &str) -> std::result::Result<TrustRecord, String> {
    let mut fields = line.split_whitespace();

    let uid_field = fields.next().ok_or_else(|| "empty record".to_string())?;
    let uid = uid_field
        .parse::<u32>()
        .map_err(|e| format!("bad uid {uid_field:?}: {e}"))?;

    let decision = match fields.next() {
        None | Some("allow") => Outcome::Allow,
        Some("deny") => Outcome::Deny,
        Some(other) => return Err(format!("bad decision {other:?}")),
    };

    let created_at = match fields.next() {
        None => DateTime::<Utc>::default(),
        Some(ts) => DateTime::parse_from_rfc3339(ts)
            .map_err(|e| format!("bad timestamp {ts:?}: {e}"))?
            .with_timezone(&Utc),
    };

    if let Some(extra) = fields.next() {
        return Err(format!("unexpected trailing field {extra:?}"));
    }

    Ok(TrustRecord {
        uid,
        decision,
        created_at,
    })
}

/// Parse a whole store file. Returns the records and the number of skipped lines.
pub fn parse_records(contents: &str) -> (HashMap<u32, TrustRecord>, usize) {
    let mut records = HashMap::new();
    let mut skipped = 0;
    for (lineno, line) in contents.lines().enumerate() {
        match parse_line(line) {
            None => {}
            Some(Ok(record)) => {
                records.insert(record.uid, record);
            }
            Some(Err(reason)) => {
                warn!("[TRUST] skipping malformed line {}: {reason}", lineno + 1);
                skipped += 1;
            }
        }
    }
    (records, skipped)
}

fn render(records: &HashMap<u32, TrustRecord>) -> String {
    let mut sorted: Vec<&TrustRecord> = records.values().collect();
    sorted.sort_by_key(|r| r.uid);
    let mut out = String::from("# rootgate trust store\n");
    for record in sorted {
        out.push_str(&record.to_line());
        out.push('\n');
    }
    out
}

// ── Trust Store ─────────────────────────────────────────────

/// Durable, concurrently readable trust store.
///
/// Reads clone an `Arc` snapshot under a short read lock. Mutations are
/// serialized by `writer`, persisted, and only then published.
#[derive(Debug)]
pub struct TrustStore {
    path: PathBuf,
    snapshot: RwLock<Arc<HashMap<u32, TrustRecord>>>,
    writer: Mutex<()>,
}

impl TrustStore {
    /// Open the store at `path`. A missing file yields an empty store.
    ///
    /// Fails on an insecure file or directory and on any read error other
    /// than not-found.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        ensure_store_dir(&path)?;

        let records = match fs::read_to_string(&path) {
            Ok(contents) => {
                reject_insecure(&path)?;
                let (records, skipped) = parse_records(&contents);
                info!(
                    "[TRUST] loaded {} record(s) from {} ({skipped} skipped)",
                    records.len(),
                    path.display()
                );
                records
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("[TRUST] no store at {}; starting empty", path.display());
                HashMap::new()
            }
            Err(e) => return Err(BrokerError::store_io(&path, e)),
        };

        Ok(Self {
            path,
            snapshot: RwLock::new(Arc::new(records)),
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn current(&self) -> Arc<HashMap<u32, TrustRecord>> {
        let guard = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&*guard)
    }

    fn publish(&self, next: HashMap<u32, TrustRecord>) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
    }

    /// Stored decision for `uid`, if any.
    pub fn lookup(&self, uid: u32) -> Option<TrustRecord> {
        self.current().get(&uid).cloned()
    }

    /// Insert or overwrite the decision for `uid`. Durable on return.
    ///
    /// On failure the in-memory view is left unchanged.
    pub fn record(&self, uid: u32, decision: Outcome) -> Result<TrustRecord> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let record = TrustRecord::new(uid, decision);

        let mut next = (*self.current()).clone();
        next.insert(uid, record.clone());
        self.save(&next)?;
        self.publish(next);

        info!(uid, "[TRUST] recorded {} for uid {uid}", decision.as_str());
        Ok(record)
    }

    /// Remove the record for `uid`. Returns whether one existed.
    pub fn revoke(&self, uid: u32) -> Result<bool> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.current();
        if !current.contains_key(&uid) {
            debug!(uid, "[TRUST] revoke for uid {uid} without a record");
            return Ok(false);
        }

        let mut next = (*current).clone();
        next.remove(&uid);
        self.save(&next)?;
        self.publish(next);

        info!(uid, "[TRUST] revoked uid {uid}");
        Ok(true)
    }

    /// All records, ordered by uid.
    pub fn records(&self) -> Vec<TrustRecord> {
        let mut all: Vec<TrustRecord> = self.current().values().cloned().collect();
        all.sort_by_key(|r| r.uid);
        all
    }

    pub fn len(&self) -> usize {
        self.current().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn save(&self, records: &HashMap<u32, TrustRecord>) -> Result<()> {
        save_atomic(&self.path, render(records).as_bytes())
            .map_err(|e| BrokerError::store_io(&self.path, e))
    }
}

// ── Filesystem helpers ──────────────────────────────────────

/// Write `contents` to a temp sibling, fsync, then rename over `path`.
fn save_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = parent_dir(path)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "trusted.txt".to_string());
    let tmp_path = parent.join(format!(".{file_name}.tmp.{}", std::process::id()));

    let result = (|| {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(STORE_FILE_MODE)
            .open(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
        return result;
    }

    // Persist the rename itself; best effort.
    if let Ok(dir) = fs::File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

fn parent_dir(path: &Path) -> io::Result<&Path> {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => Ok(p),
        _ => Ok(Path::new(".")),
    }
}

/// Create the store directory (0700) if absent, or validate an existing one.
fn ensure_store_dir(path: &Path) -> Result<()> {
    let parent = parent_dir(path).map_err(|e| BrokerError::store_io(path, e))?;

    if parent.exists() {
        return reject_insecure(parent);
    }

    fs::create_dir_all(parent).map_err(|e| BrokerError::store_io(parent, e))?;
    fs::set_permissions(parent, fs::Permissions::from_mode(STORE_DIR_MODE))
        .map_err(|e| BrokerError::store_io(parent, e))?;
    info!(
        "[TRUST] created directory {} (mode {:04o})",
        parent.display(),
        STORE_DIR_MODE
    );
    Ok(())
}

fn reject_insecure(path: &Path) -> Result<()> {
    let meta = fs::metadata(path).map_err(|e| BrokerError::store_io(path, e))?;
    let mode = meta.permissions().mode() & 0o777;
    if mode & FORBIDDEN_WRITE_BITS != 0 {
        return Err(BrokerError::StoreInsecure {
            path: path.to_path_buf(),
            mode,
        });
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────

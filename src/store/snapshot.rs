//! Crash-safe snapshot file.
//!
//! Write path:
//! 1. On the first write of a session, copy the current (valid) primary to
//!    the `.bak` sibling.
//! 2. Serialize into a temp file in the same directory, `fsync` it.
//! 3. Read the temp file back and parse it; a snapshot that does not
//!    round-trip never replaces the primary.
//! 4. `rename` over the primary and `fsync` the directory.
//!
//! Load path: primary, then backup. A backup recovery is written back to the
//! primary and re-read. If neither parses the store fails closed.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::StoreError;
use crate::models::policy::GlobalRules;
use crate::models::token::StoredToken;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    #[serde(default = "current_version")]
    pub version: u32,
    #[serde(default)]
    pub tokens: Vec<StoredToken>,
    #[serde(default)]
    pub global_rules: GlobalRules,
}

fn current_version() -> u32 {
    SNAPSHOT_VERSION
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            tokens: Vec::new(),
            global_rules: GlobalRules::default(),
        }
    }
}

impl Snapshot {
    /// Structural checks beyond "it is JSON".
    pub fn check(&self) -> Result<(), String> {
        if self.version > SNAPSHOT_VERSION {
            return Err(format!("unsupported snapshot version {}", self.version));
        }
        let mut ids = HashSet::new();
        let mut digests = HashSet::new();
        for tok in &self.tokens {
            if !ids.insert(tok.token_id.as_str()) {
                return Err(format!("duplicate token_id '{}'", tok.token_id));
            }
            if tok.secret_sha256.len() != 64
                || !tok.secret_sha256.bytes().all(|b| b.is_ascii_hexdigit())
            {
                return Err(format!("token '{}' has a malformed digest", tok.token_id));
            }
            if !digests.insert(tok.secret_sha256.as_str()) {
                return Err(format!("token '{}' reuses another secret", tok.token_id));
            }
            if tok.enabled && tok.scopes.is_empty() {
                return Err(format!("enabled token '{}' has no scopes", tok.token_id));
            }
        }
        Ok(())
    }

    fn parse(bytes: &[u8]) -> Result<Self, String> {
        let snapshot: Snapshot = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
        snapshot.check()?;
        Ok(snapshot)
    }
}

/// The primary snapshot path plus its backup and temp siblings.
#[derive(Debug)]
pub struct SnapshotFile {
    path: PathBuf,
    backup_path: PathBuf,
    tmp_path: PathBuf,
    backed_up: bool,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "tokens.json".to_string());
        let backup_path = path.with_file_name(format!("{}.bak", name));
        let tmp_path = path.with_file_name(format!(".{}.tmp", name));
        Self {
            path,
            backup_path,
            tmp_path,
            backed_up: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    /// Load the snapshot. `Ok(None)` means a fresh install: neither the
    /// primary nor the backup exists.
    pub fn load(&mut self) -> Result<Option<Snapshot>, StoreError> {
        let primary_err = match read_snapshot(&self.path) {
            Ok(Some(snapshot)) => return Ok(Some(snapshot)),
            Ok(None) => None,
            Err(e) => Some(e),
        };

        match (&primary_err, read_snapshot(&self.backup_path)) {
            (None, Ok(None)) => Ok(None),
            (_, Ok(Some(backup))) => {
                tracing::warn!(
                    path = %self.path.display(),
                    backup = %self.backup_path.display(),
                    error = primary_err.as_deref().unwrap_or("primary missing"),
                    "token snapshot unreadable; recovering from backup"
                );
                self.restore_from_backup(&backup)?;
                match read_snapshot(&self.path) {
                    Ok(Some(snapshot)) => {
                        tracing::info!(
                            tokens = snapshot.tokens.len(),
                            "token snapshot recovered from backup"
                        );
                        Ok(Some(snapshot))
                    }
                    Ok(None) => Err(StoreError::Corrupted {
                        detail: "primary vanished after recovery".into(),
                    }),
                    Err(e) => Err(StoreError::Corrupted { detail: e }),
                }
            }
            (_, Ok(None)) => Err(StoreError::Corrupted {
                detail: format!(
                    "{}: {} (no backup)",
                    self.path.display(),
                    primary_err.unwrap_or_default()
                ),
            }),
            (_, Err(backup_err)) => Err(StoreError::Corrupted {
                detail: format!(
                    "{}: {}; backup {}: {}",
                    self.path.display(),
                    primary_err.unwrap_or_else(|| "missing".into()),
                    self.backup_path.display(),
                    backup_err
                ),
            }),
        }
    }

    /// Atomically replace the primary snapshot.
    pub fn write(&mut self, snapshot: &Snapshot) -> Result<(), StoreError> {
        snapshot.check().map_err(StoreError::Invalid)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        if !self.backed_up {
            self.backup_current()?;
            self.backed_up = true;
        }

        let bytes = serde_json::to_vec_pretty(snapshot)?;
        if let Err(e) = self.write_tmp_and_rename(&bytes) {
            let _ = fs::remove_file(&self.tmp_path);
            return Err(e);
        }
        Ok(())
    }

    fn backup_current(&self) -> Result<(), StoreError> {
        // An unreadable primary must not clobber a good backup.
        if let Ok(Some(_)) = read_snapshot(&self.path) {
            fs::copy(&self.path, &self.backup_path)?;
            File::open(&self.backup_path)?.sync_all()?;
            tracing::debug!(backup = %self.backup_path.display(), "token snapshot backed up");
        }
        Ok(())
    }

    fn write_tmp_and_rename(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let mut file = open_private(&self.tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);

        let written = fs::read(&self.tmp_path)?;
        Snapshot::parse(&written).map_err(|e| StoreError::Corrupted {
            detail: format!("staged snapshot failed verification: {}", e),
        })?;

        fs::rename(&self.tmp_path, &self.path)?;
        sync_parent(&self.path)?;
        Ok(())
    }

    fn restore_from_backup(&mut self, backup: &Snapshot) -> Result<(), StoreError> {
        if self.path.exists() {
            let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
            let aside = self.path.with_extension(format!("corrupt-{}", stamp));
            fs::rename(&self.path, &aside)?;
            tracing::warn!(moved_to = %aside.display(), "corrupted snapshot set aside");
        }
        // The backup is the last known-good state; keep it as-is.
        self.backed_up = true;
        let bytes = serde_json::to_vec_pretty(backup)?;
        if let Err(e) = self.write_tmp_and_rename(&bytes) {
            let _ = fs::remove_file(&self.tmp_path);
            return Err(e);
        }
        Ok(())
    }
}

fn read_snapshot(path: &Path) -> Result<Option<Snapshot>, String> {
    match fs::read(path) {
        Ok(bytes) => Snapshot::parse(&bytes).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => File::open(dir)?.sync_all(),
        _ => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn token(id: &str, digest_byte: char) -> StoredToken {
        StoredToken {
            token_id: id.into(),
            label: id.into(),
            secret_sha256: std::iter::repeat(digest_byte).take(64).collect(),
            scopes: ["admin".to_string()].into_iter().collect(),
            enabled: true,
            created_at: Utc::now(),
            last_used: None,
            expires_at: None,
            rules: Default::default(),
            metadata: Default::default(),
        }
    }

    fn snapshot(ids: &[(&str, char)]) -> Snapshot {
        Snapshot {
            tokens: ids.iter().map(|(id, c)| token(id, *c)).collect(),
            ..Snapshot::default()
        }
    }

    #[test]
    fn missing_files_mean_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = SnapshotFile::new(dir.path().join("tokens.json"));
        assert!(file.load().unwrap().is_none());
    }

    #[test]
    fn write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = SnapshotFile::new(dir.path().join("tokens.json"));
        file.write(&snapshot(&[("a", 'a')])).unwrap();
        assert!(file.path().exists());
        assert!(!file.tmp_path().exists());
        // First write of a session had nothing to back up.
        assert!(!file.backup_path().exists());
    }

    #[test]
    fn first_write_of_session_backs_up_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        SnapshotFile::new(&path)
            .write(&snapshot(&[("a", 'a')]))
            .unwrap();

        let mut session = SnapshotFile::new(&path);
        session.write(&snapshot(&[("b", 'b')])).unwrap();
        session.write(&snapshot(&[("c", 'c')])).unwrap();

        let backup: Snapshot =
            serde_json::from_slice(&fs::read(session.backup_path()).unwrap()).unwrap();
        assert_eq!(backup.tokens[0].token_id, "a");
    }

    #[test]
    fn invalid_snapshot_is_never_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = SnapshotFile::new(dir.path().join("tokens.json"));
        let bad = snapshot(&[("a", 'a'), ("a", 'b')]);
        assert!(matches!(file.write(&bad), Err(StoreError::Invalid(_))));
        assert!(!file.path().exists());
    }

    #[test]
    fn corrupt_primary_without_backup_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        fs::write(&path, b"{\"tokens\": [").unwrap();
        let mut file = SnapshotFile::new(&path);
        assert!(matches!(file.load(), Err(StoreError::Corrupted { .. })));
    }

    #[test]
    fn check_rejects_enabled_token_without_scopes() {
        let mut snap = snapshot(&[("a", 'a')]);
        snap.tokens[0].scopes.clear();
        assert!(snap.check().is_err());
        snap.tokens[0].enabled = false;
        assert!(snap.check().is_ok());
    }
}

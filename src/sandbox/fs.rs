//! Confined filesystem operations.
//!
//! Every method resolves its path through [`Confinement`] itself, even when
//! the caller already resolved it for policy evaluation. A request that sat
//! in the approval queue is re-checked against the filesystem as it is at
//! execution time.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use super::confine::Confinement;
use crate::errors::AppError;
use crate::models::operation::WriteMode;

/// Reads larger than this are refused rather than buffered.
pub const MAX_READ_BYTES: u64 = 32 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn io_error(path: &Path, err: io::Error) -> FsError {
    let shown = path.display().to_string();
    match err.kind() {
        io::ErrorKind::NotFound => FsError::NotFound(shown),
        io::ErrorKind::AlreadyExists => FsError::AlreadyExists(shown),
        io::ErrorKind::PermissionDenied => FsError::Invalid(format!("permission denied: {}", shown)),
        _ => FsError::Io(err),
    }
}

// ── Results ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Dir,
    File,
    Symlink,
    Other,
}

impl EntryKind {
    fn of(file_type: std::fs::FileType) -> Self {
        if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

impl EntryInfo {
    fn from_metadata(name: String, meta: &std::fs::Metadata) -> Self {
        Self {
            name,
            kind: EntryKind::of(meta.file_type()),
            size: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Listing {
    pub path: PathBuf,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    /// Present for directories; a file lists only itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<EntryInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<EntryInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileContent {
    pub path: PathBuf,
    pub size: u64,
    pub binary: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteResult {
    pub path: PathBuf,
    pub bytes_written: usize,
    pub mode: WriteMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct MkdirResult {
    pub path: PathBuf,
    pub created: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoveResult {
    pub path: PathBuf,
    #[serde(rename = "type")]
    pub kind: EntryKind,
}

// ── Gateway ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FsGateway {
    confinement: Confinement,
}

impl FsGateway {
    pub fn new(confinement: Confinement) -> Self {
        Self { confinement }
    }

    pub fn confinement(&self) -> &Confinement {
        &self.confinement
    }

    pub async fn ls(&self, raw: &Path) -> Result<Listing, AppError> {
        let path = self.confinement.resolve(raw)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io_error(raw, e))?;

        if !meta.is_dir() {
            let name = file_name(&path);
            return Ok(Listing {
                kind: EntryKind::of(meta.file_type()),
                info: Some(EntryInfo::from_metadata(name, &meta)),
                entries: None,
                path,
            });
        }

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| io_error(raw, e))?;
        while let Some(entry) = dir.next_entry().await.map_err(FsError::Io)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            // symlink_metadata: a link is listed as a link, not its target.
            match tokio::fs::symlink_metadata(entry.path()).await {
                Ok(meta) => entries.push(EntryInfo::from_metadata(name, &meta)),
                // Raced with a concurrent delete.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(FsError::Io(e).into()),
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Listing {
            path,
            kind: EntryKind::Dir,
            entries: Some(entries),
            info: None,
        })
    }

    pub async fn read(&self, raw: &Path) -> Result<FileContent, AppError> {
        let path = self.confinement.resolve(raw)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io_error(raw, e))?;
        if meta.is_dir() {
            return Err(FsError::Invalid(format!("is a directory: {}", raw.display())).into());
        }
        if meta.len() > MAX_READ_BYTES {
            return Err(FsError::Invalid(format!(
                "file is larger than {} bytes: {}",
                MAX_READ_BYTES,
                raw.display()
            ))
            .into());
        }

        let bytes = tokio::fs::read(&path).await.map_err(|e| io_error(raw, e))?;
        let size = bytes.len() as u64;
        Ok(match String::from_utf8(bytes) {
            Ok(content) => FileContent {
                path,
                size,
                binary: false,
                content: Some(content),
            },
            Err(_) => FileContent {
                path,
                size,
                binary: true,
                content: None,
            },
        })
    }

    pub async fn write(
        &self,
        raw: &Path,
        content: &str,
        mode: WriteMode,
    ) -> Result<WriteResult, AppError> {
        let path = self.confinement.resolve(raw)?;
        if tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_dir()) {
            return Err(FsError::Invalid(format!("is a directory: {}", raw.display())).into());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }

        match mode {
            WriteMode::Write => tokio::fs::write(&path, content.as_bytes())
                .await
                .map_err(|e| io_error(raw, e))?,
            WriteMode::Append => {
                use tokio::io::AsyncWriteExt;
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await
                    .map_err(|e| io_error(raw, e))?;
                file.write_all(content.as_bytes())
                    .await
                    .map_err(FsError::Io)?;
                file.flush().await.map_err(FsError::Io)?;
            }
        }

        Ok(WriteResult {
            path,
            bytes_written: content.len(),
            mode,
        })
    }

    pub async fn mkdir(
        &self,
        raw: &Path,
        parents: bool,
        exist_ok: bool,
    ) -> Result<MkdirResult, AppError> {
        let path = self.confinement.resolve(raw)?;

        if let Ok(meta) = tokio::fs::metadata(&path).await {
            if meta.is_dir() && exist_ok {
                return Ok(MkdirResult {
                    path,
                    created: false,
                });
            }
            return Err(FsError::AlreadyExists(raw.display().to_string()).into());
        }

        let created = if parents {
            tokio::fs::create_dir_all(&path).await
        } else {
            tokio::fs::create_dir(&path).await
        };
        match created {
            Ok(()) => Ok(MkdirResult {
                path,
                created: true,
            }),
            // Lost a race with a concurrent mkdir.
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && exist_ok => Ok(MkdirResult {
                path,
                created: false,
            }),
            Err(e) => Err(io_error(raw, e).into()),
        }
    }

    pub async fn rm(&self, raw: &Path, recursive: bool) -> Result<RemoveResult, AppError> {
        let path = self.confinement.resolve_for_removal(raw)?;
        if path == self.confinement.base_dir() || path.parent().is_none() {
            return Err(FsError::Invalid(format!(
                "refusing to remove {}",
                path.display()
            ))
            .into());
        }

        let meta = tokio::fs::symlink_metadata(&path)
            .await
            .map_err(|e| io_error(raw, e))?;
        let kind = EntryKind::of(meta.file_type());

        if kind == EntryKind::Dir {
            if recursive {
                tokio::fs::remove_dir_all(&path)
                    .await
                    .map_err(|e| io_error(raw, e))?;
            } else {
                let mut dir = tokio::fs::read_dir(&path)
                    .await
                    .map_err(|e| io_error(raw, e))?;
                if dir.next_entry().await.map_err(FsError::Io)?.is_some() {
                    return Err(FsError::NotEmpty(raw.display().to_string()).into());
                }
                tokio::fs::remove_dir(&path)
                    .await
                    .map_err(|e| io_error(raw, e))?;
            }
        } else {
            // Files, symlinks (never followed) and special files.
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| io_error(raw, e))?;
        }

        tracing::info!(path = %path.display(), kind = ?kind, "removed");
        Ok(RemoveResult { path, kind })
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

//! Path confinement.
//!
//! Every path is made absolute (relative paths hang off the base directory,
//! `~` expands to the home directory) and resolved with symlinks followed
//! for every component that exists. Components that do not exist yet are
//! appended lexically. Only then is the result compared against the base
//! directory, so `..` segments and symlinks cannot escape it.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::errors::AppError;

/// Matches the kernel's ELOOP limit.
const MAX_SYMLINK_DEPTH: usize = 40;

#[derive(Debug, Clone)]
pub struct Confinement {
    base_dir: PathBuf,
    allow_absolute: bool,
}

impl Confinement {
    /// `base_dir` must exist; it is canonicalized once here.
    pub fn new(base_dir: &Path, allow_absolute: bool) -> io::Result<Self> {
        let base_dir = fs::canonicalize(expand_tilde(base_dir))?;
        if !base_dir.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("base directory is not a directory: {}", base_dir.display()),
            ));
        }
        Ok(Self {
            base_dir,
            allow_absolute,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn allow_absolute(&self) -> bool {
        self.allow_absolute
    }

    /// Resolve `raw` fully, following a final-component symlink too.
    pub fn resolve(&self, raw: &Path) -> Result<PathBuf, AppError> {
        let abs = self.absolutize(raw)?;
        let resolved = resolve_lenient(&abs).map_err(|e| {
            AppError::InvalidRequest(format!("cannot resolve {}: {}", raw.display(), e))
        })?;
        self.check(raw, resolved)
    }

    /// Resolve the parent of `raw` but keep its final component as written,
    /// so a symlink is addressed as itself rather than its target.
    pub fn resolve_for_removal(&self, raw: &Path) -> Result<PathBuf, AppError> {
        let abs = self.absolutize(raw)?;
        let mut parts: Vec<Component<'_>> = abs.components().collect();
        let name = match parts.pop() {
            Some(Component::Normal(name)) => name.to_os_string(),
            _ => {
                return Err(AppError::InvalidRequest(format!(
                    "path does not name a removable entry: {}",
                    raw.display()
                )))
            }
        };
        let parent: PathBuf = parts.iter().collect();
        let parent = resolve_lenient(&parent).map_err(|e| {
            AppError::InvalidRequest(format!("cannot resolve {}: {}", raw.display(), e))
        })?;
        self.check(raw, parent.join(name))
    }

    fn absolutize(&self, raw: &Path) -> Result<PathBuf, AppError> {
        if raw.as_os_str().is_empty() {
            return Err(AppError::InvalidRequest("path must not be empty".into()));
        }
        let expanded = expand_tilde(raw);
        Ok(if expanded.is_absolute() {
            expanded
        } else {
            self.base_dir.join(expanded)
        })
    }

    fn check(&self, raw: &Path, resolved: PathBuf) -> Result<PathBuf, AppError> {
        if self.allow_absolute || resolved.starts_with(&self.base_dir) {
            Ok(resolved)
        } else {
            tracing::warn!(
                requested = %raw.display(),
                resolved = %resolved.display(),
                base = %self.base_dir.display(),
                "path escapes base directory"
            );
            Err(AppError::PathOutsideBase(raw.display().to_string()))
        }
    }
}

/// `~` and `~/rest` expand to the home directory; anything else is returned
/// unchanged.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(first)) if first == "~" => match dirs::home_dir() {
            Some(home) => home.join(components.as_path()),
            None => path.to_path_buf(),
        },
        _ => path.to_path_buf(),
    }
}

/// Canonicalize an absolute path that may not fully exist.
///
/// Existing components are resolved through the filesystem (dangling
/// symlinks included, by following their targets); missing components are
/// appended as written.
pub fn resolve_lenient(path: &Path) -> io::Result<PathBuf> {
    resolve_depth(path, 0)
}

fn resolve_depth(path: &Path, depth: usize) -> io::Result<PathBuf> {
    if depth > MAX_SYMLINK_DEPTH {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "too many levels of symbolic links",
        ));
    }

    let mut resolved = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => resolved.push(p.as_os_str()),
            Component::RootDir => resolved.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            // `resolved` is canonical at every step, so popping is exact.
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(name) => {
                let candidate = resolved.join(name);
                resolved = match fs::symlink_metadata(&candidate) {
                    Err(_) => candidate,
                    Ok(meta) if meta.file_type().is_symlink() => match fs::canonicalize(&candidate) {
                        Ok(target) => target,
                        Err(_) => {
                            // Dangling link: resolve where it points.
                            let target = fs::read_link(&candidate)?;
                            let target = if target.is_absolute() {
                                target
                            } else {
                                resolved.join(target)
                            };
                            resolve_depth(&target, depth + 1)?
                        }
                    },
                    Ok(_) => fs::canonicalize(&candidate)?,
                };
            }
        }
    }
    if resolved.as_os_str().is_empty() {
        resolved.push(Component::RootDir.as_os_str());
    }
    Ok(resolved)
}

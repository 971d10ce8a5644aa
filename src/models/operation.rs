//! Operation descriptors.
//!
//! Every privileged request is described by an [`Operation`] before any
//! policy is evaluated. The same value is stored in approval requests, so
//! a human approves exactly the arguments that will run.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::token::{SCOPE_EXEC, SCOPE_FS_READ, SCOPE_FS_WRITE};

pub const OP_FS_LS: &str = "fs_ls";
pub const OP_FS_READ: &str = "fs_read";
pub const OP_FS_WRITE: &str = "fs_write";
pub const OP_FS_MKDIR: &str = "fs_mkdir";
pub const OP_FS_RM: &str = "fs_rm";
pub const OP_EXEC: &str = "exec";
pub const OP_EXEC_SUDO: &str = "exec:sudo";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    #[default]
    Write,
    Append,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    FsList {
        path: PathBuf,
    },
    FsRead {
        path: PathBuf,
    },
    FsWrite {
        path: PathBuf,
        content: String,
        mode: WriteMode,
    },
    FsMkdir {
        path: PathBuf,
        parents: bool,
        exist_ok: bool,
    },
    FsRm {
        path: PathBuf,
        recursive: bool,
    },
    Exec {
        cmd: Vec<String>,
        cwd: PathBuf,
        timeout_secs: u64,
        sudo: bool,
    },
}

impl Operation {
    /// Stable operation name used by `require_approval_operations`.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::FsList { .. } => OP_FS_LS,
            Operation::FsRead { .. } => OP_FS_READ,
            Operation::FsWrite { .. } => OP_FS_WRITE,
            Operation::FsMkdir { .. } => OP_FS_MKDIR,
            Operation::FsRm { .. } => OP_FS_RM,
            Operation::Exec { .. } if self.is_sudo() => OP_EXEC_SUDO,
            Operation::Exec { .. } => OP_EXEC,
        }
    }

    pub fn required_scope(&self) -> &'static str {
        match self {
            Operation::FsList { .. } | Operation::FsRead { .. } => SCOPE_FS_READ,
            Operation::FsWrite { .. } | Operation::FsMkdir { .. } | Operation::FsRm { .. } => {
                SCOPE_FS_WRITE
            }
            Operation::Exec { .. } => SCOPE_EXEC,
        }
    }

    /// The filesystem target of an fs operation, or the cwd of an exec.
    pub fn path(&self) -> &Path {
        match self {
            Operation::FsList { path }
            | Operation::FsRead { path }
            | Operation::FsWrite { path, .. }
            | Operation::FsMkdir { path, .. }
            | Operation::FsRm { path, .. } => path,
            Operation::Exec { cwd, .. } => cwd,
        }
    }

    pub fn path_mut(&mut self) -> &mut PathBuf {
        match self {
            Operation::FsList { path }
            | Operation::FsRead { path }
            | Operation::FsWrite { path, .. }
            | Operation::FsMkdir { path, .. }
            | Operation::FsRm { path, .. } => path,
            Operation::Exec { cwd, .. } => cwd,
        }
    }

    pub fn command(&self) -> Option<&[String]> {
        match self {
            Operation::Exec { cmd, .. } => Some(cmd),
            _ => None,
        }
    }

    /// True for `sudo: true`, and for an argv that invokes sudo directly.
    pub fn is_sudo(&self) -> bool {
        match self {
            Operation::Exec { cmd, sudo, .. } => {
                *sudo || cmd.first().map(|c| command_name(c) == "sudo").unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Short human summary for logs and the approval queue.
    pub fn summary(&self) -> String {
        match self {
            Operation::Exec { cmd, cwd, .. } => {
                format!("{} `{}` in {}", self.name(), cmd.join(" "), cwd.display())
            }
            _ => format!("{} {}", self.name(), self.path().display()),
        }
    }
}

/// Basename of argv[0], so `/usr/bin/rm` and `rm` compare equal.
pub fn command_name(arg0: &str) -> &str {
    Path::new(arg0)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(arg0)
}

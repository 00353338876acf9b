//! Privilege-escalation collaborator
//!
//! The update engine performs every mutation of the live tree through a
//! [`Privilege`] so installations owned by root can be updated from an
//! unprivileged invocation.

use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use crate::error::HatchError;
use crate::fsutil;
use crate::paths::is_root;

/// A filesystem mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOp {
    /// Copy a file or directory tree to a new location
    Copy { from: PathBuf, to: PathBuf },
    /// Rename within one filesystem
    Move { from: PathBuf, to: PathBuf },
    /// Remove a file or directory tree
    Remove { path: PathBuf },
    /// Create a directory and its missing parents
    CreateDir { path: PathBuf },
    /// Replace a file's contents
    Write { path: PathBuf, data: Vec<u8> },
}

impl fmt::Display for FileOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileOp::Copy { from, to } => write!(f, "copy {} -> {}", from.display(), to.display()),
            FileOp::Move { from, to } => write!(f, "move {} -> {}", from.display(), to.display()),
            FileOp::Remove { path } => write!(f, "remove {}", path.display()),
            FileOp::CreateDir { path } => write!(f, "create {}", path.display()),
            FileOp::Write { path, .. } => write!(f, "write {}", path.display()),
        }
    }
}

pub trait Privilege {
    fn perform(&self, op: &FileOp) -> Result<()>;
}

/// Perform the operation with the current credentials
fn perform_direct(op: &FileOp) -> std::io::Result<()> {
    match op {
        FileOp::Copy { from, to } => {
            if from.is_dir() {
                fsutil::copy_tree(from, to).map_err(|e| std::io::Error::new(ErrorKind::Other, e))
            } else {
                fs::copy(from, to).map(|_| ())
            }
        }
        FileOp::Move { from, to } => fs::rename(from, to),
        FileOp::Remove { path } => {
            if path.is_dir() {
                fs::remove_dir_all(path)
            } else {
                fs::remove_file(path)
            }
        }
        FileOp::CreateDir { path } => fs::create_dir_all(path),
        FileOp::Write { path, data } => fsutil::atomic_write(path, data).map_err(|e| match e {
            HatchError::Io { source, .. } => source,
            other => std::io::Error::new(ErrorKind::Other, other),
        }),
    }
}

/// Never escalates
#[derive(Debug, Clone, Copy, Default)]
pub struct Direct;

impl Privilege for Direct {
    fn perform(&self, op: &FileOp) -> Result<()> {
        perform_direct(op).with_context(|| format!("failed to {op}"))
    }
}

/// Tries directly; on permission denial retries through non-interactive
/// `sudo` unless already root.
#[derive(Debug, Clone, Copy, Default)]
pub struct Escalating;

impl Escalating {
    fn sudo(op: &FileOp) -> Result<()> {
        let mut cmd = Command::new("sudo");
        cmd.arg("-n");
        match op {
            FileOp::Copy { from, to } => cmd.arg("cp").arg("-a").arg(from).arg(to),
            FileOp::Move { from, to } => cmd.arg("mv").arg("-T").arg(from).arg(to),
            FileOp::Remove { path } => cmd.arg("rm").arg("-rf").arg(path),
            FileOp::CreateDir { path } => cmd.arg("mkdir").arg("-p").arg(path),
            FileOp::Write { path, .. } => cmd.arg("tee").arg(path),
        };

        info!("Requesting administrator privileges to {}", op);
        let output = match op {
            FileOp::Write { data, .. } => {
                let mut child = cmd
                    .stdin(Stdio::piped())
                    .stdout(Stdio::null())
                    .stderr(Stdio::piped())
                    .spawn()
                    .context("failed to execute sudo")?;
                if let Some(mut stdin) = child.stdin.take() {
                    stdin.write_all(data).context("failed to feed sudo tee")?;
                }
                child.wait_with_output().context("failed to wait for sudo")?
            }
            _ => cmd.output().context("failed to execute sudo")?,
        };
        if !output.status.success() {
            bail!(
                "sudo {} failed: {}",
                op,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

impl Privilege for Escalating {
    fn perform(&self, op: &FileOp) -> Result<()> {
        match perform_direct(op) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::PermissionDenied && !is_root() => {
                debug!("{} denied, escalating", op);
                Self::sudo(op)
            }
            Err(e) => Err(e).with_context(|| format!("failed to {op}")),
        }
    }
}

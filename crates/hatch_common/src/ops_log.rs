//! Operations log - lifecycle audit trail
//!
//! Records every state-changing lifecycle operation in `R/ops.log`, one
//! line each:
//!
//! ```text
//! 2026-10-19T17:05:23Z updater applied 1.2.0->1.3.0 txn=...
//! ```

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct OpsLog {
    path: PathBuf,
}

impl OpsLog {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Append an entry. Failures are reported through tracing; the audit
    /// trail never aborts the operation it describes.
    pub fn log(&self, component: &str, event: &str, detail: Option<&str>) {
        let line = match detail {
            Some(d) => format!(
                "{} {} {} {}",
                Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                component,
                event,
                d
            ),
            None => format!(
                "{} {} {}",
                Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                component,
                event
            ),
        };

        if let Err(e) = self.append(&line) {
            warn!("Failed to write ops log {}: {}", self.path.display(), e);
        }
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)
    }

    /// Last `n` lines, oldest first
    pub fn tail(&self, n: usize) -> Vec<String> {
        read_lines(&self.path)
            .map(|lines| {
                let skip = lines.len().saturating_sub(n);
                lines.into_iter().skip(skip).collect()
            })
            .unwrap_or_default()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_lines(path: &Path) -> Option<Vec<String>> {
    let content = fs::read_to_string(path).ok()?;
    Some(content.lines().map(str::to_string).collect())
}

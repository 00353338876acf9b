//! Process-control collaborator
//!
//! The managed service is restarted after a successful apply or rollback.
//! `Systemctl` drives a systemd unit; `NoService` is used when nothing is
//! configured.

use std::fmt;
use std::process::Command;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Running,
    Stopped,
    Unknown,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::Running => write!(f, "running"),
            ServiceStatus::Stopped => write!(f, "stopped"),
            ServiceStatus::Unknown => write!(f, "unknown"),
        }
    }
}

pub trait ServiceControl {
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn restart(&self) -> Result<()>;
    fn status(&self) -> ServiceStatus;
}

/// A systemd unit controlled through `systemctl`
#[derive(Debug, Clone)]
pub struct Systemctl {
    unit: String,
}

impl Systemctl {
    pub fn new(unit: impl Into<String>) -> Self {
        Self { unit: unit.into() }
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    fn run(&self, action: &str) -> Result<()> {
        debug!("systemctl {} {}", action, self.unit);
        let output = Command::new("systemctl")
            .args([action, &self.unit])
            .output()
            .context("systemctl failed")?;

        if !output.status.success() {
            bail!(
                "systemctl {} {} failed: {}",
                action,
                self.unit,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

impl ServiceControl for Systemctl {
    fn start(&self) -> Result<()> {
        self.run("start")
    }

    fn stop(&self) -> Result<()> {
        self.run("stop")
    }

    fn restart(&self) -> Result<()> {
        self.run("restart")
    }

    fn status(&self) -> ServiceStatus {
        let output = Command::new("systemctl")
            .args(["is-active", &self.unit])
            .output();

        match output {
            Ok(output) => match String::from_utf8_lossy(&output.stdout).trim() {
                "active" | "activating" | "reloading" => ServiceStatus::Running,
                "inactive" | "failed" | "deactivating" => ServiceStatus::Stopped,
                _ => ServiceStatus::Unknown,
            },
            Err(_) => ServiceStatus::Unknown,
        }
    }
}

/// No managed service: control calls succeed, status is always stopped
#[derive(Debug, Clone, Copy, Default)]
pub struct NoService;

impl ServiceControl for NoService {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn restart(&self) -> Result<()> {
        Ok(())
    }

    fn status(&self) -> ServiceStatus {
        ServiceStatus::Stopped
    }
}

/// Service control for an optional configured unit name
pub fn service_for(unit: Option<&str>) -> Box<dyn ServiceControl> {
    match unit {
        Some(unit) => Box::new(Systemctl::new(unit)),
        None => Box::new(NoService),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_service_is_stopped() {
        let service = service_for(None);
        assert_eq!(service.status(), ServiceStatus::Stopped);
        assert!(service.restart().is_ok());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ServiceStatus::Running.to_string(), "running");
        assert_eq!(ServiceStatus::Unknown.to_string(), "unknown");
    }
}

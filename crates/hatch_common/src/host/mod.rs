//! Host collaborators: process control, privilege escalation, version
//! sources and child-process helpers.

pub mod privilege;
pub mod process;
pub mod service;
pub mod source;

pub use privilege::{Direct, Escalating, FileOp, Privilege};
pub use process::{run_with_timeout, TimedOut};
pub use service::{service_for, NoService, ServiceControl, ServiceStatus, Systemctl};
pub use source::{source_for, DirectorySource, GitSource, VersionSource};

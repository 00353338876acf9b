//! Child processes with a deadline
//!
//! Output pipes are drained on helper threads so a chatty child cannot
//! block on a full pipe while we wait for it.

use std::io::Read;
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::warn;

/// How often a running child is polled
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A child was killed at its deadline
#[derive(Debug, Error)]
#[error("{program} timed out after {}s", .after.as_secs())]
pub struct TimedOut {
    pub program: String,
    pub after: Duration,
}

/// Run `cmd` to completion, killing it once `timeout` has elapsed
pub fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<Output> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = match wait_until(&mut child, Instant::now() + timeout)? {
        Some(status) => status,
        None => {
            if let Err(e) = child.kill() {
                warn!("Failed to kill {}: {}", program, e);
            }
            let _ = child.wait();
            return Err(TimedOut {
                program,
                after: timeout,
            }
            .into());
        }
    };

    Ok(Output {
        status,
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    })
}

fn wait_until(child: &mut Child, deadline: Instant) -> Result<Option<std::process::ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait().context("failed to poll child")? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

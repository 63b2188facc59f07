//! Bounded subprocess execution.
//!
//! Device-bridge and OCR commands run as child processes. A child that
//! outlives its deadline, or whose token is cancelled, is killed rather
//! than left running.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::automation::cancel::Deadline;

/// Poll interval while waiting for a child to exit.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("timed out")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
    #[error("non-zero exit code: {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },
}

/// Captured output of a finished command.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs `cmd` to completion or until `deadline` passes.
///
/// Stdout and stderr are drained on helper threads so a chatty child cannot
/// block on a full pipe while we poll it.
pub fn run_bounded(mut cmd: Command, deadline: &Deadline) -> Result<ProcessOutput, ProcessError> {
    if deadline.is_cancelled() {
        return Err(ProcessError::Cancelled);
    }

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => {
                kill(&mut child);
                return Err(ProcessError::Spawn(e));
            }
        }
        if deadline.is_cancelled() {
            kill(&mut child);
            return Err(ProcessError::Cancelled);
        }
        if deadline.expired() {
            kill(&mut child);
            return Err(ProcessError::Timeout);
        }
        thread::sleep(POLL_INTERVAL.min(deadline.remaining().max(Duration::from_millis(1))));
    };

    let output = ProcessOutput {
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    };

    if !status.success() {
        return Err(ProcessError::NonZeroExit {
            code: status.code(),
            stderr: output.stderr.trim().to_string(),
        });
    }

    Ok(output)
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).to_string()
    })
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

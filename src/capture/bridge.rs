//! Device bridge: the black-box capability that captures frames on a
//! virtual device, transfers them locally and injects taps.
//!
//! Every call reports failure as `false`/`None`; nothing crosses this
//! boundary as an error. Each command carries its own timeout and the
//! caller's cancellation token.

use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::automation::cancel::CancelToken;
use crate::automation::config::{ms, BridgeConfig};
use crate::automation::detection::Point;
use crate::capture::process::run_bounded;

/// Device-side frame files rotate through this many names. Each one is
/// removed right after it is pulled, so the ring only has to cover
/// captures that are in flight at the same time.
const REMOTE_SLOTS: u64 = 16;

fn remote_path(seq: u64) -> String {
    format!("/sdcard/screen_{}.png", seq % REMOTE_SLOTS)
}

/// A frame that exists on the device and still has to be pulled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFrame {
    pub path: String,
}

pub trait DeviceBridge: Send + Sync {
    /// Captures the screen into a file on the device.
    fn capture(&self, index: u32, cancel: &CancelToken) -> Option<RemoteFrame>;

    /// Transfers a device file to `local`.
    fn pull(&self, index: u32, remote: &RemoteFrame, local: &Path, cancel: &CancelToken) -> bool;

    /// Injects a tap at screen coordinates.
    fn tap(&self, index: u32, point: Point, cancel: &CancelToken) -> bool;

    /// Whether the instance's virtual machine is running.
    fn is_running(&self, index: u32, cancel: &CancelToken) -> bool;
}

/// Drives MEmu instances through `memuc` and its embedded adb.
pub struct MemucBridge {
    config: BridgeConfig,
    counter: AtomicU64,
}

impl MemucBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            counter: AtomicU64::new(0),
        }
    }

    fn adb(&self, index: u32) -> Command {
        let mut cmd = Command::new(&self.config.memuc_path);
        cmd.arg("adb").arg("-i").arg(index.to_string());
        cmd
    }

    /// Best effort; a leftover file is overwritten when its slot comes round.
    fn remove_remote(&self, index: u32, remote: &RemoteFrame, cancel: &CancelToken) {
        let mut cmd = self.adb(index);
        cmd.args(["shell", "rm", "-f", &remote.path]);
        if let Err(e) = run_bounded(cmd, &cancel.deadline(ms(self.config.query_timeout_ms))) {
            crate::log(&format!(
                "[Instance {}] Could not remove {}: {}",
                index, remote.path, e
            ));
        }
    }
}

impl DeviceBridge for MemucBridge {
    fn capture(&self, index: u32, cancel: &CancelToken) -> Option<RemoteFrame> {
        // Overlapping captures on one instance get distinct device files
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let remote = RemoteFrame {
            path: remote_path(seq),
        };

        let mut cmd = self.adb(index);
        cmd.args(["shell", "screencap", "-p", &remote.path]);

        match run_bounded(cmd, &cancel.deadline(ms(self.config.capture_timeout_ms))) {
            Ok(_) => Some(remote),
            Err(e) => {
                crate::log(&format!(
                    "[Instance {}] Screenshot capture failed: {}",
                    index, e
                ));
                None
            }
        }
    }

    fn pull(&self, index: u32, remote: &RemoteFrame, local: &Path, cancel: &CancelToken) -> bool {
        let mut cmd = self.adb(index);
        cmd.arg("pull").arg(&remote.path).arg(local);

        let pulled = match run_bounded(cmd, &cancel.deadline(ms(self.config.pull_timeout_ms))) {
            Ok(_) => true,
            Err(e) => {
                crate::log(&format!("[Instance {}] Screenshot pull failed: {}", index, e));
                false
            }
        };
        self.remove_remote(index, remote, cancel);
        pulled
    }

    fn tap(&self, index: u32, point: Point, cancel: &CancelToken) -> bool {
        let mut cmd = self.adb(index);
        cmd.args(["shell", "input", "tap"])
            .arg(point.x.to_string())
            .arg(point.y.to_string());

        match run_bounded(cmd, &cancel.deadline(ms(self.config.tap_timeout_ms))) {
            Ok(_) => {
                crate::log(&format!(
                    "[Instance {}] Tapped at ({}, {})",
                    index, point.x, point.y
                ));
                true
            }
            Err(e) => {
                crate::log(&format!("[Instance {}] Tap failed: {}", index, e));
                false
            }
        }
    }

    fn is_running(&self, index: u32, cancel: &CancelToken) -> bool {
        let mut cmd = Command::new(&self.config.memuc_path);
        cmd.args(["isvmrunning", "-i"]).arg(index.to_string());

        match run_bounded(cmd, &cancel.deadline(ms(self.config.query_timeout_ms))) {
            Ok(out) => parse_running(&out.stdout),
            Err(e) => {
                crate::log(&format!(
                    "Error checking if instance {} is running: {}",
                    index, e
                ));
                false
            }
        }
    }
}

/// `isvmrunning` prints `1` or `Running` on its first line for a live VM.
fn parse_running(stdout: &str) -> bool {
    stdout
        .lines()
        .next()
        .map(|line| {
            let line = line.trim();
            line == "1" || line.eq_ignore_ascii_case("running")
        })
        .unwrap_or(false)
}

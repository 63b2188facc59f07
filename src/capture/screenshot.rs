//! Screenshot acquisition through the device bridge.

use chrono::Local;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::automation::cancel::CancelToken;
use crate::automation::config::{ms, CaptureConfig};
use crate::capture::bridge::DeviceBridge;
use crate::capture::store::{CapturePurpose, FrameStore, ScreenCapture};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture cancelled")]
    Cancelled,
    #[error("device capture command failed")]
    CaptureCommandFailed,
    #[error("transfer from device failed")]
    PullFailed,
    #[error("screenshot missing after transfer")]
    Missing,
    #[error("screenshot too small ({bytes} bytes, need more than {floor})")]
    TooSmall { bytes: u64, floor: u64 },
    #[error("screenshot could not be decoded: {0}")]
    Undecodable(String),
    #[error("screenshot I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("screenshot failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<CaptureError>,
    },
}

/// Obtains fresh, validated screenshots for device instances.
pub struct CaptureGateway {
    bridge: Arc<dyn DeviceBridge>,
    store: FrameStore,
    config: CaptureConfig,
}

impl CaptureGateway {
    pub fn new(bridge: Arc<dyn DeviceBridge>, store: FrameStore, config: CaptureConfig) -> Self {
        Self {
            bridge,
            store,
            config,
        }
    }

    /// Where this gateway writes its artifacts.
    pub fn store(&self) -> &FrameStore {
        &self.store
    }

    /// Whether `capture` is still inside the configured validity window.
    /// A stale capture is logged and must be replaced before a decision.
    pub fn is_usable(&self, capture: &ScreenCapture) -> bool {
        if capture.is_fresh(ms(self.config.validity_ms)) {
            return true;
        }
        crate::log(&format!(
            "[Instance {}] Discarding stale {} capture ({} bytes)",
            capture.instance, capture.purpose, capture.bytes
        ));
        false
    }

    /// Captures a screenshot for `instance` and writes it to the purpose's
    /// artifact path.
    ///
    /// Each attempt deletes the previous artifact first, so a file that
    /// survives validation is always the one this call transferred.
    /// Validation failures are retried up to `max_attempts` times.
    pub fn capture(
        &self,
        instance: u32,
        purpose: CapturePurpose,
        cancel: &CancelToken,
    ) -> Result<ScreenCapture, CaptureError> {
        self.store.ensure_dir()?;
        let path = self.store.path_for(instance, purpose);
        let attempts = self.config.max_attempts.max(1);
        let mut last = CaptureError::Missing;

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(CaptureError::Cancelled);
            }

            self.store.invalidate(instance, purpose)?;

            match self.capture_once(instance, &path, cancel) {
                Ok(bytes) => {
                    crate::log(&format!(
                        "[Instance {}] Screenshot saved: {} ({} bytes)",
                        instance,
                        path.display(),
                        bytes
                    ));
                    return Ok(ScreenCapture {
                        instance,
                        purpose,
                        path,
                        bytes,
                        captured_at: Local::now(),
                    });
                }
                Err(CaptureError::Cancelled) => return Err(CaptureError::Cancelled),
                Err(e) => {
                    crate::log(&format!(
                        "[Instance {}] Screenshot attempt {}/{} failed: {}",
                        instance, attempt, attempts, e
                    ));
                    last = e;
                }
            }

            if attempt < attempts && !cancel.sleep(ms(self.config.retry_delay_ms)) {
                return Err(CaptureError::Cancelled);
            }
        }

        // Never leave a rejected artifact where a matcher could pick it up
        let _ = self.store.invalidate(instance, purpose);

        Err(CaptureError::Exhausted {
            attempts,
            last: Box::new(last),
        })
    }

    fn capture_once(
        &self,
        instance: u32,
        path: &Path,
        cancel: &CancelToken,
    ) -> Result<u64, CaptureError> {
        let remote = self
            .bridge
            .capture(instance, cancel)
            .ok_or(CaptureError::CaptureCommandFailed)?;

        if !cancel.sleep(ms(self.config.settle_delay_ms)) {
            return Err(CaptureError::Cancelled);
        }

        if !self.bridge.pull(instance, &remote, path, cancel) {
            return Err(if cancel.is_cancelled() {
                CaptureError::Cancelled
            } else {
                CaptureError::PullFailed
            });
        }

        validate_artifact(path, self.config.min_bytes, self.config.verify_decode)
    }
}

/// Checks that a transferred screenshot exists, exceeds `min_bytes` and,
/// if requested, decodes as an image. Returns the file size.
pub fn validate_artifact(path: &Path, min_bytes: u64, verify_decode: bool) -> Result<u64, CaptureError> {
    let bytes = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(_) => return Err(CaptureError::Missing),
    };

    if bytes <= min_bytes {
        return Err(CaptureError::TooSmall {
            bytes,
            floor: min_bytes,
        });
    }

    if verify_decode {
        image::open(path).map_err(|e| CaptureError::Undecodable(e.to_string()))?;
    }

    Ok(bytes)
}

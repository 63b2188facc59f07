//! Screen capture for virtual device instances.
//!
//! This module provides:
//! - The device bridge capability (`DeviceBridge`, `MemucBridge`)
//! - Bounded subprocess execution for bridge commands
//! - Screenshot artifact naming and cleanup (`FrameStore`)
//! - Validated screenshot acquisition (`CaptureGateway`)

pub mod bridge;
pub mod process;
pub mod screenshot;
pub mod store;

pub use bridge::{DeviceBridge, MemucBridge};
pub use screenshot::{CaptureError, CaptureGateway};
pub use store::{CapturePurpose, FrameStore, ScreenCapture};

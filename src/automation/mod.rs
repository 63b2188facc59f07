//! Task automation for emulator instances.
//!
//! This module provides:
//! - Bot configuration and cancellation primitives
//! - Template matching against captured screens
//! - Device instances with per-task run flags
//! - The AutoStartGame and GatherResources controllers and their runner
//! - Per-instance module settings

pub mod cancel;
pub mod config;
pub mod detection;
pub mod gather;
pub mod instance;
pub mod modules;
pub mod runner;
pub mod state;

pub use cancel::CancelToken;
pub use config::{load_config, BotConfig, RelativeRect};
pub use detection::{Point, TemplateMatch, TemplateMatcher};
pub use gather::{GatherOutcome, GatherState, MarchDispatcher, PlaceholderDispatcher};
pub use instance::{DeviceInstance, InstanceStatus, RunFlag, RunGuard};
pub use modules::{ModuleKind, ModuleSettings, ModuleState, ModuleStore};
pub use runner::{start_auto_start, start_gather, ControllerRunState, TaskContext, TaskHandle};
pub use state::{AutoStartOutcome, AutoStartState};

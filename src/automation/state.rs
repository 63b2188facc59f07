//! AutoStartGame state machine.
//!
//! Idle → Attempting → Done | GivenUp | Failed | Cancelled.
//! Each attempt captures the home screen, stops if the game is already
//! running, clears popups, and otherwise taps the launcher.

use std::fmt;
use std::sync::Arc;

use crate::automation::cancel::CancelToken;
use crate::automation::config::ms;
use crate::automation::instance::DeviceInstance;
use crate::automation::runner::{ControllerRunState, TaskContext};
use crate::capture::{CaptureError, CapturePurpose, ScreenCapture};

#[derive(Debug, Clone, PartialEq)]
pub enum AutoStartState {
    /// Not started yet
    Idle,
    /// Working through attempt slots
    Attempting,
    /// Game seen running
    Done,
    /// Internal error ended the run
    Failed(String),
    /// Every attempt slot spent without seeing the game running
    GivenUp,
    /// Stop requested
    Cancelled,
}

impl fmt::Display for AutoStartState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutoStartState::Idle => write!(f, "Idle"),
            AutoStartState::Attempting => write!(f, "Attempting"),
            AutoStartState::Done => write!(f, "Done"),
            AutoStartState::Failed(msg) => write!(f, "Failed: {}", msg),
            AutoStartState::GivenUp => write!(f, "Given up"),
            AutoStartState::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// How a finished AutoStartGame run ended.
#[derive(Debug, Clone)]
pub struct AutoStartOutcome {
    pub state: AutoStartState,
    /// Attempt slots consumed
    pub attempts_used: u32,
    pub popups_closed: u32,
    /// Every status line reported during the run, oldest first
    pub history: Vec<String>,
}

impl AutoStartOutcome {
    /// Status shown when the loop ended, before the finalizer replaced it.
    pub fn final_status(&self) -> &str {
        self.history.last().map_or("", String::as_str)
    }

    pub(crate) fn failed(message: String) -> Self {
        Self {
            state: AutoStartState::Failed(message.clone()),
            attempts_used: 0,
            popups_closed: 0,
            history: vec![format!("[ERROR] {}", message)],
        }
    }
}

/// Result of one pass through the attempt body.
enum Step {
    /// Running icon found
    Running,
    /// A popup was closed; the attempt restarts on a fresh capture
    PopupClosed,
    /// Slot used, wait before the next one
    Attempted,
    /// Slot used by a capture failure, already waited
    CaptureFailed,
    Cancelled,
}

pub struct AutoStartController<'a> {
    ctx: &'a TaskContext,
    instance: Arc<DeviceInstance>,
    cancel: CancelToken,
    run_state: Arc<ControllerRunState>,
    attempts: u32,
    state: AutoStartState,
    attempt: u32,
    popups_closed: u32,
    history: Vec<String>,
}

impl<'a> AutoStartController<'a> {
    pub fn new(
        ctx: &'a TaskContext,
        instance: Arc<DeviceInstance>,
        attempts: u32,
        cancel: CancelToken,
        run_state: Arc<ControllerRunState>,
    ) -> Self {
        Self {
            ctx,
            instance,
            cancel,
            run_state,
            attempts,
            state: AutoStartState::Idle,
            attempt: 0,
            popups_closed: 0,
            history: Vec::new(),
        }
    }

    fn report(&mut self, status: String) {
        self.instance.set_state(&status);
        self.history.push(status);
    }

    fn transition(&mut self, state: AutoStartState) {
        crate::log(&format!(
            "[Instance {}] AutoStartGame: {} -> {}",
            self.instance.index, self.state, state
        ));
        self.run_state.set_phase(&state);
        self.state = state;
    }

    fn capture(&self) -> Result<ScreenCapture, CaptureError> {
        self.ctx
            .gateway
            .capture(self.instance.index, CapturePurpose::Menu, &self.cancel)
    }

    fn game_running(&self, capture: &ScreenCapture) -> bool {
        let cfg = &self.ctx.config;
        self.ctx
            .matcher
            .locate_for_instance(
                &capture.path,
                &cfg.auto_start.running_icon,
                cfg.matching.icon_threshold,
                self.instance.index,
            )
            .is_some()
    }

    /// Runs the attempt loop to completion and returns how it ended.
    pub fn run(mut self) -> AutoStartOutcome {
        self.report("Starting game...".to_string());
        self.transition(AutoStartState::Attempting);

        let interval = ms(self.ctx.config.auto_start.attempt_interval_ms);
        while self.attempt < self.attempts {
            if self.cancel.is_cancelled() {
                self.transition(AutoStartState::Cancelled);
                break;
            }
            self.run_state.set_attempt(self.attempt + 1);
            crate::log(&format!(
                "[Instance {}] Game start attempt {}/{}",
                self.instance.index,
                self.attempt + 1,
                self.attempts
            ));

            match self.step() {
                Step::Running => {
                    self.attempt += 1;
                    self.transition(AutoStartState::Done);
                    break;
                }
                Step::PopupClosed
                    if self.popups_closed <= self.ctx.config.auto_start.max_popup_closes => {}
                Step::PopupClosed | Step::Attempted => {
                    self.attempt += 1;
                    if self.attempt < self.attempts && !self.cancel.sleep(interval) {
                        self.transition(AutoStartState::Cancelled);
                        break;
                    }
                }
                Step::CaptureFailed => self.attempt += 1,
                Step::Cancelled => {
                    self.transition(AutoStartState::Cancelled);
                    break;
                }
            }
        }

        if self.state == AutoStartState::Attempting && self.cancel.is_cancelled() {
            self.transition(AutoStartState::Cancelled);
        }
        self.final_check();

        AutoStartOutcome {
            state: self.state,
            attempts_used: self.attempt,
            popups_closed: self.popups_closed,
            history: self.history,
        }
    }

    /// One attempt body. Capture failures and misses are reported through
    /// the instance status and never abort the loop.
    fn step(&mut self) -> Step {
        let n = self.attempt + 1;
        let total = self.attempts;
        let index = self.instance.index;
        let ctx = self.ctx;
        let cfg = &ctx.config;

        let capture = match self.capture() {
            Ok(c) => c,
            Err(CaptureError::Cancelled) => return Step::Cancelled,
            Err(e) => {
                crate::log(&format!("[Instance {}] {}", index, e));
                self.report(format!("[ERROR] Screenshot failed ({}/{})", n, total));
                if !self.cancel.sleep(ms(cfg.auto_start.screenshot_failure_delay_ms)) {
                    return Step::Cancelled;
                }
                return Step::CaptureFailed;
            }
        };

        if self.game_running(&capture) {
            self.report("Game already running".to_string());
            return Step::Running;
        }

        for icon in &cfg.auto_start.popup_icons {
            let Some(point) = ctx
                .matcher
                .locate_for_instance(&capture.path, icon, cfg.matching.icon_threshold, index)
                .and_then(|m| m.tap_point())
                .filter(|_| ctx.gateway.is_usable(&capture))
            else {
                continue;
            };
            if ctx.bridge.tap(index, point, &self.cancel) {
                self.popups_closed += 1;
                self.report(format!("Closed popup ({}/{})", n, total));
                if !self.cancel.sleep(ms(cfg.auto_start.popup_settle_ms)) {
                    return Step::Cancelled;
                }
                return Step::PopupClosed;
            }
        }

        if self.cancel.is_cancelled() {
            return Step::Cancelled;
        }

        let launcher = ctx
            .matcher
            .locate_for_instance(
                &capture.path,
                &cfg.auto_start.launcher_icon,
                cfg.matching.icon_threshold,
                index,
            )
            .and_then(|m| m.tap_point())
            .filter(|_| ctx.gateway.is_usable(&capture));
        match launcher {
            Some(point) if ctx.bridge.tap(index, point, &self.cancel) => {
                self.report(format!("Launched game ({}/{})", n, total));
            }
            Some(_) => self.report(format!("[ERROR] Click failed ({}/{})", n, total)),
            None => self.report(format!("[ERROR] Launcher not found ({}/{})", n, total)),
        }
        Step::Attempted
    }

    /// One last look at the screen. Only the reported status and the
    /// GivenUp/Done distinction depend on it.
    fn final_check(&mut self) {
        if self.cancel.is_cancelled() {
            return;
        }
        let confirmed = match self.capture() {
            Ok(capture) => self.game_running(&capture),
            Err(e) => {
                crate::log(&format!(
                    "[Instance {}] Final check capture failed: {}",
                    self.instance.index, e
                ));
                false
            }
        };

        if confirmed {
            self.report("Game running successfully".to_string());
            if self.state == AutoStartState::Attempting {
                self.transition(AutoStartState::Done);
            }
        } else if self.state == AutoStartState::Attempting {
            self.transition(AutoStartState::GivenUp);
        }
    }
}

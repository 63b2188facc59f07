//! GatherResources control loop.
//!
//! Each cycle opens the march panel, reads the queues and dispatches a
//! march to every idle one. Failures inside a cycle are reported and
//! followed by a cooldown; only cancellation ends the loop.

use anyhow::{Context, Result};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crate::automation::cancel::CancelToken;
use crate::automation::config::ms;
use crate::automation::instance::DeviceInstance;
use crate::automation::runner::{panic_message, ControllerRunState, TaskContext};
use crate::capture::CapturePurpose;
use crate::ocr::extract::{available_queues, plan_marches, MarchPlan, MarchSetting};
use crate::ocr::{MarchQueueRecord, QueueTally};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherState {
    SettingUp,
    Reading,
    Deciding,
    Dispatching,
    Waiting,
    Stopped,
}

impl fmt::Display for GatherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatherState::SettingUp => write!(f, "Setting up march view"),
            GatherState::Reading => write!(f, "Reading march queues"),
            GatherState::Deciding => write!(f, "Deciding"),
            GatherState::Dispatching => write!(f, "Dispatching marches"),
            GatherState::Waiting => write!(f, "Waiting"),
            GatherState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Totals of a finished gather session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatherOutcome {
    pub cycles: u32,
    pub dispatched: u32,
    pub failed_dispatches: u32,
    /// Cycles that ended in an error or panic
    pub errors: u32,
}

/// Sends a march out from one idle queue.
pub trait MarchDispatcher: Send + Sync {
    /// Returns `Ok(true)` when the march left.
    fn dispatch(&self, instance: u32, queue: &MarchQueueRecord, cancel: &CancelToken) -> Result<bool>;
}

/// Stand-in dispatcher: logs and waits as if a march were being set up.
pub struct PlaceholderDispatcher {
    delay: Duration,
}

impl PlaceholderDispatcher {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for PlaceholderDispatcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl MarchDispatcher for PlaceholderDispatcher {
    fn dispatch(&self, instance: u32, queue: &MarchQueueRecord, cancel: &CancelToken) -> Result<bool> {
        crate::log(&format!(
            "[Instance {}] Starting march on queue {} (placeholder)",
            instance, queue.queue_number
        ));
        Ok(cancel.sleep(self.delay))
    }
}

/// How a cycle ended, which decides the wait before the next one.
enum CycleEnd {
    /// Normal poll interval
    Poll,
    /// Something was missing; cool down and retry
    Retry,
    Cancelled,
}

enum Nav {
    Clicked,
    Missed,
    Cancelled,
}

pub struct GatherController<'a> {
    ctx: &'a TaskContext,
    instance: Arc<DeviceInstance>,
    dispatcher: Arc<dyn MarchDispatcher>,
    marches: Vec<MarchSetting>,
    cancel: CancelToken,
    run_state: Arc<ControllerRunState>,
    outcome: GatherOutcome,
}

impl<'a> GatherController<'a> {
    pub fn new(
        ctx: &'a TaskContext,
        instance: Arc<DeviceInstance>,
        dispatcher: Arc<dyn MarchDispatcher>,
        marches: Vec<MarchSetting>,
        cancel: CancelToken,
        run_state: Arc<ControllerRunState>,
    ) -> Self {
        Self {
            ctx,
            instance,
            dispatcher,
            marches,
            cancel,
            run_state,
            outcome: GatherOutcome::default(),
        }
    }

    fn phase(&self, state: GatherState) {
        self.run_state.set_phase(&state);
    }

    /// Loops until cancelled.
    pub fn run(mut self) -> GatherOutcome {
        let index = self.instance.index;
        self.instance.set_state("Starting resource gathering...");
        crate::log(&format!("[Instance {}] GatherResources started", index));

        let gather = &self.ctx.config.gather;
        let poll = ms(gather.poll_interval_ms);
        let cooldown = ms(gather.error_cooldown_ms);

        while !self.cancel.is_cancelled() {
            self.outcome.cycles += 1;
            self.run_state.set_attempt(self.outcome.cycles);

            let result = panic::catch_unwind(AssertUnwindSafe(|| self.cycle()));
            let wait = match result {
                Ok(Ok(CycleEnd::Poll)) => {
                    crate::log(&format!(
                        "[Instance {}] Waiting {}s before next check",
                        index,
                        poll.as_secs()
                    ));
                    poll
                }
                Ok(Ok(CycleEnd::Retry)) => cooldown,
                Ok(Ok(CycleEnd::Cancelled)) => break,
                Ok(Err(e)) => {
                    self.outcome.errors += 1;
                    self.instance.set_state(&format!("[ERROR] {:#}", e));
                    cooldown
                }
                Err(payload) => {
                    self.outcome.errors += 1;
                    self.instance
                        .set_state(&format!("[ERROR] {}", panic_message(payload.as_ref())));
                    cooldown
                }
            };

            self.phase(GatherState::Waiting);
            if !self.cancel.sleep(wait) {
                break;
            }
        }

        self.phase(GatherState::Stopped);
        crate::log(&format!(
            "[Instance {}] GatherResources stopped after {} cycles ({} dispatched)",
            index, self.outcome.cycles, self.outcome.dispatched
        ));
        self.outcome
    }

    fn cycle(&mut self) -> Result<CycleEnd> {
        let index = self.instance.index;
        let ctx = self.ctx;

        self.phase(GatherState::SettingUp);
        ctx.gateway
            .store()
            .ensure_dir()
            .context("Failed to create screenshots directory")?;
        match self.setup_march_view() {
            Nav::Clicked => {}
            Nav::Cancelled => return Ok(CycleEnd::Cancelled),
            Nav::Missed => {
                self.instance
                    .set_state("Failed to set up march view, retrying after cooldown");
                return Ok(CycleEnd::Retry);
            }
        }

        self.phase(GatherState::Reading);
        self.instance.set_state("Reading march queues...");
        let records = ctx.classifier.read_queues(index, &self.cancel);
        if self.cancel.is_cancelled() {
            return Ok(CycleEnd::Cancelled);
        }
        if records.is_empty() {
            self.instance
                .set_state("No march queues detected, retrying after cooldown");
            return Ok(CycleEnd::Retry);
        }

        self.phase(GatherState::Deciding);
        let available = available_queues(&records);
        for plan in plan_marches(&records, &self.marches) {
            log_plan(index, &plan, &self.marches);
        }

        if available.is_empty() {
            let tally = QueueTally::from_records(&records);
            self.instance
                .set_state(&format!("No available march queues ({})", tally));
            return Ok(CycleEnd::Poll);
        }

        self.phase(GatherState::Dispatching);
        self.instance.set_state(&format!(
            "Found {} available march queues",
            available.len()
        ));
        let delay = ms(ctx.config.gather.dispatch_delay_ms);
        for queue in &available {
            if self.cancel.is_cancelled() {
                return Ok(CycleEnd::Cancelled);
            }
            self.instance
                .set_state(&format!("Starting march on Queue {}", queue.queue_number));
            let result = self.dispatcher.dispatch(index, queue, &self.cancel);
            if self.cancel.is_cancelled() && !matches!(result, Ok(true)) {
                // Interrupted by a stop, not a failed march
                return Ok(CycleEnd::Cancelled);
            }
            match result {
                Ok(true) => {
                    self.outcome.dispatched += 1;
                    self.instance.set_state(&format!(
                        "Started march on Queue {}",
                        queue.queue_number
                    ));
                }
                Ok(false) => {
                    self.outcome.failed_dispatches += 1;
                    self.instance.set_state(&format!(
                        "Failed to start march on Queue {}",
                        queue.queue_number
                    ));
                }
                Err(e) => {
                    self.outcome.failed_dispatches += 1;
                    self.instance.set_state(&format!(
                        "Failed to start march on Queue {}: {:#}",
                        queue.queue_number, e
                    ));
                }
            }
            if !self.cancel.sleep(delay) {
                return Ok(CycleEnd::Cancelled);
            }
        }

        Ok(CycleEnd::Poll)
    }

    /// Opens the side panel, then the wilderness view. Each click retries
    /// on fresh captures; the pair is not retried.
    fn setup_march_view(&self) -> Nav {
        let cfg = &self.ctx.config.gather;
        crate::log(&format!(
            "[Instance {}] Setting up march view",
            self.instance.index
        ));
        match self.click_landmark(CapturePurpose::OpenLeft, &cfg.open_panel_icon, cfg.panel_settle_ms) {
            Nav::Clicked => {}
            other => return other,
        }
        self.click_landmark(
            CapturePurpose::Wilderness,
            &cfg.wilderness_icon,
            cfg.wilderness_settle_ms,
        )
    }

    fn click_landmark(&self, purpose: CapturePurpose, template: &str, settle_ms: u64) -> Nav {
        let ctx = self.ctx;
        let index = self.instance.index;
        let tries = ctx.config.gather.click_retries.max(1);
        let retry_delay = ms(ctx.config.gather.click_retry_delay_ms);

        for attempt in 1..=tries {
            if self.cancel.is_cancelled() {
                return Nav::Cancelled;
            }
            let point = match ctx.gateway.capture(index, purpose, &self.cancel) {
                Ok(capture) => ctx
                    .matcher
                    .locate_for_instance(
                        &capture.path,
                        template,
                        ctx.config.matching.landmark_threshold,
                        index,
                    )
                    .and_then(|m| m.tap_point())
                    .filter(|_| ctx.gateway.is_usable(&capture)),
                Err(e) => {
                    crate::log(&format!("[Instance {}] {}", index, e));
                    None
                }
            };

            if let Some(point) = point {
                if ctx.bridge.tap(index, point, &self.cancel) {
                    return if self.cancel.sleep(ms(settle_ms)) {
                        Nav::Clicked
                    } else {
                        Nav::Cancelled
                    };
                }
                crate::log(&format!("[Instance {}] Tap on {} failed", index, template));
            }

            crate::log(&format!(
                "[Instance {}] {} click attempt {}/{} missed",
                index, template, attempt, tries
            ));
            if attempt < tries && !self.cancel.sleep(retry_delay) {
                return Nav::Cancelled;
            }
        }
        Nav::Missed
    }
}

fn log_plan(index: u32, plan: &MarchPlan, marches: &[MarchSetting]) {
    let describe = |number: u32| {
        marches
            .iter()
            .find(|m| m.march_number == number)
            .map_or_else(|| format!("March {}", number), |m| m.to_string())
    };
    let line = match plan {
        MarchPlan::Active { march, queue } => {
            format!("{} is active on Queue {}", describe(*march), queue)
        }
        MarchPlan::Start { march, queue } => {
            format!("{} should start on Queue {}", describe(*march), queue)
        }
        MarchPlan::Waiting { march } => {
            format!("{} is waiting for an available queue", describe(*march))
        }
    };
    crate::log(&format!("[Instance {}] {}", index, line));
}

//! Task runner - spawns controller threads for device instances.
//!
//! Each activation runs on its own named thread. The instance's run flag is
//! claimed before the thread starts and released when it ends, however the
//! controller finishes.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::automation::cancel::CancelToken;
use crate::automation::config::BotConfig;
use crate::automation::detection::TemplateMatcher;
use crate::automation::gather::{GatherController, GatherOutcome, MarchDispatcher};
use crate::automation::instance::{DeviceInstance, RunFlag, RunGuard};
use crate::automation::state::{AutoStartController, AutoStartOutcome};
use crate::capture::{CaptureGateway, DeviceBridge, FrameStore};
use crate::ocr::extract::MarchSetting;
use crate::ocr::{KeywordScorer, OcrEngine, PanelClassifier};

/// Everything a controller needs, built once and shared by all runs.
pub struct TaskContext {
    pub config: BotConfig,
    pub bridge: Arc<dyn DeviceBridge>,
    pub gateway: Arc<CaptureGateway>,
    pub matcher: Arc<TemplateMatcher>,
    pub classifier: Arc<PanelClassifier>,
}

impl TaskContext {
    /// Builds the shared gateway, matcher and classifier from `config`.
    pub fn new(config: BotConfig, bridge: Arc<dyn DeviceBridge>, engine: Arc<dyn OcrEngine>) -> Self {
        let store = FrameStore::new(config.screenshots_dir());
        let gateway = Arc::new(CaptureGateway::new(
            Arc::clone(&bridge),
            store,
            config.capture.clone(),
        ));
        let matcher = Arc::new(TemplateMatcher::new(config.matching.template_dirs.clone()));
        let classifier = Arc::new(PanelClassifier::new(
            Arc::clone(&gateway),
            engine,
            Box::new(KeywordScorer::new(config.ocr.weights.clone())),
            config.ocr.clone(),
        ));
        Self {
            config,
            bridge,
            gateway,
            matcher,
            classifier,
        }
    }
}

/// Live progress of one controller run, readable from any thread.
#[derive(Debug, Default)]
pub struct ControllerRunState {
    attempt: AtomicU32,
    phase: Mutex<String>,
}

impl ControllerRunState {
    /// Current attempt slot (AutoStartGame) or cycle (GatherResources),
    /// 1-based. Zero before the first one starts.
    pub fn attempt_index(&self) -> u32 {
        self.attempt.load(Ordering::SeqCst)
    }

    /// Name of the state the controller is in.
    pub fn phase(&self) -> String {
        self.phase.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn set_attempt(&self, attempt: u32) {
        self.attempt.store(attempt, Ordering::SeqCst);
    }

    pub(crate) fn set_phase(&self, phase: &impl fmt::Display) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase.to_string();
    }
}

/// Owner's handle on a running controller.
pub struct TaskHandle<T> {
    instance: Arc<DeviceInstance>,
    cancel: CancelToken,
    run_state: Arc<ControllerRunState>,
    thread: JoinHandle<T>,
}

impl<T> TaskHandle<T> {
    /// Requests a stop. The controller exits at its next checkpoint; every
    /// wait wakes immediately.
    pub fn stop(&self) {
        crate::log(&format!(
            "[Instance {}] Stop requested for {}",
            self.instance.index,
            self.thread.thread().name().unwrap_or("task")
        ));
        self.cancel.cancel();
    }

    /// Whether the controller thread has returned.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Live progress, readable while the controller runs.
    pub fn run_state(&self) -> &Arc<ControllerRunState> {
        &self.run_state
    }

    /// Waits for the controller. `None` only if its thread panicked outside
    /// the controller's own recovery.
    pub fn join(self) -> Option<T> {
        self.thread.join().ok()
    }
}

pub type CompletionCallback = Box<dyn FnOnce(&AutoStartOutcome) + Send + 'static>;

/// Best-effort text of a caught panic.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Starts an AutoStartGame run on its own thread.
///
/// Returns `None` without side effects if one is already running on this
/// instance. `on_complete` runs on the worker after the run flag is cleared.
pub fn start_auto_start(
    ctx: Arc<TaskContext>,
    instance: Arc<DeviceInstance>,
    attempts: u32,
    on_complete: Option<CompletionCallback>,
) -> Option<TaskHandle<AutoStartOutcome>> {
    let Some(guard) = RunGuard::acquire(&instance, RunFlag::AutoStart) else {
        crate::log(&format!(
            "Auto start game already running for instance {}",
            instance.index
        ));
        return None;
    };

    let cancel = CancelToken::new();
    let run_state = Arc::new(ControllerRunState::default());
    let worker = {
        let instance = Arc::clone(&instance);
        let cancel = cancel.clone();
        let run_state = Arc::clone(&run_state);
        move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                AutoStartController::new(&ctx, Arc::clone(&instance), attempts, cancel, Arc::clone(&run_state))
                    .run()
            }));
            let outcome = result.unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                crate::log(&format!(
                    "[Instance {}] Error in auto start game loop: {}",
                    instance.index, message
                ));
                let outcome = AutoStartOutcome::failed(message);
                run_state.set_phase(&outcome.state);
                outcome
            });

            drop(guard);
            let follow_up = if instance.is_running(RunFlag::AutoGather) {
                "Gathering resources"
            } else {
                "Idle"
            };
            instance.set_state(follow_up);
            crate::log(&format!(
                "[Instance {}] Auto start game loop completed: {}",
                instance.index, outcome.state
            ));

            if let Some(callback) = on_complete {
                callback(&outcome);
            }
            outcome
        }
    };

    spawn_named(format!("GameStarter-{}", instance.index), worker).map(|thread| TaskHandle {
        instance,
        cancel,
        run_state,
        thread,
    })
}

/// Starts a GatherResources session on its own thread. Runs until stopped.
///
/// Returns `None` if a session is already running on this instance.
pub fn start_gather(
    ctx: Arc<TaskContext>,
    instance: Arc<DeviceInstance>,
    dispatcher: Arc<dyn MarchDispatcher>,
    marches: Vec<MarchSetting>,
) -> Option<TaskHandle<GatherOutcome>> {
    let Some(guard) = RunGuard::acquire(&instance, RunFlag::AutoGather) else {
        crate::log(&format!(
            "Auto gather already running for instance {}",
            instance.index
        ));
        return None;
    };

    let cancel = CancelToken::new();
    let run_state = Arc::new(ControllerRunState::default());
    let worker = {
        let instance = Arc::clone(&instance);
        let cancel = cancel.clone();
        let run_state = Arc::clone(&run_state);
        move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                GatherController::new(
                    &ctx,
                    Arc::clone(&instance),
                    dispatcher,
                    marches,
                    cancel,
                    Arc::clone(&run_state),
                )
                .run()
            }));
            let outcome = result.unwrap_or_else(|payload| {
                crate::log(&format!(
                    "[Instance {}] Error in gather resources loop: {}",
                    instance.index,
                    panic_message(payload.as_ref())
                ));
                GatherOutcome::default()
            });

            drop(guard);
            instance.set_state("Resource gathering stopped");
            outcome
        }
    };

    spawn_named(format!("Gatherer-{}", instance.index), worker).map(|thread| TaskHandle {
        instance,
        cancel,
        run_state,
        thread,
    })
}

/// Spawns a named worker. On failure the closure, and the run guard it
/// owns, are dropped.
fn spawn_named<T, F>(name: String, worker: F) -> Option<JoinHandle<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match thread::Builder::new().name(name.clone()).spawn(worker) {
        Ok(handle) => Some(handle),
        Err(e) => {
            crate::log(&format!("Failed to spawn {}: {}", name, e));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::gather::PlaceholderDispatcher;
    use crate::automation::state::AutoStartState;
    use crate::capture::screenshot::testing::{fast_capture_config, FakeBridge, Frame};
    use crate::ocr::engine::testing::FakeEngine;
    use crate::ocr::MarchQueueRecord;
    use image::{GrayImage, Luma};
    use std::path::{Path, PathBuf};
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    const ICON: u32 = 16;
    const TEMPLATES: &[&str] = &[
        "game_icon.png",
        "close_x.png",
        "game_launcher.png",
        "open_left.png",
        "wilderness_button.png",
    ];

    fn mix(mut z: u64) -> u64 {
        z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    fn noise(width: u32, height: u32, seed: u64) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            Luma([(mix(seed << 40 | (x as u64) << 20 | y as u64) >> 56) as u8])
        })
    }

    fn write_templates(root: &Path) {
        let dir = root.join("templates");
        std::fs::create_dir_all(&dir).unwrap();
        for (i, name) in TEMPLATES.iter().enumerate() {
            noise(ICON, ICON, i as u64 + 1).save(dir.join(name)).unwrap();
        }
    }

    /// Where `template` is pasted on a test screen.
    fn slot(template: &str) -> (u32, u32) {
        let i = TEMPLATES.iter().position(|t| *t == template).unwrap() as u32;
        (10 + i * 40, 20 + i * 25)
    }

    /// A noisy 240x180 screen showing the named templates.
    fn screen(root: &Path, name: &str, icons: &[&str]) -> PathBuf {
        let mut img = noise(240, 180, 1000);
        for icon in icons {
            let (x, y) = slot(icon);
            let tpl = image::open(root.join("templates").join(icon)).unwrap().to_luma8();
            image::imageops::replace(&mut img, &tpl, x as i64, y as i64);
        }
        let path = root.join(format!("{}.png", name));
        img.save(&path).unwrap();
        path
    }

    fn test_config(root: &Path) -> BotConfig {
        let mut config = BotConfig::default();
        config.screenshots_dir = Some(root.join("shots"));
        config.capture = fast_capture_config();
        config.matching.template_dirs = vec![root.join("templates")];
        config.auto_start.attempt_interval_ms = 5;
        config.auto_start.screenshot_failure_delay_ms = 1;
        config.auto_start.popup_settle_ms = 1;
        config.auto_start.popup_icons = vec!["close_x.png".to_string()];
        config.gather.poll_interval_ms = 5;
        config.gather.error_cooldown_ms = 5;
        config.gather.dispatch_delay_ms = 1;
        config.gather.click_retries = 2;
        config.gather.click_retry_delay_ms = 1;
        config.gather.panel_settle_ms = 1;
        config.gather.wilderness_settle_ms = 1;
        config
    }

    fn build(config: BotConfig, bridge: FakeBridge, transcripts: &[(&str, &str)]) -> (Arc<TaskContext>, Arc<FakeBridge>) {
        let bridge = Arc::new(bridge);
        let engine = Arc::new(FakeEngine::new(transcripts));
        let ctx = Arc::new(TaskContext::new(config, bridge.clone(), engine));
        (ctx, bridge)
    }

    fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
        let end = Instant::now() + timeout;
        while Instant::now() < end {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn center(template: &str) -> crate::automation::detection::Point {
        let (x, y) = slot(template);
        crate::automation::detection::Point {
            x: x + ICON / 2,
            y: y + ICON / 2,
        }
    }

    #[test]
    fn test_running_game_finishes_without_taps() {
        let dir = tempdir().unwrap();
        write_templates(dir.path());
        let running = screen(dir.path(), "running", &["game_icon.png"]);
        let (ctx, bridge) = build(test_config(dir.path()), FakeBridge::new(vec![Frame::File(running)]), &[]);
        let instance = DeviceInstance::new(0, "MEmu");

        let handle = start_auto_start(ctx, instance.clone(), 3, None).unwrap();
        let run_state = handle.run_state().clone();
        let outcome = handle.join().unwrap();

        assert_eq!(outcome.state, AutoStartState::Done);
        assert_eq!(outcome.attempts_used, 1);
        assert_eq!(run_state.attempt_index(), 1);
        assert_eq!(bridge.tap_count(), 0);
        assert!(outcome.history.iter().any(|s| s == "Game already running"));
        assert_eq!(outcome.final_status(), "Game running successfully");
        assert_eq!(instance.state(), "Idle");
        assert!(!instance.is_running(RunFlag::AutoStart));
    }

    #[test]
    fn test_screenshot_failures_consume_slots() {
        let dir = tempdir().unwrap();
        write_templates(dir.path());
        let bridge = FakeBridge::new(vec![Frame::Bytes(vec![7u8; 200])]);
        let (ctx, bridge) = build(test_config(dir.path()), bridge, &[]);
        let instance = DeviceInstance::new(1, "MEmu_1");

        let outcome = start_auto_start(ctx, instance.clone(), 2, None)
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(outcome.state, AutoStartState::GivenUp);
        assert_eq!(outcome.attempts_used, 2);
        assert!(outcome.history.contains(&"[ERROR] Screenshot failed (1/2)".to_string()));
        assert!(outcome.history.contains(&"[ERROR] Screenshot failed (2/2)".to_string()));
        // five tries per capture: two attempts plus the final check
        assert_eq!(bridge.capture_count(), 15);
        assert_eq!(bridge.tap_count(), 0);
        assert!(!instance.is_running(RunFlag::AutoStart));
    }

    #[test]
    fn test_popup_close_does_not_consume_attempt() {
        let dir = tempdir().unwrap();
        write_templates(dir.path());
        let popup = screen(dir.path(), "popup", &["close_x.png"]);
        let running = screen(dir.path(), "running", &["game_icon.png"]);
        let bridge = FakeBridge::new(vec![Frame::File(popup), Frame::File(running)]);
        let (ctx, bridge) = build(test_config(dir.path()), bridge, &[]);
        let instance = DeviceInstance::new(2, "MEmu_2");

        let outcome = start_auto_start(ctx, instance, 3, None).unwrap().join().unwrap();

        assert_eq!(outcome.state, AutoStartState::Done);
        assert_eq!(outcome.attempts_used, 1);
        assert_eq!(outcome.popups_closed, 1);
        assert!(outcome.history.contains(&"Closed popup (1/3)".to_string()));
        assert_eq!(*bridge.taps.lock().unwrap(), vec![(2, center("close_x.png"))]);
    }

    #[test]
    fn test_launcher_tapped_until_attempts_run_out() {
        let dir = tempdir().unwrap();
        write_templates(dir.path());
        let launcher = screen(dir.path(), "launcher", &["game_launcher.png"]);
        let (ctx, bridge) = build(test_config(dir.path()), FakeBridge::new(vec![Frame::File(launcher)]), &[]);
        let instance = DeviceInstance::new(0, "MEmu");

        let outcome = start_auto_start(ctx, instance, 2, None).unwrap().join().unwrap();

        assert_eq!(outcome.state, AutoStartState::GivenUp);
        assert_eq!(bridge.tap_count(), 2);
        assert_eq!(bridge.taps.lock().unwrap()[0].1, center("game_launcher.png"));
        assert!(outcome.history.contains(&"Launched game (2/2)".to_string()));
    }

    #[test]
    fn test_failed_tap_and_missing_launcher_are_reported() {
        let dir = tempdir().unwrap();
        write_templates(dir.path());
        let launcher = screen(dir.path(), "launcher", &["game_launcher.png"]);
        let blank = screen(dir.path(), "blank", &[]);
        let mut bridge = FakeBridge::new(vec![Frame::File(launcher), Frame::File(blank)]);
        bridge.tap_result = false;
        let (ctx, _bridge) = build(test_config(dir.path()), bridge, &[]);

        let outcome = start_auto_start(ctx, DeviceInstance::new(0, "MEmu"), 2, None)
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(
            &outcome.history[1..3],
            &[
                "[ERROR] Click failed (1/2)".to_string(),
                "[ERROR] Launcher not found (2/2)".to_string()
            ]
        );
    }

    #[test]
    fn test_stop_exits_promptly_and_clears_flag() {
        let dir = tempdir().unwrap();
        write_templates(dir.path());
        let launcher = screen(dir.path(), "launcher", &["game_launcher.png"]);
        let mut config = test_config(dir.path());
        config.auto_start.attempt_interval_ms = 10_000;
        let (ctx, bridge) = build(config, FakeBridge::new(vec![Frame::File(launcher)]), &[]);
        let instance = DeviceInstance::new(4, "MEmu_4");

        let handle = start_auto_start(ctx.clone(), instance.clone(), 10, None).unwrap();
        assert!(wait_until(Duration::from_secs(10), || bridge.tap_count() >= 1));

        let before = handle.run_state().attempt_index();
        assert_eq!(before, 1);

        // A second run on the same instance is refused and leaves the first alone
        assert!(start_auto_start(ctx, instance.clone(), 10, None).is_none());
        assert_eq!(handle.run_state().attempt_index(), before);
        assert_eq!(handle.run_state().phase(), "Attempting");
        assert!(!handle.is_finished());
        assert!(instance.is_running(RunFlag::AutoStart));

        let stopped_at = Instant::now();
        handle.stop();
        let outcome = handle.join().unwrap();
        assert!(stopped_at.elapsed() < Duration::from_secs(5));
        assert_eq!(outcome.state, AutoStartState::Cancelled);
        assert_eq!(bridge.tap_count(), 1);
        assert!(!instance.is_running(RunFlag::AutoStart));
        assert_eq!(instance.state(), "Idle");
    }

    #[test]
    fn test_on_complete_sees_outcome_after_flag_cleared() {
        let dir = tempdir().unwrap();
        write_templates(dir.path());
        let running = screen(dir.path(), "running", &["game_icon.png"]);
        let (ctx, _bridge) = build(test_config(dir.path()), FakeBridge::new(vec![Frame::File(running)]), &[]);
        let instance = DeviceInstance::new(0, "MEmu");

        let seen = Arc::new(Mutex::new(None));
        let callback: CompletionCallback = {
            let seen = seen.clone();
            let instance = instance.clone();
            Box::new(move |outcome: &AutoStartOutcome| {
                *seen.lock().unwrap() = Some((outcome.state.clone(), instance.is_running(RunFlag::AutoStart)));
            })
        };
        start_auto_start(ctx, instance, 1, Some(callback)).unwrap().join().unwrap();

        assert_eq!(*seen.lock().unwrap(), Some((AutoStartState::Done, false)));
    }

    struct Recording {
        queues: Mutex<Vec<u32>>,
        panic: bool,
    }

    impl MarchDispatcher for Recording {
        fn dispatch(&self, _instance: u32, queue: &MarchQueueRecord, _cancel: &CancelToken) -> anyhow::Result<bool> {
            if self.panic {
                panic!("dispatch exploded");
            }
            self.queues.lock().unwrap().push(queue.queue_number);
            Ok(true)
        }
    }

    fn gather_frames(root: &Path) -> Vec<Frame> {
        vec![
            Frame::File(screen(root, "map", &["open_left.png"])),
            Frame::File(screen(root, "panel", &["wilderness_button.png"])),
            Frame::File(screen(root, "queues", &[])),
        ]
    }

    const QUEUES: &str = "March Queue 1\nIdle\nMarch Queue 2\nIdle\nMarch Queue 3\nGathering lv3 mill";

    #[test]
    fn test_gather_dispatches_to_idle_queues() {
        let dir = tempdir().unwrap();
        write_templates(dir.path());
        let bridge = FakeBridge::new(gather_frames(dir.path()));
        let (ctx, bridge) = build(test_config(dir.path()), bridge, &[("psm6-lstm", QUEUES)]);
        let instance = DeviceInstance::new(5, "MEmu_5");
        let dispatcher = Arc::new(Recording {
            queues: Mutex::new(Vec::new()),
            panic: false,
        });

        let handle = start_gather(ctx.clone(), instance.clone(), dispatcher.clone(), Vec::new()).unwrap();
        assert!(wait_until(Duration::from_secs(10), || dispatcher.queues.lock().unwrap().len() >= 2));
        assert!(start_gather(ctx, instance.clone(), dispatcher.clone(), Vec::new()).is_none());
        handle.stop();
        let outcome = handle.join().unwrap();

        assert_eq!(*dispatcher.queues.lock().unwrap(), vec![1, 2]);
        assert_eq!(outcome.dispatched, 2);
        let taps = bridge.taps.lock().unwrap().clone();
        assert_eq!(
            &taps[..2],
            &[(5, center("open_left.png")), (5, center("wilderness_button.png"))]
        );
        assert_eq!(instance.state(), "Resource gathering stopped");
        assert!(!instance.is_running(RunFlag::AutoGather));
    }

    #[test]
    fn test_gather_without_idle_queues_reports_tally_and_polls() {
        let dir = tempdir().unwrap();
        write_templates(dir.path());
        let mut config = test_config(dir.path());
        config.gather.poll_interval_ms = 10_000;
        let bridge = FakeBridge::new(gather_frames(dir.path()));
        let busy = "March Queue 1\nUnlock\nMarch Queue 2\nGathering lv1 mill";
        let (ctx, _bridge) = build(config, bridge, &[("psm6-lstm", busy)]);
        let instance = DeviceInstance::new(10, "MEmu_10");
        let dispatcher = Arc::new(Recording {
            queues: Mutex::new(Vec::new()),
            panic: false,
        });

        let handle = start_gather(ctx, instance.clone(), dispatcher.clone(), Vec::new()).unwrap();
        assert!(wait_until(Duration::from_secs(10), || {
            instance.state() == "No available march queues (1 Unlock, 1 Gathering)"
                && handle.run_state().phase() == "Waiting"
        }));
        // Still inside the poll wait of the first cycle
        assert_eq!(handle.run_state().attempt_index(), 1);

        handle.stop();
        let outcome = handle.join().unwrap();
        assert_eq!(outcome.cycles, 1);
        assert_eq!(outcome.dispatched, 0);
        assert_eq!(outcome.errors, 0);
        assert!(dispatcher.queues.lock().unwrap().is_empty());
    }

    #[test]
    fn test_stop_during_dispatch_is_not_a_failed_march() {
        let dir = tempdir().unwrap();
        write_templates(dir.path());
        let bridge = FakeBridge::new(gather_frames(dir.path()));
        let (ctx, _bridge) = build(test_config(dir.path()), bridge, &[("psm6-lstm", QUEUES)]);
        let instance = DeviceInstance::new(11, "MEmu_11");
        let slow = Arc::new(PlaceholderDispatcher::new(Duration::from_secs(10)));

        let handle = start_gather(ctx, instance.clone(), slow, Vec::new()).unwrap();
        assert!(wait_until(Duration::from_secs(10), || {
            instance.state() == "Starting march on Queue 1"
        }));
        handle.stop();
        let outcome = handle.join().unwrap();

        assert_eq!(outcome.dispatched, 0);
        assert_eq!(outcome.failed_dispatches, 0);
        assert_eq!(instance.state(), "Resource gathering stopped");
    }

    #[test]
    fn test_gather_keeps_retrying_when_panel_missing() {
        let dir = tempdir().unwrap();
        write_templates(dir.path());
        let blank = screen(dir.path(), "blank", &[]);
        let (ctx, bridge) = build(test_config(dir.path()), FakeBridge::new(vec![Frame::File(blank)]), &[]);
        let instance = DeviceInstance::new(6, "MEmu_6");

        let handle = start_gather(ctx, instance.clone(), Arc::new(PlaceholderDispatcher::default()), Vec::new())
            .unwrap();
        let run_state = handle.run_state().clone();
        assert!(wait_until(Duration::from_secs(10), || run_state.attempt_index() >= 3));
        handle.stop();
        let outcome = handle.join().unwrap();

        assert!(outcome.cycles >= 3);
        assert_eq!(outcome.dispatched, 0);
        assert_eq!(outcome.errors, 0);
        assert_eq!(bridge.tap_count(), 0);
        assert!(!instance.is_running(RunFlag::AutoGather));
    }

    #[test]
    fn test_gather_survives_panicking_cycle() {
        let dir = tempdir().unwrap();
        write_templates(dir.path());
        let bridge = FakeBridge::new(gather_frames(dir.path()));
        let (ctx, _bridge) = build(test_config(dir.path()), bridge, &[("psm6-lstm", QUEUES)]);
        let instance = DeviceInstance::new(7, "MEmu_7");
        let dispatcher = Arc::new(Recording {
            queues: Mutex::new(Vec::new()),
            panic: true,
        });

        let handle = start_gather(ctx, instance.clone(), dispatcher, Vec::new()).unwrap();
        let run_state = handle.run_state().clone();
        assert!(wait_until(Duration::from_secs(10), || run_state.attempt_index() >= 2));
        handle.stop();
        let outcome = handle.join().unwrap();

        assert_eq!(outcome.errors, 1);
        assert!(!instance.is_running(RunFlag::AutoGather));
    }

    #[test]
    fn test_auto_start_and_gather_flags_are_independent() {
        let dir = tempdir().unwrap();
        write_templates(dir.path());
        let blank = screen(dir.path(), "blank", &[]);
        let mut config = test_config(dir.path());
        config.auto_start.attempt_interval_ms = 10_000;
        let (ctx, _bridge) = build(config, FakeBridge::new(vec![Frame::File(blank)]), &[]);
        let instance = DeviceInstance::new(8, "MEmu_8");

        let starter = start_auto_start(ctx.clone(), instance.clone(), 5, None).unwrap();
        let gatherer = start_gather(ctx, instance.clone(), Arc::new(PlaceholderDispatcher::default()), Vec::new())
            .unwrap();
        assert!(instance.is_running(RunFlag::AutoStart));
        assert!(instance.is_running(RunFlag::AutoGather));

        starter.stop();
        starter.join().unwrap();
        assert!(!instance.is_running(RunFlag::AutoStart));
        assert!(instance.is_running(RunFlag::AutoGather));

        gatherer.stop();
        gatherer.join().unwrap();
        assert!(!instance.is_running(RunFlag::AutoGather));
    }

    #[test]
    fn test_finalizer_reports_gathering_when_gather_holds_instance() {
        let dir = tempdir().unwrap();
        write_templates(dir.path());
        let running = screen(dir.path(), "running", &["game_icon.png"]);
        let (ctx, _bridge) = build(test_config(dir.path()), FakeBridge::new(vec![Frame::File(running)]), &[]);
        let instance = DeviceInstance::new(9, "MEmu_9");
        let _gather = RunGuard::acquire(&instance, RunFlag::AutoGather).unwrap();

        start_auto_start(ctx, instance.clone(), 2, None).unwrap().join().unwrap();

        assert_eq!(instance.state(), "Gathering resources");
    }

    #[test]
    fn test_panic_message_extracts_text() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(3u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}

//! Device instances and their per-task run flags.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::log;

/// Emulator power state as last reported by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Stopped,
    Running,
    Unknown,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Stopped => write!(f, "Stopped"),
            InstanceStatus::Running => write!(f, "Running"),
            InstanceStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// One emulator instance, shared between controllers and whatever
/// displays its status.
#[derive(Debug)]
pub struct DeviceInstance {
    pub index: u32,
    name: String,
    status: Mutex<InstanceStatus>,
    state: Mutex<String>,
    auto_start_running: AtomicBool,
    auto_gather_running: AtomicBool,
}

impl DeviceInstance {
    /// Status unknown, state "Idle", no run flags set.
    pub fn new(index: u32, name: &str) -> Arc<Self> {
        Arc::new(Self {
            index,
            name: name.to_string(),
            status: Mutex::new(InstanceStatus::Unknown),
            state: Mutex::new("Idle".to_string()),
            auto_start_running: AtomicBool::new(false),
            auto_gather_running: AtomicBool::new(false),
        })
    }

    /// Display name as the emulator reports it ("MEmu", "MEmu_1", ...).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last power state recorded for the instance.
    pub fn status(&self) -> InstanceStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records the power state reported by the bridge.
    pub fn set_status(&self, status: InstanceStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Human-readable activity line.
    pub fn state(&self) -> String {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replaces the activity line, logging it when it changes.
    pub fn set_state(&self, state: &str) {
        let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *current != state {
            log(&format!("[Instance {}] {}", self.index, state));
            *current = state.to_string();
        }
    }

    fn flag(&self, flag: RunFlag) -> &AtomicBool {
        match flag {
            RunFlag::AutoStart => &self.auto_start_running,
            RunFlag::AutoGather => &self.auto_gather_running,
        }
    }

    /// Whether a controller currently holds `flag`.
    pub fn is_running(&self, flag: RunFlag) -> bool {
        self.flag(flag).load(Ordering::SeqCst)
    }
}

/// Which controller kind holds the instance. The two flags are independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunFlag {
    AutoStart,
    AutoGather,
}

impl fmt::Display for RunFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunFlag::AutoStart => write!(f, "auto start game"),
            RunFlag::AutoGather => write!(f, "auto gather"),
        }
    }
}

/// Exclusive claim on one run flag. Dropping it clears the flag, however
/// the owning controller ends.
#[derive(Debug)]
pub struct RunGuard {
    instance: Arc<DeviceInstance>,
    flag: RunFlag,
}

impl RunGuard {
    /// Claims `flag` on `instance`, or `None` if another run holds it.
    pub fn acquire(instance: &Arc<DeviceInstance>, flag: RunFlag) -> Option<Self> {
        instance
            .flag(flag)
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        Some(Self {
            instance: Arc::clone(instance),
            flag,
        })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.instance.flag(self.flag).store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_guard_is_exclusive_per_flag() {
        let instance = DeviceInstance::new(0, "MEmu");
        let guard = RunGuard::acquire(&instance, RunFlag::AutoStart);
        assert!(guard.is_some());
        assert!(RunGuard::acquire(&instance, RunFlag::AutoStart).is_none());
        assert!(instance.is_running(RunFlag::AutoStart));

        // Gathering is tracked separately
        let gather = RunGuard::acquire(&instance, RunFlag::AutoGather);
        assert!(gather.is_some());

        drop(guard);
        assert!(!instance.is_running(RunFlag::AutoStart));
        assert!(instance.is_running(RunFlag::AutoGather));
        assert!(RunGuard::acquire(&instance, RunFlag::AutoStart).is_some());
    }

    #[test]
    fn test_concurrent_acquire_has_one_winner() {
        let instance = DeviceInstance::new(3, "MEmu_3");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let instance = instance.clone();
                thread::spawn(move || RunGuard::acquire(&instance, RunFlag::AutoGather))
            })
            .collect();
        // Guards travel back through join, so none is released early
        let guards: Vec<Option<RunGuard>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = guards.iter().filter(|g| g.is_some()).count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_guard_cleared_on_panic() {
        let instance = DeviceInstance::new(1, "MEmu_1");
        let inner = instance.clone();
        let result = thread::spawn(move || {
            let _guard = RunGuard::acquire(&inner, RunFlag::AutoStart).unwrap();
            panic!("controller blew up");
        })
        .join();
        assert!(result.is_err());
        assert!(!instance.is_running(RunFlag::AutoStart));
    }

    #[test]
    fn test_state_is_shared() {
        let instance = DeviceInstance::new(2, "MEmu_2");
        assert_eq!(instance.state(), "Idle");
        instance.set_state("Gathering resources");
        assert_eq!(instance.state(), "Gathering resources");
        assert_eq!(instance.status(), InstanceStatus::Unknown);
        assert_eq!(instance.name(), "MEmu_2");
        instance.set_status(InstanceStatus::Running);
        assert_eq!(instance.status(), InstanceStatus::Running);
    }
}

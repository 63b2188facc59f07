//! Per-instance module settings.
//!
//! The store is owned by the host and handed to whatever starts
//! controllers; nothing here is process-global.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::RwLock;

use crate::ocr::extract::{default_march_settings, MarchSetting};

/// The automation modules an instance can enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModuleKind {
    AutoStartGame,
    GatherResources,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleKind::AutoStartGame => write!(f, "Auto Start Game"),
            ModuleKind::GatherResources => write!(f, "Auto Gather Resources"),
        }
    }
}

/// Settings payload, tagged by module kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "module")]
pub enum ModuleSettings {
    AutoStartGame { attempts: u32 },
    GatherResources { marches: Vec<MarchSetting> },
}

impl ModuleSettings {
    /// The module these settings belong to.
    pub fn kind(&self) -> ModuleKind {
        match self {
            ModuleSettings::AutoStartGame { .. } => ModuleKind::AutoStartGame,
            ModuleSettings::GatherResources { .. } => ModuleKind::GatherResources,
        }
    }

    /// Settings a freshly enabled module starts with.
    pub fn default_for(kind: ModuleKind) -> Self {
        match kind {
            ModuleKind::AutoStartGame => ModuleSettings::AutoStartGame { attempts: 10 },
            ModuleKind::GatherResources => ModuleSettings::GatherResources {
                marches: default_march_settings(),
            },
        }
    }
}

/// Whether a module is on, and what it runs with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleState {
    pub enabled: bool,
    pub settings: ModuleSettings,
}

type InstanceModules = BTreeMap<ModuleKind, ModuleState>;

/// Thread-safe map of instance index to its module states.
#[derive(Debug, Default)]
pub struct ModuleStore {
    modules: RwLock<BTreeMap<u32, InstanceModules>>,
}

impl ModuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the module's state, if the instance has it.
    pub fn get(&self, instance: u32, kind: ModuleKind) -> Option<ModuleState> {
        let modules = self.modules.read().unwrap_or_else(|e| e.into_inner());
        modules.get(&instance)?.get(&kind).cloned()
    }

    /// Stores `state` under the kind its settings belong to.
    pub fn set(&self, instance: u32, state: ModuleState) {
        let mut modules = self.modules.write().unwrap_or_else(|e| e.into_inner());
        modules
            .entry(instance)
            .or_default()
            .insert(state.settings.kind(), state);
    }

    /// Turns a module on or off, creating it with default settings first
    /// if needed.
    pub fn set_enabled(&self, instance: u32, kind: ModuleKind, enabled: bool) {
        let mut modules = self.modules.write().unwrap_or_else(|e| e.into_inner());
        modules
            .entry(instance)
            .or_default()
            .entry(kind)
            .or_insert_with(|| ModuleState {
                enabled,
                settings: ModuleSettings::default_for(kind),
            })
            .enabled = enabled;
    }

    /// Turns a module on or off as [`set_enabled`](Self::set_enabled) does.
    /// `attempts` replaces the auto start attempt count and is ignored for
    /// other modules.
    pub fn configure(&self, instance: u32, kind: ModuleKind, enabled: bool, attempts: Option<u32>) {
        self.set_enabled(instance, kind, enabled);
        if let (ModuleKind::AutoStartGame, Some(attempts)) = (kind, attempts) {
            self.set(
                instance,
                ModuleState {
                    enabled,
                    settings: ModuleSettings::AutoStartGame { attempts },
                },
            );
        }
    }

    /// `false` for modules that were never configured.
    pub fn is_enabled(&self, instance: u32, kind: ModuleKind) -> bool {
        self.get(instance, kind).is_some_and(|s| s.enabled)
    }

    /// Instances with `kind` enabled, in index order.
    pub fn enabled_instances(&self, kind: ModuleKind) -> Vec<u32> {
        let modules = self.modules.read().unwrap_or_else(|e| e.into_inner());
        modules
            .iter()
            .filter(|(_, m)| m.get(&kind).is_some_and(|s| s.enabled))
            .map(|(index, _)| *index)
            .collect()
    }

    /// Pretty JSON keyed by instance index, then module kind.
    pub fn to_json(&self) -> Result<String> {
        let modules = self.modules.read().unwrap_or_else(|e| e.into_inner());
        Ok(serde_json::to_string_pretty(&*modules)?)
    }

    /// Reads what [`to_json`](Self::to_json) writes.
    pub fn from_json(json: &str) -> Result<Self> {
        let modules: BTreeMap<u32, InstanceModules> =
            serde_json::from_str(json).context("Failed to parse module settings")?;
        Ok(Self {
            modules: RwLock::new(modules),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_are_tagged() {
        let json = serde_json::to_string(&ModuleSettings::AutoStartGame { attempts: 4 }).unwrap();
        assert_eq!(json, r#"{"module":"AutoStartGame","attempts":4}"#);
    }

    #[test]
    fn test_set_and_get() {
        let store = ModuleStore::new();
        assert!(!store.is_enabled(0, ModuleKind::AutoStartGame));

        store.set(
            0,
            ModuleState {
                enabled: true,
                settings: ModuleSettings::AutoStartGame { attempts: 3 },
            },
        );
        assert!(store.is_enabled(0, ModuleKind::AutoStartGame));
        assert!(!store.is_enabled(0, ModuleKind::GatherResources));
        assert_eq!(
            store.get(0, ModuleKind::AutoStartGame).unwrap().settings,
            ModuleSettings::AutoStartGame { attempts: 3 }
        );
    }

    #[test]
    fn test_set_enabled_creates_defaults() {
        let store = ModuleStore::new();
        store.set_enabled(2, ModuleKind::GatherResources, true);
        store.set_enabled(5, ModuleKind::GatherResources, false);
        store.set_enabled(1, ModuleKind::GatherResources, true);

        assert_eq!(store.enabled_instances(ModuleKind::GatherResources), vec![1, 2]);
        let state = store.get(5, ModuleKind::GatherResources).unwrap();
        assert!(!state.enabled);
        assert_eq!(
            state.settings,
            ModuleSettings::GatherResources {
                marches: default_march_settings()
            }
        );
    }

    #[test]
    fn test_configure_overrides_attempts_only_for_auto_start() {
        let store = ModuleStore::new();
        store.configure(3, ModuleKind::AutoStartGame, true, Some(25));
        store.configure(3, ModuleKind::GatherResources, true, Some(25));
        store.configure(4, ModuleKind::AutoStartGame, false, None);

        assert_eq!(
            store.get(3, ModuleKind::AutoStartGame).unwrap().settings,
            ModuleSettings::AutoStartGame { attempts: 25 }
        );
        assert_eq!(
            store.get(3, ModuleKind::GatherResources).unwrap().settings,
            ModuleSettings::default_for(ModuleKind::GatherResources)
        );
        let off = store.get(4, ModuleKind::AutoStartGame).unwrap();
        assert!(!off.enabled);
        assert_eq!(off.settings.kind(), ModuleKind::AutoStartGame);
        assert_eq!(store.enabled_instances(ModuleKind::AutoStartGame), vec![3]);
    }

    #[test]
    fn test_json_round_trip() {
        let store = ModuleStore::new();
        store.set_enabled(0, ModuleKind::AutoStartGame, true);
        store.set_enabled(0, ModuleKind::GatherResources, false);

        let restored = ModuleStore::from_json(&store.to_json().unwrap()).unwrap();
        assert_eq!(
            restored.get(0, ModuleKind::GatherResources),
            store.get(0, ModuleKind::GatherResources)
        );
        assert!(restored.is_enabled(0, ModuleKind::AutoStartGame));
    }

    #[test]
    fn test_from_json_rejects_unknown_module() {
        let json = r#"{"0":{"AutoStartGame":{"enabled":true,"settings":{"module":"Teleport"}}}}"#;
        assert!(ModuleStore::from_json(json).is_err());
    }
}

//! March Bot
//!
//! Drives Android emulator instances through their bridge: keeps the game
//! running on each instance and sends idle march queues out to gather.

mod automation;
mod capture;
mod ocr;
mod paths;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use automation::{
    load_config, start_auto_start, start_gather, BotConfig, CancelToken, DeviceInstance,
    InstanceStatus, ModuleKind, ModuleSettings, ModuleStore, PlaceholderDispatcher, TaskContext,
    TaskHandle,
};
use capture::MemucBridge;
use ocr::extract::default_march_settings;
use ocr::{QueueStatus, QueueTally, TesseractEngine};

/// Logs a message to both console and log file with timestamp.
pub fn log(msg: &str) {
    let timestamp = Local::now().format("%H:%M:%S%.3f");
    let line = format!("[{}] {}\n", timestamp, msg);
    print!("{}", line);
    let log_path = paths::get_logs_dir().join("march_bot.log");
    if let Ok(mut file) = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        let _ = file.write_all(line.as_bytes());
    }
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (defaults to config.json next to the binary)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the game on one instance and wait for the result
    AutoStart {
        index: u32,
        /// Attempt slots before giving up
        #[arg(short, long)]
        attempts: Option<u32>,
    },
    /// Gather resources on one instance until Enter is pressed
    Gather { index: u32 },
    /// Capture the march panel once and print the queues
    ReadQueues { index: u32 },
    /// Match a template against an existing screenshot
    Locate {
        capture: PathBuf,
        template: String,
        #[arg(short, long)]
        threshold: Option<f64>,
    },
    /// Run every OCR variant over an existing screenshot
    Classify {
        screenshot: PathBuf,
        /// Instance whose artifact names the crops are written under
        #[arg(short, long, default_value_t = 0)]
        instance: u32,
    },
    /// Start every enabled module from a module settings file until Enter
    /// is pressed
    RunModules { settings: PathBuf },
    /// Enable or disable one module for an instance in a settings file
    Module {
        settings: PathBuf,
        index: u32,
        #[arg(value_enum)]
        module: ModuleArg,
        #[arg(long)]
        disable: bool,
        /// Attempt slots for auto start
        #[arg(short, long)]
        attempts: Option<u32>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModuleArg {
    AutoStart,
    Gather,
}

impl From<ModuleArg> for ModuleKind {
    fn from(arg: ModuleArg) -> Self {
        match arg {
            ModuleArg::AutoStart => ModuleKind::AutoStartGame,
            ModuleArg::Gather => ModuleKind::GatherResources,
        }
    }
}

fn main() -> Result<()> {
    std::panic::set_hook(Box::new(|panic_info| {
        let msg = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };
        let location = panic_info
            .location()
            .map(|loc| format!(" at {}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_default();
        let thread = std::thread::current();
        log(&format!(
            "[PANIC] in {}{} {}",
            thread.name().unwrap_or("unnamed"),
            location,
            msg
        ));
    }));

    let args = Args::parse();

    paths::ensure_directories()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(automation::config::default_config_path);
    let config = load_config(&config_path);

    let ctx = Arc::new(build_context(config));
    // Logs its own summary
    ctx.gateway.store().cleanup_corrupted();
    match args.command {
        Commands::AutoStart { index, attempts } => auto_start(ctx, index, attempts),
        Commands::Gather { index } => gather(ctx, index),
        Commands::ReadQueues { index } => read_queues(&ctx, index),
        Commands::Locate {
            capture,
            template,
            threshold,
        } => locate(&ctx, &capture, &template, threshold),
        Commands::Classify {
            screenshot,
            instance,
        } => classify(&ctx, &screenshot, instance),
        Commands::RunModules { settings } => run_modules(ctx, &settings),
        Commands::Module {
            settings,
            index,
            module,
            disable,
            attempts,
        } => edit_module(&settings, index, module.into(), !disable, attempts),
    }
}

fn build_context(config: BotConfig) -> TaskContext {
    let bridge = Arc::new(MemucBridge::new(config.bridge.clone()));
    let engine = Arc::new(TesseractEngine::new(config.ocr.clone()));
    TaskContext::new(config, bridge, engine)
}

fn instance_for(ctx: &TaskContext, index: u32) -> Arc<DeviceInstance> {
    let name = if index == 0 {
        "MEmu".to_string()
    } else {
        format!("MEmu_{}", index)
    };
    let instance = DeviceInstance::new(index, &name);
    let status = if ctx.bridge.is_running(index, &CancelToken::new()) {
        InstanceStatus::Running
    } else {
        InstanceStatus::Stopped
    };
    instance.set_status(status);
    log(&format!(
        "Instance {} ({}): {}",
        index,
        instance.name(),
        instance.status()
    ));
    instance
}

fn wait_for_enter() {
    log("Press Enter to stop");
    let mut line = String::new();
    let _ = std::io::stdin().read_line(&mut line);
}

fn auto_start(ctx: Arc<TaskContext>, index: u32, attempts: Option<u32>) -> Result<()> {
    let attempts = attempts.unwrap_or(ctx.config.auto_start.attempts);
    let instance = instance_for(&ctx, index);
    let handle = start_auto_start(ctx, Arc::clone(&instance), attempts, None)
        .context("Auto start game is already running")?;
    let outcome = handle
        .join()
        .context("Auto start game thread panicked")?;

    log(&format!(
        "Auto start finished: {} after {} attempts ({} popups closed)",
        outcome.state, outcome.attempts_used, outcome.popups_closed
    ));
    log(&format!("Last status: {}", outcome.final_status()));
    log(&format!("Instance {} is now: {}", index, instance.state()));
    Ok(())
}

fn gather(ctx: Arc<TaskContext>, index: u32) -> Result<()> {
    let instance = instance_for(&ctx, index);
    let handle = start_gather(
        ctx,
        Arc::clone(&instance),
        Arc::new(PlaceholderDispatcher::default()),
        default_march_settings(),
    )
    .context("Resource gathering is already running")?;

    wait_for_enter();
    let run = Arc::clone(handle.run_state());
    log(&format!(
        "Stopping during cycle {} ({})",
        run.attempt_index(),
        run.phase()
    ));
    handle.stop();
    if let Some(outcome) = handle.join() {
        log(&format!(
            "Gathering stopped: {} cycles, {} dispatched, {} failed, {} errors",
            outcome.cycles, outcome.dispatched, outcome.failed_dispatches, outcome.errors
        ));
    }
    log(&format!("Instance {} is now: {}", index, instance.state()));
    Ok(())
}

fn read_queues(ctx: &TaskContext, index: u32) -> Result<()> {
    let records = ctx.classifier.read_queues(index, &CancelToken::new());
    if records.is_empty() {
        log("No march queues detected");
    }
    for record in &records {
        println!("{}", record);
    }
    let tally = QueueTally::from_records(&records);
    println!("{}", tally);
    println!(
        "{} of {} queues idle",
        tally.count(QueueStatus::Idle),
        tally.total()
    );
    Ok(())
}

fn locate(ctx: &TaskContext, capture: &Path, template: &str, threshold: Option<f64>) -> Result<()> {
    let threshold = threshold.unwrap_or(ctx.config.matching.icon_threshold);
    match ctx.matcher.locate(capture, template, threshold) {
        Some(point) => println!("{}: top-left at ({}, {})", template, point.x, point.y),
        None => println!("{}: not found at threshold {}", template, threshold),
    }
    Ok(())
}

fn classify(ctx: &TaskContext, screenshot: &Path, instance: u32) -> Result<()> {
    let reading = ctx
        .classifier
        .classify_panel(instance, screenshot, &CancelToken::new())?;

    for attempt in &reading.attempts {
        println!("--- {} (score {}) ---", attempt.variant, attempt.score);
        println!("{}", attempt.transcript.trim());
    }
    match &reading.best {
        Some(best) => {
            println!("Best variant: {}", best.variant);
            println!("{}", reading.transcript().trim());
        }
        None => println!("No variant produced a usable transcript"),
    }
    for record in &reading.records {
        println!("{}", record);
    }
    println!("Artifacts in {}", ctx.gateway.store().root().display());
    Ok(())
}

fn run_modules(ctx: Arc<TaskContext>, settings: &Path) -> Result<()> {
    let json = std::fs::read_to_string(settings)
        .with_context(|| format!("Failed to read {}", settings.display()))?;
    let store = ModuleStore::from_json(&json)?;

    // Both modules on one instance must share its run flags and status
    let mut instances: BTreeMap<u32, Arc<DeviceInstance>> = BTreeMap::new();
    let mut starters: Vec<TaskHandle<automation::AutoStartOutcome>> = Vec::new();
    let mut gatherers: Vec<TaskHandle<automation::GatherOutcome>> = Vec::new();

    for index in store.enabled_instances(ModuleKind::AutoStartGame) {
        let Some(state) = store.get(index, ModuleKind::AutoStartGame) else {
            continue;
        };
        let ModuleSettings::AutoStartGame { attempts } = state.settings else {
            continue;
        };
        log(&format!("Starting {} on instance {}", ModuleKind::AutoStartGame, index));
        let instance = Arc::clone(instances.entry(index).or_insert_with(|| instance_for(&ctx, index)));
        starters.extend(start_auto_start(Arc::clone(&ctx), instance, attempts, None));
    }

    for index in store.enabled_instances(ModuleKind::GatherResources) {
        let Some(state) = store.get(index, ModuleKind::GatherResources) else {
            continue;
        };
        let ModuleSettings::GatherResources { marches } = state.settings else {
            continue;
        };
        log(&format!("Starting {} on instance {}", ModuleKind::GatherResources, index));
        let instance = Arc::clone(instances.entry(index).or_insert_with(|| instance_for(&ctx, index)));
        gatherers.extend(start_gather(
            Arc::clone(&ctx),
            instance,
            Arc::new(PlaceholderDispatcher::default()),
            marches,
        ));
    }

    if starters.is_empty() && gatherers.is_empty() {
        log("No modules enabled");
        return Ok(());
    }

    wait_for_enter();
    let finished = starters.iter().filter(|h| h.is_finished()).count()
        + gatherers.iter().filter(|h| h.is_finished()).count();
    if finished > 0 {
        log(&format!("{} module(s) had already finished", finished));
    }
    for handle in &starters {
        handle.stop();
    }
    for handle in &gatherers {
        handle.stop();
    }
    for handle in starters {
        if let Some(outcome) = handle.join() {
            log(&format!("Auto start game ended: {}", outcome.state));
        }
    }
    for handle in gatherers {
        if let Some(outcome) = handle.join() {
            log(&format!(
                "Gathering ended after {} cycles ({} dispatched)",
                outcome.cycles, outcome.dispatched
            ));
        }
    }
    Ok(())
}

fn edit_module(
    settings: &Path,
    index: u32,
    kind: ModuleKind,
    enabled: bool,
    attempts: Option<u32>,
) -> Result<()> {
    let store = if settings.exists() {
        let json = std::fs::read_to_string(settings)
            .with_context(|| format!("Failed to read {}", settings.display()))?;
        ModuleStore::from_json(&json)?
    } else {
        ModuleStore::new()
    };

    store.configure(index, kind, enabled, attempts);

    std::fs::write(settings, store.to_json()?)
        .with_context(|| format!("Failed to write {}", settings.display()))?;
    log(&format!(
        "{} on instance {}: {}",
        kind,
        index,
        if store.is_enabled(index, kind) { "enabled" } else { "disabled" }
    ));
    Ok(())
}

//! Panic hook that leaves a crash report under `<data_dir>/logs/crash`.
//!
//! Reports carry the run phase last recorded with [`set_phase`], so a crash
//! mid-run says which epoch or pass it hit.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt::Write as _;
use std::fs;
use std::panic::{self, PanicHookInfo};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread;

use chrono::{DateTime, Utc};

use crate::logging::log_dir;

pub const CRASH_DIR_NAME: &str = "crash";
const NO_PHASE: &str = "startup";

static INSTALL_LOCK: Mutex<()> = Mutex::new(());
static CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static WRITING: AtomicBool = AtomicBool::new(false);
static SEQUENCE: AtomicU64 = AtomicU64::new(0);
static PHASE: Mutex<String> = Mutex::new(String::new());

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashHook {
    Installed(PathBuf),
    AlreadyInstalled(PathBuf),
    Unavailable {
        dir: Option<PathBuf>,
        reason: String,
    },
}

pub fn crash_dir(data_dir: &Path) -> PathBuf {
    log_dir(data_dir).join(CRASH_DIR_NAME)
}

/// Chains a report-writing hook in front of the current panic hook.
///
/// Only the first successful call installs anything.
pub fn install_crash_hook(data_dir: Option<&Path>) -> CrashHook {
    if let Some(dir) = CRASH_DIR.get() {
        return CrashHook::AlreadyInstalled(dir.clone());
    }
    let Some(data_dir) = data_dir else {
        return CrashHook::Unavailable {
            dir: None,
            reason: "no data directory configured".to_string(),
        };
    };

    let dir = crash_dir(data_dir);
    if let Err(error) = fs::create_dir_all(&dir) {
        return CrashHook::Unavailable {
            dir: Some(dir),
            reason: format!("failed to create crash directory: {error}"),
        };
    }

    let _guard = INSTALL_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = CRASH_DIR.get() {
        return CrashHook::AlreadyInstalled(existing.clone());
    }

    let previous = panic::take_hook();
    let hook_dir = dir.clone();
    panic::set_hook(Box::new(move |info| {
        record_panic(&hook_dir, info);
        previous(info);
    }));
    let _ = CRASH_DIR.set(dir.clone());
    CrashHook::Installed(dir)
}

/// Records what the run is doing, e.g. `training epoch 3/10`.
pub fn set_phase(phase: impl Into<String>) {
    let mut current = PHASE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    *current = phase.into();
}

pub fn phase() -> String {
    // try_lock: the hook may fire on a thread that is mid-update.
    match PHASE.try_lock() {
        Ok(current) if !current.is_empty() => current.clone(),
        Ok(_) => NO_PHASE.to_string(),
        Err(_) => "<busy>".to_string(),
    }
}

fn record_panic(dir: &Path, info: &PanicHookInfo<'_>) {
    // A panic inside the hook must not recurse into another report.
    if WRITING
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let written = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        CrashReport::capture(info).write_to(dir)
    }));
    match written {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: failed to write panic crash artifact under '{}': {error}",
            dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: crash hook panicked while writing under '{}'",
            dir.display()
        ),
    }
    WRITING.store(false, Ordering::Release);
}

#[derive(Debug)]
struct CrashReport {
    at: DateTime<Utc>,
    thread: String,
    location: String,
    message: String,
    phase: String,
    backtrace_status: &'static str,
    backtrace: String,
}

impl CrashReport {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        let backtrace = Backtrace::capture();
        let (backtrace_status, backtrace) = match backtrace.status() {
            BacktraceStatus::Captured => ("captured", backtrace.to_string()),
            BacktraceStatus::Disabled => ("disabled (set RUST_BACKTRACE=1)", String::new()),
            _ => ("unsupported", String::new()),
        };
        Self {
            at: Utc::now(),
            thread: thread::current().name().unwrap_or("<unnamed>").to_string(),
            location: info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                .unwrap_or_else(|| "<unknown>".to_string()),
            message: payload_message(info.payload()),
            phase: phase(),
            backtrace_status,
            backtrace,
        }
    }

    fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "time={}", self.at.to_rfc3339());
        let _ = writeln!(out, "thread={}", self.thread);
        let _ = writeln!(out, "phase={}", self.phase);
        let _ = writeln!(out, "location={}", self.location);
        let _ = writeln!(out, "message={}", self.message);
        let _ = writeln!(out, "backtrace={}", self.backtrace_status);
        out.push_str(&self.backtrace);
        out
    }

    fn write_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!(
            "crash-{}-{sequence:04}.log",
            self.at.format("%Y%m%dT%H%M%S%.3f")
        ));
        fs::write(&path, self.render())?;
        Ok(path)
    }
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic payload>".to_string())
}

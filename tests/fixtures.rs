#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, bail};
use churnrig::engine::Instrumentation;
use churnrig::harness::HarnessConfig;

/// The signal engine owns a process-wide signal disposition, so tests that
/// attach one must not overlap.
static SIGNAL_ENGINE_SERIAL: Mutex<()> = Mutex::new(());

pub fn serialize_signal_engine() -> MutexGuard<'static, ()> {
    SIGNAL_ENGINE_SERIAL
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

pub fn harness_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_churnrig"))
}

/// A scaled-down run that still has every driver churning across all transitions.
pub fn busy_config() -> HarnessConfig {
    HarnessConfig {
        drivers: 6,
        children: 5,
        churn_iterations: usize::MAX,
        settle: Duration::from_millis(20),
        ..HarnessConfig::default()
    }
}

pub fn transcript_lines(transcript: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(transcript)
        .lines()
        .map(str::to_string)
        .collect()
}

/// How a [`ScriptedEngine`] misbehaves.
#[derive(Clone, Copy, Debug)]
pub enum Fault {
    /// Detach succeeds but the engine keeps reporting itself attached.
    StuckAttached,
    /// Attach succeeds but the engine never reports itself attached.
    NeverAttached,
    /// State queries are honest, but the consistency check always fails.
    Inconsistent,
}

/// A test double for an engine with a known defect.
pub struct ScriptedEngine {
    fault: Fault,
    attached: AtomicBool,
    attaches: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(fault: Fault) -> Self {
        ScriptedEngine {
            fault,
            attached: AtomicBool::new(false),
            attaches: AtomicUsize::new(0),
        }
    }

    pub fn attaches(&self) -> usize {
        self.attaches.load(Ordering::SeqCst)
    }
}

impl Instrumentation for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn attach_and_start(&self) -> Result<()> {
        if self.attached.swap(true, Ordering::SeqCst) {
            bail!("attached twice");
        }
        self.attaches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn detach_and_cleanup(&self) -> Result<()> {
        if !self.attached.swap(false, Ordering::SeqCst) {
            bail!("detached twice");
        }
        Ok(())
    }

    fn is_attached(&self) -> bool {
        match self.fault {
            Fault::StuckAttached => self.attaches() > 0,
            Fault::NeverAttached => false,
            Fault::Inconsistent => self.attached.load(Ordering::SeqCst),
        }
    }

    fn check_consistent(&self) -> Result<()> {
        match self.fault {
            Fault::Inconsistent => bail!("threads left behind"),
            _ => Ok(()),
        }
    }
}

/// An engine whose attach always fails.
pub struct BrokenEngine;

impl Instrumentation for BrokenEngine {
    fn name(&self) -> &str {
        "broken"
    }

    fn attach_and_start(&self) -> Result<()> {
        bail!("cannot take over the process")
    }

    fn detach_and_cleanup(&self) -> Result<()> {
        Ok(())
    }

    fn is_attached(&self) -> bool {
        false
    }
}

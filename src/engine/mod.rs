use anyhow::Result;
use clap::ValueEnum;
use strum::Display;

mod in_memory;
#[cfg(target_os = "linux")]
mod signal;

pub use in_memory::InMemoryEngine;
#[cfg(target_os = "linux")]
pub use signal::{SignalEngine, TAKEOVER_SIGNAL, TakeoverStats};

/// The two execution modes an instrumented process can be in.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash)]
pub enum AttachState {
    /// Threads run their own code, nothing is interposed.
    #[strum(serialize = "native")]
    Native,
    /// The engine has taken over the process.
    #[strum(serialize = "instrumented")]
    Instrumented,
}

impl AttachState {
    pub fn from_attached(attached: bool) -> Self {
        if attached {
            AttachState::Instrumented
        } else {
            AttachState::Native
        }
    }
}

/// An instrumentation engine that can be attached to, and detached from, the
/// live process.
///
/// The harness never calls `attach_and_start` twice without a
/// `detach_and_cleanup` in between (and vice versa), so implementations may
/// treat either as an error. Only the controller thread calls into the engine.
pub trait Instrumentation: Send + Sync {
    fn name(&self) -> &str;

    /// Take over the process. An error here is fatal to the run.
    fn attach_and_start(&self) -> Result<()>;

    /// Release the process and undo everything `attach_and_start` did. An
    /// error here is fatal to the run.
    fn detach_and_cleanup(&self) -> Result<()>;

    fn is_attached(&self) -> bool;

    /// Verify the process-level side effects of the engine agree with its
    /// reported state. Called after every detach.
    fn check_consistent(&self) -> Result<()> {
        Ok(())
    }

    fn state(&self) -> AttachState {
        AttachState::from_attached(self.is_attached())
    }
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, ValueEnum)]
pub enum EngineKind {
    /// Installs a takeover signal handler and signals every live thread (Linux only).
    #[strum(serialize = "signal")]
    Signal,
    /// Only flips an in-memory mode flag.
    #[strum(serialize = "in-memory")]
    InMemory,
}

impl Default for EngineKind {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            EngineKind::Signal
        } else {
            EngineKind::InMemory
        }
    }
}

pub fn build_engine(kind: EngineKind) -> Result<Box<dyn Instrumentation>> {
    match kind {
        EngineKind::InMemory => Ok(Box::new(InMemoryEngine::new())),
        #[cfg(target_os = "linux")]
        EngineKind::Signal => Ok(Box::new(SignalEngine::new())),
        #[cfg(not(target_os = "linux"))]
        EngineKind::Signal => Err(anyhow::anyhow!(
            "the signal engine needs /proc and tgkill, use --engine in-memory"
        )),
    }
}

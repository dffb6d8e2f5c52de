use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Result, bail};
use tracing::debug;

use crate::engine::Instrumentation;

#[derive(Debug, Default)]
struct ModeState {
    attached: bool,
    attaches: usize,
    detaches: usize,
}

/// An engine with no process-level side effects; attaching only flips a flag.
#[derive(Debug, Default)]
pub struct InMemoryEngine {
    state: Mutex<ModeState>,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed (attach, detach) transitions.
    pub fn transitions(&self) -> (usize, usize) {
        let state = self.lock();
        (state.attaches, state.detaches)
    }

    fn lock(&self) -> MutexGuard<'_, ModeState> {
        // the state is a pair of counters and a flag, always valid
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Instrumentation for InMemoryEngine {
    fn name(&self) -> &str {
        "in-memory"
    }

    fn attach_and_start(&self) -> Result<()> {
        let mut state = self.lock();
        if state.attached {
            bail!("in-memory engine is already attached");
        }
        state.attached = true;
        state.attaches += 1;
        debug!(attaches = state.attaches, "in-memory engine attached");
        Ok(())
    }

    fn detach_and_cleanup(&self) -> Result<()> {
        let mut state = self.lock();
        if !state.attached {
            bail!("in-memory engine is not attached");
        }
        state.attached = false;
        state.detaches += 1;
        debug!(detaches = state.detaches, "in-memory engine detached");
        Ok(())
    }

    fn is_attached(&self) -> bool {
        self.lock().attached
    }

    fn check_consistent(&self) -> Result<()> {
        let state = self.lock();
        let expected = if state.attached {
            state.detaches + 1
        } else {
            state.detaches
        };
        if state.attaches != expected {
            bail!(
                "{} attaches but {} detaches while attached={}",
                state.attaches,
                state.detaches,
                state.attached
            );
        }
        Ok(())
    }
}

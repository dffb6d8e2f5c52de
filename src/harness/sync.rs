use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, Sender, unbounded};

/// Cooperative shutdown flag, written once by the controller and polled by
/// every churn driver.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    raised: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }
}

/// One-shot startup rendezvous between the drivers and the controller.
///
/// Readiness is a message on a channel, so a signal sent before the
/// controller starts waiting is kept rather than lost, and extra signals
/// from the other drivers simply queue up.
#[derive(Debug)]
pub struct StartupBarrier {
    ready_rx: Receiver<()>,
}

/// The driver side of a [`StartupBarrier`].
#[derive(Clone, Debug)]
pub struct ReadySignal {
    ready_tx: Sender<()>,
}

impl StartupBarrier {
    pub fn new() -> (StartupBarrier, ReadySignal) {
        let (ready_tx, ready_rx) = unbounded();
        (StartupBarrier { ready_rx }, ReadySignal { ready_tx })
    }

    /// Block until some driver has signalled. Fails instead of hanging once
    /// every `ReadySignal` is gone without a signal having been sent.
    pub fn wait(&self) -> Result<()> {
        self.ready_rx
            .recv()
            .map_err(|_| anyhow!("every churn driver went away before signalling readiness"))
    }

    /// Signals received but not yet consumed by `wait`.
    #[cfg(test)]
    fn pending(&self) -> usize {
        self.ready_rx.len()
    }
}

impl ReadySignal {
    pub fn signal(&self) {
        // the barrier may already be torn down, which is fine
        let _ = self.ready_tx.send(());
    }
}

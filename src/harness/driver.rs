use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, trace};

use crate::harness::HarnessConfig;
use crate::harness::sync::{ReadySignal, StopSignal};

/// Stack size for child threads. They do nothing, and 625 of them can be
/// alive at once.
pub const CHILD_STACK_SIZE: usize = 64 * 1024;

/// Counters shared by every driver of one run.
#[derive(Debug, Default)]
pub struct ChurnStats {
    drivers_started: AtomicUsize,
    batches: AtomicUsize,
    children_spawned: AtomicUsize,
    children_joined: AtomicUsize,
    idle_polls: AtomicUsize,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StatsSnapshot {
    pub drivers_started: usize,
    pub batches: usize,
    pub children_spawned: usize,
    pub children_joined: usize,
    pub idle_polls: usize,
}

impl ChurnStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            drivers_started: self.drivers_started.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            children_spawned: self.children_spawned.load(Ordering::Relaxed),
            children_joined: self.children_joined.load(Ordering::Relaxed),
            idle_polls: self.idle_polls.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChildOutcome {
    Done,
}

/// The body of every child thread: exist, then terminate.
pub fn child_worker() -> ChildOutcome {
    ChildOutcome::Done
}

/// What one driver did over its lifetime.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DriverReport {
    pub batches: usize,
    pub children_joined: usize,
    pub idle_polls: usize,
}

/// A long-lived thread that spawns and joins batches of children until it
/// has done `churn_iterations` batches, then idles until told to stop.
pub struct ChurnDriver {
    id: usize,
    children: usize,
    churn_iterations: usize,
    poll_interval: Duration,
    ready: ReadySignal,
    stop: StopSignal,
    stats: Arc<ChurnStats>,
}

impl ChurnDriver {
    pub fn new(
        id: usize,
        config: &HarnessConfig,
        ready: ReadySignal,
        stop: StopSignal,
        stats: Arc<ChurnStats>,
    ) -> Self {
        ChurnDriver {
            id,
            children: config.children,
            churn_iterations: config.churn_iterations,
            poll_interval: config.poll_interval,
            ready,
            stop,
            stats,
        }
    }

    pub fn run(self) -> DriverReport {
        self.stats.drivers_started.fetch_add(1, Ordering::Relaxed);
        self.ready.signal();

        let mut report = DriverReport::default();
        while !self.stop.is_raised() {
            if report.batches < self.churn_iterations {
                report.children_joined += self.churn_batch(report.batches);
                report.batches += 1;
                if report.batches == self.churn_iterations {
                    debug!(driver = self.id, "churn phase finished, idling");
                }
            } else {
                report.idle_polls += 1;
                self.stats.idle_polls.fetch_add(1, Ordering::Relaxed);
                idle(self.poll_interval);
            }
        }

        trace!(driver = self.id, ?report, "driver observed stop");
        report
    }

    /// Spawn a full batch of children, then join every one of them. The stop
    /// flag is deliberately not consulted mid-batch.
    fn churn_batch(&self, batch: usize) -> usize {
        let mut handles: Vec<JoinHandle<ChildOutcome>> = Vec::with_capacity(self.children);
        for child in 0..self.children {
            let spawned = thread::Builder::new()
                .stack_size(CHILD_STACK_SIZE)
                .spawn(child_worker);
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!(driver = self.id, batch, child, "cannot spawn child thread: {e}");
                    process::abort();
                }
            }
            self.stats.children_spawned.fetch_add(1, Ordering::Relaxed);
        }

        let mut joined = 0;
        for (child, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(ChildOutcome::Done) => joined += 1,
                Err(_) => {
                    error!(driver = self.id, batch, child, "child thread panicked");
                    process::abort();
                }
            }
        }
        self.stats.children_joined.fetch_add(joined, Ordering::Relaxed);
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        trace!(driver = self.id, batch, joined, "batch joined");
        joined
    }
}

fn idle(poll_interval: Duration) {
    if poll_interval.is_zero() {
        thread::yield_now();
    } else {
        thread::sleep(poll_interval);
    }
}

use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, error, info, warn};

use crate::engine::{AttachState, Instrumentation};
use crate::harness::driver::{ChurnDriver, ChurnStats, DriverReport, StatsSnapshot};
use crate::harness::sync::{ReadySignal, StartupBarrier, StopSignal};

pub mod driver;
pub mod sync;

/// How a run treats checkpoints that disagree with the expected state.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MismatchPolicy {
    /// Print the mismatch and carry on; the run still succeeds.
    #[default]
    Report,
    /// Print the mismatch, finish the protocol, then fail the run.
    Fail,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HarnessConfig {
    /// Number of churn drivers.
    pub drivers: usize,
    /// Children per churn batch.
    pub children: usize,
    /// Batches per driver before it starts idling.
    pub churn_iterations: usize,
    /// Delay between a transition and the checkpoint that follows it.
    pub settle: Duration,
    /// Pause between idle polls of the stop flag. Zero yields instead.
    pub poll_interval: Duration,
    /// Attach/detach cycles.
    pub cycles: usize,
    pub mismatch_policy: MismatchPolicy,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        HarnessConfig {
            drivers: 25,
            children: 25,
            churn_iterations: 50,
            settle: Duration::from_millis(50),
            poll_interval: Duration::from_micros(100),
            cycles: 2,
            mismatch_policy: MismatchPolicy::Report,
        }
    }
}

/// Where the controller is in its (strictly linear) protocol.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControllerState {
    Created,
    Attached(usize),
    Detached(usize),
    Draining,
    Done,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerState::Created => write!(f, "created"),
            ControllerState::Attached(cycle) => write!(f, "attached#{cycle}"),
            ControllerState::Detached(cycle) => write!(f, "detached#{cycle}"),
            ControllerState::Draining => write!(f, "draining"),
            ControllerState::Done => write!(f, "done"),
        }
    }
}

/// One state query made after a transition had time to settle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CheckpointOutcome {
    pub cycle: usize,
    pub expected: AttachState,
    pub observed: AttachState,
}

impl CheckpointOutcome {
    pub fn is_mismatch(&self) -> bool {
        self.expected != self.observed
    }
}

#[derive(Clone, Debug, Default)]
pub struct Report {
    pub drivers_spawned: usize,
    /// Reports of the drivers that were joined, in creation order.
    pub drivers: Vec<DriverReport>,
    pub checkpoints: Vec<CheckpointOutcome>,
    /// Consistency failures after detach, as (cycle, reason).
    pub inconsistencies: Vec<(usize, String)>,
    pub transitions: Vec<ControllerState>,
    pub stats: StatsSnapshot,
}

impl Report {
    pub fn drivers_joined(&self) -> usize {
        self.drivers.len()
    }

    pub fn mismatches(&self) -> usize {
        self.checkpoints.iter().filter(|c| c.is_mismatch()).count() + self.inconsistencies.len()
    }

    pub fn has_mismatches(&self) -> bool {
        self.mismatches() > 0
    }
}

/// The attach controller: churns threads and attaches/detaches an engine
/// underneath them, checking the engine's state after every transition.
pub struct Harness {
    config: HarnessConfig,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> Self {
        Harness { config }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Run the full protocol. Milestones and mismatches go to `transcript`.
    ///
    /// Engine errors, thread spawn failures and driver panics are fatal and
    /// returned as errors; the drivers are stopped and joined first.
    pub fn run<W: Write>(
        &self,
        engine: &dyn Instrumentation,
        transcript: &mut W,
    ) -> Result<Report> {
        let mut report = Report {
            transitions: vec![ControllerState::Created],
            ..Report::default()
        };

        let (barrier, ready) = StartupBarrier::new();
        let stop = StopSignal::new();
        let stats = Arc::new(ChurnStats::default());

        writeln!(transcript, "Starting threads")?;
        let drivers = self.spawn_drivers(ready, &stop, &stats)?;
        report.drivers_spawned = drivers.len();

        let protocol = self.attach_detach_cycles(engine, &barrier, transcript, &mut report);
        if protocol.is_err()
            && let Some(&ControllerState::Attached(cycle)) = report.transitions.last()
        {
            // leave the process native even when the protocol is cut short
            match engine.detach_and_cleanup() {
                Ok(()) => report.transitions.push(ControllerState::Detached(cycle)),
                Err(e) => warn!(cycle, "detach after a failed protocol also failed: {e:#}"),
            }
        }

        stop.raise();
        report.transitions.push(ControllerState::Draining);
        debug!("stop raised, joining {} drivers", drivers.len());
        let joined = join_drivers(drivers);
        drop(barrier);

        protocol?;
        report.drivers = joined?;
        report.stats = stats.snapshot();
        report.transitions.push(ControllerState::Done);
        info!(
            drivers = report.drivers_joined(),
            batches = report.stats.batches,
            children = report.stats.children_joined,
            mismatches = report.mismatches(),
            "run complete"
        );

        writeln!(transcript, "all done")?;
        transcript.flush()?;

        if self.config.mismatch_policy == MismatchPolicy::Fail && report.has_mismatches() {
            bail!(
                "{} of {} checkpoints reported a mismatch",
                report.mismatches(),
                report.checkpoints.len()
            );
        }
        Ok(report)
    }

    fn spawn_drivers(
        &self,
        ready: ReadySignal,
        stop: &StopSignal,
        stats: &Arc<ChurnStats>,
    ) -> Result<Vec<JoinHandle<DriverReport>>> {
        self.spawn_drivers_with(ready, stop, stats, |id, driver| {
            thread::Builder::new()
                .name(format!("churn-driver-{id}"))
                .spawn(move || driver.run())
        })
    }

    /// Spawn every driver through `spawn`. On the first failure the drivers
    /// already running are stopped and joined before the error is returned.
    fn spawn_drivers_with<F>(
        &self,
        ready: ReadySignal,
        stop: &StopSignal,
        stats: &Arc<ChurnStats>,
        mut spawn: F,
    ) -> Result<Vec<JoinHandle<DriverReport>>>
    where
        F: FnMut(usize, ChurnDriver) -> io::Result<JoinHandle<DriverReport>>,
    {
        let mut handles = Vec::with_capacity(self.config.drivers);
        for id in 0..self.config.drivers {
            let driver = ChurnDriver::new(
                id,
                &self.config,
                ready.clone(),
                stop.clone(),
                Arc::clone(stats),
            );
            match spawn(id, driver) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!("cannot spawn churn driver {id}: {e}");
                    stop.raise();
                    let mut err = anyhow!(e).context(format!("spawning churn driver {id}"));
                    if let Err(join_err) = join_drivers(handles) {
                        err = err.context(format!("while draining: {join_err:#}"));
                    }
                    return Err(err);
                }
            }
        }
        Ok(handles)
    }

    fn attach_detach_cycles<W: Write>(
        &self,
        engine: &dyn Instrumentation,
        barrier: &StartupBarrier,
        transcript: &mut W,
        report: &mut Report,
    ) -> Result<()> {
        let cycles = self.config.cycles;
        for cycle in 1..=cycles {
            // the first attach follows driver creation with nothing in between
            engine.attach_and_start().with_context(|| {
                format!("{} engine failed to attach (cycle {cycle})", engine.name())
            })?;
            report.transitions.push(ControllerState::Attached(cycle));
            info!(engine = engine.name(), cycle, "attached");

            if cycle == 1 {
                barrier.wait()?;
                debug!("churn has started");
            }

            thread::sleep(self.config.settle);
            if self.checkpoint(engine, cycle, AttachState::Instrumented, report) {
                writeln!(
                    transcript,
                    "ERROR: should be running instrumented before detaching"
                )?;
            }
            writeln!(transcript, "Running instrumented")?;

            engine.detach_and_cleanup().with_context(|| {
                format!("{} engine failed to detach (cycle {cycle})", engine.name())
            })?;
            report.transitions.push(ControllerState::Detached(cycle));
            info!(engine = engine.name(), cycle, "detached");

            thread::sleep(self.config.settle);
            if self.checkpoint(engine, cycle, AttachState::Native, report) {
                writeln!(
                    transcript,
                    "ERROR: should not be running instrumented after detaching"
                )?;
            }
            if let Err(e) = engine.check_consistent() {
                warn!(cycle, "inconsistent state after detach: {e:#}");
                writeln!(transcript, "ERROR: inconsistent state after detaching: {e:#}")?;
                report.inconsistencies.push((cycle, format!("{e:#}")));
            }

            if cycle == cycles {
                writeln!(transcript, "Not running instrumented, exiting")?;
            } else {
                writeln!(transcript, "Not running instrumented")?;
            }
        }
        Ok(())
    }

    /// Query the engine and record the outcome. Returns true on a mismatch.
    fn checkpoint(
        &self,
        engine: &dyn Instrumentation,
        cycle: usize,
        expected: AttachState,
        report: &mut Report,
    ) -> bool {
        let outcome = CheckpointOutcome {
            cycle,
            expected,
            observed: engine.state(),
        };
        report.checkpoints.push(outcome);
        if outcome.is_mismatch() {
            warn!(cycle, %expected, observed = %outcome.observed, "checkpoint mismatch");
        }
        outcome.is_mismatch()
    }
}

/// Join every driver, even if some of them panicked.
fn join_drivers(handles: Vec<JoinHandle<DriverReport>>) -> Result<Vec<DriverReport>> {
    let mut reports = Vec::with_capacity(handles.len());
    let mut panicked = 0;
    for (id, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(report) => reports.push(report),
            Err(_) => {
                error!(driver = id, "churn driver panicked");
                panicked += 1;
            }
        }
    }
    if panicked > 0 {
        bail!("{panicked} churn driver(s) panicked");
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::InMemoryEngine;

    fn quick_config() -> HarnessConfig {
        HarnessConfig {
            drivers: 4,
            children: 3,
            churn_iterations: 5,
            settle: Duration::from_millis(5),
            ..HarnessConfig::default()
        }
    }

    fn transcript_lines(transcript: &[u8]) -> Vec<String> {
        String::from_utf8_lossy(transcript)
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn clean_run_transcript() -> Result<()> {
        let engine = InMemoryEngine::new();
        let mut transcript = Vec::new();
        let report = Harness::new(quick_config()).run(&engine, &mut transcript)?;

        assert_eq!(
            transcript_lines(&transcript),
            [
                "Starting threads",
                "Running instrumented",
                "Not running instrumented",
                "Running instrumented",
                "Not running instrumented, exiting",
                "all done",
            ]
        );
        assert!(!report.has_mismatches());
        assert_eq!(report.checkpoints.len(), 4);
        assert_eq!(engine.transitions(), (2, 2));
        assert!(!engine.is_attached());
        Ok(())
    }

    #[test]
    fn controller_states_are_linear() -> Result<()> {
        let engine = InMemoryEngine::new();
        let report = Harness::new(quick_config()).run(&engine, &mut Vec::new())?;

        use ControllerState::*;
        assert_eq!(
            report.transitions,
            [
                Created,
                Attached(1),
                Detached(1),
                Attached(2),
                Detached(2),
                Draining,
                Done
            ]
        );
        Ok(())
    }

    #[test]
    fn every_driver_is_joined() -> Result<()> {
        let config = quick_config();
        let engine = InMemoryEngine::new();
        let report = Harness::new(config.clone()).run(&engine, &mut Vec::new())?;

        assert_eq!(report.drivers_spawned, config.drivers);
        assert_eq!(report.drivers_joined(), config.drivers);
        assert_eq!(report.stats.drivers_started, config.drivers);
        assert_eq!(report.stats.children_spawned, report.stats.children_joined);
        for driver in &report.drivers {
            assert!(driver.batches <= config.churn_iterations);
            assert_eq!(driver.children_joined, driver.batches * config.children);
        }
        Ok(())
    }

    #[test]
    fn single_cycle_run() -> Result<()> {
        let config = HarnessConfig {
            cycles: 1,
            ..quick_config()
        };
        let engine = InMemoryEngine::new();
        let mut transcript = Vec::new();
        let report = Harness::new(config).run(&engine, &mut transcript)?;

        assert_eq!(
            transcript_lines(&transcript),
            [
                "Starting threads",
                "Running instrumented",
                "Not running instrumented, exiting",
                "all done",
            ]
        );
        assert_eq!(report.checkpoints.len(), 2);
        Ok(())
    }

    /// Accepts `limit` bytes, then fails like a closed pipe.
    struct ClosingSink {
        written: usize,
        limit: usize,
    }

    impl Write for ClosingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.written >= self.limit {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"));
            }
            self.written += buf.len();
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn transcript_failure_still_detaches() {
        let engine = InMemoryEngine::new();
        let mut sink = ClosingSink {
            written: 0,
            limit: "Starting threads\n".len(),
        };

        let err = Harness::new(quick_config())
            .run(&engine, &mut sink)
            .expect_err("a closed transcript is fatal");
        assert!(format!("{err:#}").contains("sink closed"), "{err:#}");
        assert!(!engine.is_attached());
        assert_eq!(engine.transitions(), (1, 1));
    }

    #[test]
    fn driver_spawn_failure_drains_running_drivers() {
        let harness = Harness::new(quick_config());
        let (_barrier, ready) = StartupBarrier::new();
        let stop = StopSignal::new();
        let stats = Arc::new(ChurnStats::default());

        let err = harness
            .spawn_drivers_with(ready, &stop, &stats, |id, driver| {
                if id == 2 {
                    Err(io::Error::other("thread limit reached"))
                } else {
                    Ok(thread::spawn(move || driver.run()))
                }
            })
            .expect_err("spawn failure is fatal");

        assert!(format!("{err:#}").contains("spawning churn driver 2"), "{err:#}");
        assert!(stop.is_raised());
        // both drivers spawned before the failure ran and were joined
        assert_eq!(stats.snapshot().drivers_started, 2);
    }

    #[test]
    fn driver_spawn_failure_keeps_the_drain_error() {
        let harness = Harness::new(quick_config());
        let (_barrier, ready) = StartupBarrier::new();
        let stop = StopSignal::new();
        let stats = Arc::new(ChurnStats::default());

        let err = harness
            .spawn_drivers_with(ready, &stop, &stats, |id, driver| match id {
                0 => Ok(thread::spawn(move || -> DriverReport {
                    drop(driver);
                    panic!("driver failed on startup");
                })),
                _ => Err(io::Error::other("thread limit reached")),
            })
            .expect_err("spawn failure is fatal");

        let message = format!("{err:#}");
        assert!(message.contains("spawning churn driver 1"), "{message}");
        assert!(message.contains("1 churn driver(s) panicked"), "{message}");
    }

    #[test]
    fn controller_state_names() {
        assert_eq!(ControllerState::Attached(2).to_string(), "attached#2");
        assert_eq!(ControllerState::Draining.to_string(), "draining");
    }
}

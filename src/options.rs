use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;

use crate::engine::EngineKind;
use crate::harness::{HarnessConfig, MismatchPolicy};

#[derive(Clone, Debug, Parser)]
#[command(
    version,
    about = "Attach/detach an instrumentation engine while threads churn underneath it"
)]
pub struct Options {
    /// Number of long-lived churn drivers.
    #[arg(long = "drivers", default_value_t = 25)]
    pub drivers: usize,

    /// Number of child threads each driver spawns (and joins) per batch.
    #[arg(long = "children", default_value_t = 25)]
    pub children: usize,

    /// Batches a driver runs before it settles into idle polling.
    #[arg(long = "churn-iterations", default_value_t = 50)]
    pub churn_iterations: usize,

    /// Delay, in milliseconds, between a transition and its checkpoint.
    #[arg(long = "settle-ms", default_value_t = 50)]
    pub settle_ms: u64,

    /// Idle-poll interval, in microseconds. Zero only yields.
    #[arg(long = "poll-interval-us", default_value_t = 100)]
    pub poll_interval_us: u64,

    /// Number of attach/detach cycles.
    #[arg(long = "cycles", default_value_t = 2)]
    pub cycles: usize,

    /// Instrumentation engine to attach.
    #[arg(long = "engine", value_enum, default_value_t = EngineKind::default())]
    pub engine: EngineKind,

    /// Fail the run (exit code 1) if any checkpoint reports a mismatch.
    #[arg(long = "strict")]
    pub strict: bool,

    /// Log filter directive, e.g. "debug" or "churnrig::harness=trace".
    /// `RUST_LOG` takes precedence when set.
    #[arg(long = "log-level", default_value = "warn")]
    pub log_level: String,

    /// Write logs to this file instead of stderr.
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,
}

impl Options {
    pub fn validate(&self) -> Result<()> {
        if self.drivers == 0 {
            bail!("--drivers must be at least 1");
        }
        if self.children == 0 {
            bail!("--children must be at least 1");
        }
        if self.cycles == 0 {
            bail!("--cycles must be at least 1");
        }
        Ok(())
    }

    pub fn harness_config(&self) -> HarnessConfig {
        HarnessConfig {
            drivers: self.drivers,
            children: self.children,
            churn_iterations: self.churn_iterations,
            settle: Duration::from_millis(self.settle_ms),
            poll_interval: Duration::from_micros(self.poll_interval_us),
            cycles: self.cycles,
            mismatch_policy: if self.strict {
                MismatchPolicy::Fail
            } else {
                MismatchPolicy::Report
            },
        }
    }
}

use std::io;

use anyhow::Result;
use churnrig::{engine::build_engine, harness::Harness, logging, options::Options};
use clap::Parser;
use tracing::info;

fn main() -> Result<()> {
    let options = Options::parse();
    options.validate()?;

    // flushes the non-blocking log writer when dropped
    let _log_guard = logging::init(&options.log_level, options.log_file.as_deref())?;

    let engine = build_engine(options.engine)?;
    let harness = Harness::new(options.harness_config());
    info!(engine = engine.name(), config = ?harness.config(), "starting churn harness");

    let report = harness.run(engine.as_ref(), &mut io::stdout())?;
    info!(
        checkpoints = report.checkpoints.len(),
        mismatches = report.mismatches(),
        "harness finished"
    );
    Ok(())
}

use anyhow::Result;
use clap::Parser;

use rig_reconstruction::cli::{init_logging, run_job, Args};
use rig_reconstruction::opencv_features::{BfHammingMatcher, OrbExtractor};

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    run_job(
        &args,
        Box::new(OrbExtractor::default()),
        Box::new(BfHammingMatcher::default()),
    )?;
    Ok(())
}

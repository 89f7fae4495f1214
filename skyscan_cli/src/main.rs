mod args;
mod config;
mod logging;
mod validate;

use anyhow::Context;
use args::Cli;
use clap::Parser;
use skyscan::Detector;
use skyscan::core_modules::progress::{ConsoleProgressDisplay, ProgressDisplay, SilentProgressDisplay};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (action, args) = Cli::parse().command.into_parts();
    let args = config::resolve(args)?;
    logging::init(&logging::LogSettings::from_args(&args)?)?;

    let quiet = args.quiet;
    let config = validate::build_config(action, args, validate::prompt_password)?;
    let mut detector = Detector::new(config);

    let display: Arc<dyn ProgressDisplay> = if quiet {
        Arc::new(SilentProgressDisplay::default())
    } else {
        Arc::new(ConsoleProgressDisplay::new())
    };
    detector.set_progress_display(display.clone());
    // Ctrl-C stops the run between batches; the output written so far is kept.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping...");
            display.cancel();
        }
    });

    let summary = detector
        .process()
        .await
        .with_context(|| format!("{} failed", action.name()))?;
    info!(
        layer = %summary.layer,
        features = summary.features,
        output = %detector.config().output.path.display(),
        "Done"
    );
    Ok(())
}

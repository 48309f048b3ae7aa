use anyhow::Context;
use mimalloc::MiMalloc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use quantcheck::{HarnessConfig, QatWorkflow};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = HarnessConfig::from_env().context("reading harness configuration")?;
    let tolerance = config.tolerance;
    info!(mode = ?config.mode, data = ?config.data, "starting QAT verification");

    let report = QatWorkflow::new(config)
        .run()
        .context("QAT workflow failed")?;
    info!(
        layers = report.quantized_layers.len(),
        pact = report.pact_parameters.len(),
        before = report.before.top1,
        after = report.after.top1,
        "workflow finished"
    );
    report
        .check(tolerance)
        .context("accuracy changed too much after quantization")?;
    Ok(())
}

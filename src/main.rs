use acquiring_flows::interfaces::csv::state_writer::StateWriter;
use acquiring_flows::interfaces::scenario::{self, Scenario};
use acquiring_flows::logging::init_logging;
use acquiring_flows::settings::FlowSettings;
use clap::Parser;
use miette::{IntoDiagnostic, Result, WrapErr};
use std::io;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Scenario JSON file describing the flow to simulate
    scenario: PathBuf,

    /// Flow settings JSON file (polling budgets, SBP bank apps)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Override the polling retry count of every hand-off flow
    #[arg(long)]
    retries: Option<u32>,

    /// Override the delay between status polls, in milliseconds
    #[arg(long)]
    delay_ms: Option<u64>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let settings = match &cli.settings {
        Some(path) => FlowSettings::load(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to load settings from {}", path.display()))?,
        None => FlowSettings::default(),
    }
    .with_overrides(cli.retries, cli.delay_ms.map(Duration::from_millis));

    let scenario = Scenario::load(&cli.scenario)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to load scenario from {}", cli.scenario.display()))?;

    let rows = scenario::run(scenario, settings).await.into_diagnostic()?;

    let stdout = io::stdout();
    let mut writer = StateWriter::new(stdout.lock());
    writer.write_rows(&rows).into_diagnostic()?;

    Ok(())
}

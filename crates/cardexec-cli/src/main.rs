//! cardexec - run dashboard card queries from the command line.

use anyhow::Result;
use cardexec_cli::{parse_param, AppConfig, Application};
use cardexec_core::Params;
use clap::Parser;
use serde_json::Value;
use tracing::info;

/// Run the cards of a card file and print their records as NDJSON
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Card file path (can also be set via CARDEXEC_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,

    /// Call parameter as key=value, value parsed as JSON when possible
    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, Value)>,

    /// Keep live cards running until Ctrl-C
    #[arg(short, long)]
    follow: bool,

    /// Print Prometheus metrics to stderr on exit
    #[arg(long)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // TLS provider must be installed before any wss:// connection.
    cardexec_ws::init_crypto();

    let args = Args::parse();

    let config_path = AppConfig::resolve_path(args.config);
    let config = AppConfig::from_file(&config_path)?;

    cardexec_telemetry::init_logging(config.telemetry.log_filter.as_deref())?;
    info!("Starting cardexec v{}", env!("CARGO_PKG_VERSION"));
    info!(config_path = %config_path, cards = config.cards.len(), "Configuration loaded");

    let params: Params = args.params.into_iter().collect();
    let app = Application::new(config)?;
    let summary = app.run(params, args.follow, std::io::stdout()).await?;

    if args.metrics {
        eprint!("{}", cardexec_telemetry::Metrics::gather_text()?);
    }

    if summary.failed > 0 {
        anyhow::bail!("{} of {} cards failed", summary.failed, summary.cards);
    }
    Ok(())
}

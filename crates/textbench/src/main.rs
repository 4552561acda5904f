use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use textbench_core::{Harness, HarnessConfig, RunReport, TargetMode};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "textbench")]
#[command(about = "Load test client - sends every line of a text file to the processing service")]
struct Args {
    /// Text file whose lines become requests
    input: PathBuf,

    /// Number of concurrent request workers
    #[arg(value_parser = parse_workers)]
    workers: usize,

    /// Path to configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Target mode: http or mock (overrides config)
    #[arg(long)]
    mode: Option<String>,

    /// Base URL of the service (overrides config)
    #[arg(long)]
    base_url: Option<String>,

    /// Request timeout in milliseconds (overrides config)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Disable the GET poller
    #[arg(long)]
    no_poller: bool,

    /// Directory for the JSON run report (overrides config)
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

fn parse_workers(raw: &str) -> Result<usize, String> {
    let workers: usize = raw
        .parse()
        .map_err(|_| format!("must input a valid integer for max threads number (got {raw:?})"))?;
    if workers == 0 {
        return Err("max threads number must be positive".to_string());
    }
    Ok(workers)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    if !args.input.is_file() {
        anyhow::bail!("input file {:?} does not exist or is not a file", args.input);
    }

    info!(
        "Starting {} workers in {:?} mode against {}",
        args.workers, config.target.mode, config.target.base_url
    );

    let output_dir = config.report.output_dir.clone();
    let harness = Harness::from_config(config).context("Invalid configuration")?;
    let report = harness
        .run(&args.input, args.workers)
        .await
        .context("Load test run failed")?;

    print!("{report}");

    if let Some(dir) = output_dir {
        let path = write_report(&dir, &report)?;
        info!("Results written to {}", path.display());
    }

    Ok(())
}

fn load_config(args: &Args) -> Result<HarnessConfig> {
    let mut config = match &args.config {
        Some(path) => HarnessConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => HarnessConfig::default(),
    };

    if let Some(mode) = args.mode.as_deref() {
        config.target.mode = match mode {
            "http" => TargetMode::Http,
            "mock" => TargetMode::Mock,
            other => anyhow::bail!("Invalid mode: {}, must be 'mock' or 'http'", other),
        };
    }
    if let Some(base_url) = &args.base_url {
        config.target.base_url = base_url.clone();
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.target.timeout_ms = timeout_ms;
    }
    if args.no_poller {
        config.poller.enabled = false;
    }
    if let Some(dir) = &args.output_dir {
        config.report.output_dir = Some(dir.clone());
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn write_report(dir: &Path, report: &RunReport) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory {:?}", dir))?;
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let path = dir.join(format!("run_{}.json", timestamp));
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(&path, json).with_context(|| format!("Failed to write {:?}", path))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_workers() {
        assert_eq!(parse_workers("8"), Ok(8));
        assert!(parse_workers("0").is_err());
        assert!(parse_workers("-3").is_err());
        assert!(parse_workers("many").is_err());
    }

    #[test]
    fn test_args_require_two_positionals() {
        assert!(Args::try_parse_from(["textbench", "input.txt"]).is_err());
        assert!(Args::try_parse_from(["textbench", "input.txt", "0"]).is_err());

        let args = Args::try_parse_from(["textbench", "input.txt", "16", "--mode", "mock"]).unwrap();
        assert_eq!(args.workers, 16);
        assert_eq!(args.input, PathBuf::from("input.txt"));
    }

    #[test]
    fn test_flags_override_config() {
        let args = Args::try_parse_from([
            "textbench",
            "input.txt",
            "4",
            "--mode",
            "mock",
            "--no-poller",
            "--timeout-ms",
            "250",
        ])
        .unwrap();
        let config = load_config(&args).unwrap();
        assert_eq!(config.target.mode, TargetMode::Mock);
        assert!(!config.poller.enabled);
        assert_eq!(config.target.timeout_ms, 250);
    }

    #[test]
    fn test_invalid_mode_is_rejected() {
        let args = Args::try_parse_from(["textbench", "input.txt", "4", "--mode", "grpc"]).unwrap();
        assert!(load_config(&args).is_err());
    }
}

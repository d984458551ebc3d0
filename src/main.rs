use clap::{ArgAction, ArgGroup, Parser};
use figma_vrt::api::FigmaClient;
use figma_vrt::config::{AppConfig, LoggingConfig, token_from_env};
use figma_vrt::internal::pipeline::{
    Pipeline, RunMode, RunOptions, RunReport, Step, Stores, chrome_launcher,
};
use figma_vrt::internal::report::render_summary;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Compare a running site against its Figma design frames.
#[derive(Parser, Debug)]
#[command(name = "figma-vrt", version, about)]
#[command(group(
    ArgGroup::new("steps")
        .args(["fetch", "capture", "compare"])
        .multiple(true)
))]
struct Cli {
    /// Download Figma baselines (combinable with --capture and --compare)
    #[arg(short, long)]
    fetch: bool,

    /// Capture implementation screenshots
    #[arg(short, long)]
    capture: bool,

    /// Compare existing baselines and screenshots
    #[arg(short = 'C', long)]
    compare: bool,

    /// Capture and compare against cached baselines without calling Figma
    #[arg(long, conflicts_with_all = ["steps", "vrt"])]
    skip_fetch: bool,

    /// Fetch baselines and run the external visual-test steps
    #[arg(long, conflicts_with = "steps")]
    vrt: bool,

    /// Download baselines even when cached
    #[arg(short = 'r', long)]
    force_refresh: bool,

    /// Config file (defaults to vrt.ron lookup)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Figma personal access token
    #[arg(long, env = "FIGMA_ACCESS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Override the implementation URL
    #[arg(long, value_name = "URL")]
    base_url: Option<String>,

    /// Override the Figma file key
    #[arg(long, value_name = "KEY")]
    file_key: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn mode(&self) -> RunMode {
        if self.skip_fetch {
            return RunMode::SkipFetch;
        }
        if self.vrt {
            return RunMode::Vrt;
        }

        let selected = [
            (self.fetch, Step::Fetch),
            (self.capture, Step::Capture),
            (self.compare, Step::Compare),
        ];
        RunMode::from_steps(
            selected
                .into_iter()
                .filter_map(|(on, step)| on.then_some(step))
                .collect(),
        )
    }
}

fn init_logging(logging: &LoggingConfig, verbose: u8) -> Option<WorkerGuard> {
    // If RUST_LOG is set, it takes precedence.
    // Otherwise, build from config.
    let env_filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => {
            let mut directives = logging.filter_directives();
            match verbose {
                0 => {}
                1 => directives.push_str(",figma_vrt=debug"),
                _ => directives.push_str(",figma_vrt=trace"),
            }
            EnvFilter::new(directives)
        }
    };

    match logging.log_directory.as_deref() {
        Some(log_dir) => {
            let file_appender = tracing_appender::rolling::daily(log_dir, "figma-vrt.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(non_blocking)
                .with_ansi(false)
                .compact()
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .compact()
                .init();
            None
        }
    }
}

async fn run(cli: Cli) -> i32 {
    let mut config = match &cli.config {
        Some(path) => match AppConfig::load_from(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("❌ {e:#}");
                return 2;
            }
        },
        None => AppConfig::load(),
    };
    if let Some(base_url) = cli.base_url.clone() {
        config.base_url = base_url;
    }
    if let Some(file_key) = cli.file_key.clone() {
        config.file_key = file_key;
    }

    // Keep the guard alive so buffered file logs are flushed on return.
    let _guard = init_logging(&config.logging, cli.verbose);

    let token = cli
        .token
        .clone()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .or_else(token_from_env);
    if token.is_none() {
        tracing::warn!("No Figma token set, only cached baselines can be used");
    }

    let options = RunOptions {
        mode: cli.mode(),
        force_refresh: cli.force_refresh,
    };

    // The blocking HTTP client and the browser must live off the async runtime.
    let handle = tokio::task::spawn_blocking(move || -> anyhow::Result<RunReport> {
        let stores = Stores::from_config(&config);
        let client = token
            .map(|t| FigmaClient::with_base_url(t, config.api_base_url.clone()))
            .transpose()?;
        let mut pipeline = Pipeline::new(config, options, stores, client, chrome_launcher());
        Ok(pipeline.run()?)
    });

    match handle.await {
        Ok(Ok(report)) => {
            println!("{}", render_summary(&report));
            report.exit_code()
        }
        Ok(Err(e)) => {
            tracing::error!(error = %format!("{e:#}"), "Pipeline aborted");
            eprintln!("❌ {e:#}");
            2
        }
        Err(e) => {
            eprintln!("❌ pipeline task failed: {e}");
            2
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = run(cli).await;
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_mode_flags() {
        let cli = Cli::try_parse_from(["figma-vrt"]).unwrap();
        assert_eq!(cli.mode(), RunMode::All);

        let cli = Cli::try_parse_from(["figma-vrt", "-f"]).unwrap();
        assert_eq!(cli.mode(), RunMode::FetchOnly);

        let cli = Cli::try_parse_from(["figma-vrt", "-C", "-r"]).unwrap();
        assert_eq!(cli.mode(), RunMode::CompareOnly);
        assert!(cli.force_refresh);

        let cli = Cli::try_parse_from(["figma-vrt", "--skip-fetch"]).unwrap();
        assert_eq!(cli.mode(), RunMode::SkipFetch);

        let cli = Cli::try_parse_from(["figma-vrt", "--vrt"]).unwrap();
        assert_eq!(cli.mode(), RunMode::Vrt);
    }

    #[test]
    fn test_step_flags_combine() {
        let cli = Cli::try_parse_from(["figma-vrt", "-f", "-C"]).unwrap();
        assert_eq!(cli.mode().steps(true), vec![Step::Fetch, Step::Compare]);

        let cli = Cli::try_parse_from(["figma-vrt", "--compare", "--capture"]).unwrap();
        assert_eq!(cli.mode().steps(true), vec![Step::Capture, Step::Compare]);
    }

    #[test]
    fn test_skip_fetch_and_vrt_are_exclusive() {
        assert!(Cli::try_parse_from(["figma-vrt", "--skip-fetch", "--compare"]).is_err());
        assert!(Cli::try_parse_from(["figma-vrt", "--vrt", "--fetch"]).is_err());
        assert!(Cli::try_parse_from(["figma-vrt", "--vrt", "--skip-fetch"]).is_err());
    }
}

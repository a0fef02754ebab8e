use clap::Parser;
use drone_edge_agent::cli::Cli;
use drone_edge_agent::config::Config;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // `--log` wins over the config file's `log.level`, which wins over
    // `RUST_LOG`/the "info" default. Config is loaded twice (once here just
    // for the level, again in `supervisor::run`) to keep logging set up
    // before any config-validation errors need reporting.
    let config_level = Config::load(&cli.config).ok().map(|c| c.log.level);
    let level = cli.log.clone().or(config_level);
    let filter = level
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = drone_edge_agent::supervisor::run(cli).await {
        tracing::error!(error = %e, "fatal error during startup or run");
        std::process::exit(1);
    }

    Ok(())
}

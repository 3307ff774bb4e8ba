use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hinv_extractors::{builtin_registry, Classification, ExtractorRegistry};
use hinv_storage::InventoryStore;
use hinv_sync::{build_poller, connect_store, run_cycle_once, InventoryConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hinv")]
#[command(about = "Host inventory fact ingestion")]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace). Overrides RUST_LOG.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll for unprocessed artifacts until interrupted.
    Run {
        #[arg(long)]
        interval_secs: Option<u64>,
        #[arg(long)]
        max_concurrency: Option<usize>,
    },
    /// Run a single poll cycle and print its summary as JSON.
    Once,
    /// Apply database migrations.
    Migrate,
    /// Classify an artifact file offline and print the proposed updates.
    Classify {
        /// Artifact name as the agent reports it, e.g. "/etc/redhat-release".
        #[arg(long)]
        name: String,
        file: PathBuf,
    },
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

async fn classify_file(
    registry: &ExtractorRegistry,
    name: &str,
    path: &Path,
) -> Result<Classification> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let content = String::from_utf8_lossy(&bytes);
    Ok(registry.classify(name, &content))
}

async fn run_forever(config: InventoryConfig) -> Result<()> {
    let store = connect_store(&config).await?;
    store.migrate().await.context("applying migrations")?;
    let store: Arc<dyn InventoryStore> = Arc::new(store);
    let registry = builtin_registry().context("building extractor registry")?;
    let poller = Arc::new(build_poller(&config, store, registry));

    let mut sched = Arc::clone(&poller).build_job_scheduler().await?;
    sched.start().await.context("starting scheduler")?;
    info!(
        interval = ?poller.interval(),
        max_concurrency = config.max_concurrency,
        "polling for artifacts"
    );

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = InventoryConfig::from_env();
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    match cli.command.unwrap_or(Commands::Once) {
        Commands::Run {
            interval_secs,
            max_concurrency,
        } => {
            if let Some(secs) = interval_secs.filter(|s| *s > 0) {
                config.poll_interval = Duration::from_secs(secs);
            }
            if let Some(n) = max_concurrency {
                config.max_concurrency = n.max(1);
            }
            run_forever(config).await?;
        }
        Commands::Once => {
            let summary = run_cycle_once(&config).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Migrate => {
            let store = connect_store(&config).await?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Classify { name, file } => {
            let registry = builtin_registry().context("building extractor registry")?;
            let classification = classify_file(&registry, &name, &file).await?;
            println!("{}", serde_json::to_string_pretty(&classification)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn cli_parses_classify() {
        let cli = Cli::try_parse_from(["hinv", "-v", "classify", "--name", "/bin/uname -a", "out.txt"])
            .unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Some(Commands::Classify { name, file }) => {
                assert_eq!(name, "/bin/uname -a");
                assert_eq!(file, PathBuf::from("out.txt"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn classify_file_reads_artifact_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "ProductName:\tmacOS\nProductVersion:\t12.6\nBuildVersion:\t21G115\n").unwrap();
        let registry = builtin_registry().unwrap();

        let classification = classify_file(&registry, "/usr/bin/sw_vers", file.path())
            .await
            .unwrap();

        assert_eq!(classification.rule_id, Some("sw-vers"));
        let json = serde_json::to_value(&classification).unwrap();
        assert_eq!(json["updates"][0]["fields"]["os"], "macOS 12.6");
        assert_eq!(json["updates"][0]["clear_edition"], true);
    }

    #[tokio::test]
    async fn classify_missing_file_reports_path() {
        let registry = builtin_registry().unwrap();
        let err = classify_file(&registry, "/etc/hosts", Path::new("/nonexistent/hinv-artifact"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/hinv-artifact"));
    }
}

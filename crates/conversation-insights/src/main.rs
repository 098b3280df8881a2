#[cfg(feature = "cli")]
use clap::Parser;
#[cfg(feature = "cli")]
use conversation_insights::{config::Config, run_server};

/// Conversation analysis service: HTTP intake plus background analysis workers.
#[cfg(feature = "cli")]
#[derive(Debug, Parser)]
#[command(name = "conversation-insights", version, about)]
struct Cli {
    /// SQLite database file (overrides DATABASE_PATH)
    #[arg(long)]
    database: Option<String>,

    /// HTTP port (overrides API_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Number of analysis workers (overrides ANALYSIS_WORKERS)
    #[arg(long)]
    workers: Option<usize>,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut cfg = Config::from_env()?;
    if let Some(database) = cli.database {
        cfg.database_path = database;
    }
    if let Some(port) = cli.port {
        cfg.api_port = port;
    }
    if let Some(workers) = cli.workers {
        cfg.workers = workers.max(1);
    }

    run_server(cfg).await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}

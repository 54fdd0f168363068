mod config;
mod history_cmd;
mod serve_cmd;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::info;

use overseer_core::broadcast::Broadcaster;
use overseer_core::supervisor::Supervisor;
use overseer_db::HistoryStore;
use overseer_db::models::{HistoryFilter, IterationResult};

use config::OverseerConfig;

#[derive(Parser)]
#[command(name = "overseer", about = "Supervisor for a long-running coding agent")]
struct Cli {
    /// Database URL (overrides OVERSEER_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write an overseer config file with default settings
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the control API and live event stream
    Serve {
        /// Address to bind (default from config, then 127.0.0.1)
        #[arg(long)]
        bind: Option<String>,
        /// Port to listen on (default from config, then 8000)
        #[arg(long)]
        port: Option<u16>,
        /// Agent executable (overrides OVERSEER_AGENT_BIN env var)
        #[arg(long)]
        agent_bin: Option<String>,
        /// Do not query the backlog; pending counts come from agent events only
        #[arg(long)]
        no_backlog: bool,
    },
    /// List recorded iterations, newest first
    History {
        /// Only show iterations with this result
        #[arg(long)]
        result: Option<IterationResult>,
        /// Only show iterations by this performer
        #[arg(long)]
        performer: Option<String>,
        /// Maximum number of iterations to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
        /// Number of iterations to skip
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Show aggregate iteration statistics
    Stats,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

/// Execute the `overseer init` command: write config file.
fn cmd_init(force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile::default();
    let path = config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  agent.args = {:?}", cfg.agent.args);
    println!("  backlog.command = {}", cfg.backlog.command);
    println!("  server = {}:{}", cfg.server.bind, cfg.server.port);
    println!();
    println!("Next: run `overseer serve` to start the control API.");

    Ok(())
}

/// Execute the `overseer serve` command.
async fn cmd_serve(
    resolved: OverseerConfig,
    bind: Option<String>,
    port: Option<u16>,
    no_backlog: bool,
) -> anyhow::Result<()> {
    let history = HistoryStore::open(&resolved.db_config).await?;

    if no_backlog || !resolved.backlog.enabled {
        info!("backlog queries disabled");
    }
    let backlog = resolved.build_backlog(no_backlog);

    info!(
        agent = %resolved.supervisor.agent_binary,
        database = %resolved.db_config.database_url,
        "starting supervisor"
    );
    let supervisor = Supervisor::new(resolved.supervisor, history, backlog, Broadcaster::new());

    let bind = bind.unwrap_or(resolved.server.bind);
    let port = port.unwrap_or(resolved.server.port);
    serve_cmd::run_serve(supervisor, &bind, port).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            cmd_init(force)?;
        }
        Commands::Serve {
            bind,
            port,
            agent_bin,
            no_backlog,
        } => {
            let resolved =
                OverseerConfig::resolve(cli.database_url.as_deref(), agent_bin.as_deref())?;
            cmd_serve(resolved, bind, port, no_backlog).await?;
        }
        Commands::History {
            result,
            performer,
            limit,
            offset,
        } => {
            let resolved = OverseerConfig::resolve(cli.database_url.as_deref(), None)?;
            let store = HistoryStore::open(&resolved.db_config).await?;
            let filter = HistoryFilter { result, performer };
            let result = history_cmd::run_history(&store, &filter, limit, offset).await;
            store.close().await;
            result?;
        }
        Commands::Stats => {
            let resolved = OverseerConfig::resolve(cli.database_url.as_deref(), None)?;
            let store = HistoryStore::open(&resolved.db_config).await?;
            let result = history_cmd::run_stats(&store).await;
            store.close().await;
            result?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "overseer",
                &mut std::io::stdout(),
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod test_util {
    use std::sync::{Mutex, MutexGuard};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Serialize tests that read or write process environment variables.
    pub fn lock_env() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

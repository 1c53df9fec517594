use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use hdcbot::{Agent, AgentConfig};
use interfaces::MemoryClient;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hdcbot", version, about = "Automated retweet/favorite/follow agent")]
struct Cli {
    /// Agent configuration (JSON). Defaults apply when omitted.
    #[arg(long, env = "HDCBOT_CONFIG")]
    config: Option<PathBuf>,

    /// Snapshot of the remote service to run against (JSON).
    #[arg(long, env = "HDCBOT_FIXTURE")]
    fixture: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process the live subscriptions until interrupted.
    Stream,
    /// Run a single batch-crawl pass and print its report.
    Crawl {
        /// Follower count returned by the previous pass.
        #[arg(long)]
        previous_count: Option<u64>,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Unfollow accounts that do not follow back.
    Sweep,
    /// List the accounts the agent follows.
    Friends,
    /// Stream processing plus the periodic crawl loop.
    Run {
        #[command(flatten)]
        overrides: Overrides,
    },
}

#[derive(Args)]
struct Overrides {
    #[arg(long)]
    cooldown_minutes: Option<u64>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    pause_minutes: Option<u64>,
}

impl Overrides {
    fn apply(&self, config: &mut AgentConfig) {
        if let Some(minutes) = self.cooldown_minutes {
            config.dispatch.cooldown_minutes = minutes;
        }
        if let Some(size) = self.batch_size {
            config.crawl.batch_size = size;
        }
        if let Some(minutes) = self.pause_minutes {
            config.crawl.pause_minutes = minutes;
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "hdcbot=debug,interfaces=debug"
    } else {
        "hdcbot=info,interfaces=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn shutdown_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, shutting down");
            cancel.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => AgentConfig::load(path)
            .await
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => AgentConfig::default(),
    };
    match &cli.command {
        Command::Crawl { overrides, .. } | Command::Run { overrides } => overrides.apply(&mut config),
        _ => {}
    }

    let snapshot = tokio::fs::read_to_string(&cli.fixture)
        .await
        .with_context(|| format!("reading fixture {}", cli.fixture.display()))?;
    let client = MemoryClient::from_json(&snapshot).context("parsing fixture")?;
    let agent = Agent::new(Arc::new(client), config)?;

    let cancel = CancellationToken::new();
    shutdown_on_ctrl_c(cancel.clone());

    match cli.command {
        Command::Stream => agent.run_stream(cancel).await?,
        Command::Crawl { previous_count, .. } => {
            let report = agent.crawl_once(previous_count, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Sweep => {
            let report = agent.sweep().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Friends => {
            for friend in agent.list_friends().await? {
                println!("{}", friend.screen_name);
            }
        }
        Command::Run { .. } => agent.run(cancel).await?,
    }

    info!("hdcbot finished");
    Ok(())
}

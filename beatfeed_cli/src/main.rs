mod shell;

use anyhow::{Context, Result};
use beatfeed_core::backend::FeedBackend;
use beatfeed_core::{telemetry, FeedConfig, FeedServices, FeedSync, MemoryPlatform, QueryCache};
use clap::{Parser, Subcommand};
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about = "Beatfeed: share loops and sketches with other producers")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the interactive shell against the configured project
    Shell,
    /// Start the interactive shell against a seeded in-memory platform
    Demo,
    /// Print the current feed once and exit
    Feed {
        /// Maximum number of posts to print
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();
    let args = Args::parse();

    match args.command.unwrap_or(Command::Shell) {
        Command::Shell => {
            let config = load_config()?;
            let services = FeedServices::supabase(&config)
                .context("failed to set up platform clients")?;
            let sync = FeedSync::start(services, config.reconnect_delay);
            shell::run_shell(sync).await
        }
        Command::Demo => {
            let platform = MemoryPlatform::new();
            platform.seed_demo();
            println!("Demo platform seeded. Log in with kai@beatfeed.dev / demo-pass");
            println!("(mira@beatfeed.dev and theo@beatfeed.dev use the same password).");
            let sync = FeedSync::start(FeedServices::memory(&platform), Duration::from_secs(1));
            shell::run_shell(sync).await
        }
        Command::Feed { limit } => {
            let config = load_config()?;
            let services = FeedServices::supabase(&config)
                .context("failed to set up platform clients")?;
            print_feed_once(services.backend, limit).await
        }
    }
}

fn load_config() -> Result<FeedConfig> {
    FeedConfig::from_env().context(
        "failed to load configuration; set BEATFEED_SUPABASE_URL and BEATFEED_SUPABASE_ANON_KEY",
    )
}

async fn print_feed_once(backend: std::sync::Arc<dyn FeedBackend>, limit: usize) -> Result<()> {
    let cache = QueryCache::new(backend);
    let snapshot = cache.refetch().await.context("failed to load feed")?;
    if snapshot.posts.is_empty() {
        println!("No posts yet.");
    }
    for (index, post) in snapshot.posts.iter().take(limit).enumerate() {
        shell::print_post(index + 1, post);
    }
    Ok(())
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use anonircd::config;
use anonircd::db::Db;
use anonircd::irc::server::Server;

#[derive(Parser, Debug)]
#[command(name = "anonircd", about = "Anonymous IRC daemon", version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Serve runtime stats on localhost:<port>
    #[arg(short, long)]
    debug: Option<u16>,

    /// Suppress timestamps in log lines
    #[arg(short, long)]
    bare_log: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());
    if args.bare_log {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .without_time()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = config::load(&args.config)?;
    let db = Db::open(&config.db_source, &config.salt).context("failed to open database")?;
    let server = Server::new(config, args.config.clone(), db);

    if let Some(port) = args.debug {
        tokio::spawn(anonircd::debug::serve(Arc::clone(&server), port));
    }

    // SIGHUP reloads the configuration and cycles the listeners.
    {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let mut hangup =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
                    .expect("failed to install SIGHUP handler");
            while hangup.recv().await.is_some() {
                if let Err(err) = server.reload().await {
                    warn!("failed to reload configuration: {err:#}");
                }
            }
        });
    }

    info!("anonircd starting");
    server.run().await;
    Ok(())
}

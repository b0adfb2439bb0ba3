// companion - Local capture service for AI-assisted coding sessions
//
// Records what happens around an assistant while code is being written and
// hands it to consumers in one ordered stream.
//
// Architecture:
// - Sources (capture/): file watcher, prompt endpoint, clipboard, shell history
// - Storage: SQLite by default, PostgreSQL when DATABASE_URL is set
// - Queue: in-memory sequence queue with cursor reads and acknowledgements
// - Correlate: prompt/event scoring and the file relationship graph
// - API (axum): HTTP, SSE and WebSocket on 127.0.0.1
// - Supervisor: boot order, health probe, backups, Ctrl-C shutdown

mod analytics;
mod api;
mod backup;
mod capture;
mod cli;
mod config;
mod correlate;
mod error;
mod labeling;
mod logging;
mod model;
mod queue;
mod startup;
mod storage;
mod supervisor;
mod turns;
mod util;

use anyhow::Result;
use clap::Parser;

use cli::Cli;
use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // A config file that exists but does not parse stops here
    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("\n╔══════════════════════════════════════════════════════════════╗");
            eprintln!("║  CONFIG ERROR - Failed to load configuration                 ║");
            eprintln!("╚══════════════════════════════════════════════════════════════╝\n");
            eprintln!("  {e:#}\n");
            std::process::exit(1);
        }
    };
    cli.apply(&mut config);

    if cli::handle_command(&cli, &config) {
        return Ok(());
    }

    // Keeps the file writer alive; dropping it flushes on exit
    let _log_guard = logging::init(&config.logging);

    supervisor::run(config).await
}

mod api;
mod cli;
mod model;
mod orchestrator;
mod presenter;
mod session;
mod storage;
#[cfg(feature = "tui")]
mod tui;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Log to stderr; `RUST_LOG` overrides the default `info` level.
/// The TUI owns the terminal, so it only gets logs when `RUST_LOG` asks for them.
fn init_tracing(tui: bool) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) if tui => return,
        Err(_) => EnvFilter::new("info"),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let is_tui = args.command.is_none();
    init_tracing(is_tui);

    let res = cli::run(args).await;
    // Exit explicitly in non-TUI modes so a pending stdin read cannot hold the runtime open.
    if res.is_ok() && !is_tui {
        std::process::exit(0);
    }
    res
}

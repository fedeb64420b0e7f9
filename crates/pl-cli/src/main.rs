//! PortLink CLI
//!
//! Command-line interface for the PortLink tunneling tool.

mod cli;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use pl_core::LinkConfig;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use cli::{Cli, Mode};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();
    let mut config = LinkConfig::load_or_default(cli.config.as_deref())?;
    config.proxy_protocol |= cli.proxy_protocol;

    // Setup logging
    let level = if cli.verbose || config.debug {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    match cli.mode()? {
        Mode::Server {
            listen,
            token,
            pairs,
        } => {
            cli::server::run(listen, token, pairs, config).await?;
        }
        Mode::Client {
            url,
            token,
            pairs,
            bind_ip,
        } => {
            cli::client::run(url, token, pairs, bind_ip, config).await?;
        }
        Mode::Usage => {
            Cli::command().print_help()?;
            println!();
        }
    }

    Ok(())
}

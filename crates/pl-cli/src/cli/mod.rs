//! CLI Flag Definitions
//!
//! Defines the command-line interface using clap and resolves the flags
//! into one of the two roles.

pub mod client;
pub mod server;

use clap::Parser;
use pl_core::brand::{BIN_NAME, DESCRIPTION, TOKEN_ENV};
use pl_core::{PortLinkError, PortPair, Result, parse_ports};
use std::net::IpAddr;
use std::path::PathBuf;

/// PortLink - expose TCP services behind NAT
///
/// Run one side with --server next to the services and the other with
/// --client where the ports should appear. Traffic flows over an encrypted
/// peer-to-peer link negotiated through the server's signaling endpoint.
#[derive(Parser, Debug)]
#[command(name = BIN_NAME)]
#[command(author, version, about = DESCRIPTION, long_about = None)]
pub struct Cli {
    /// Run as server, accepting signaling on this address (e.g. :8080)
    #[arg(long, value_name = "ADDR", conflicts_with = "client")]
    pub server: Option<String>,

    /// Run as client, connecting to this signaling URL (e.g. ws://host:8080/ice)
    #[arg(long, value_name = "URL")]
    pub client: Option<String>,

    /// Shared secret both sides must present
    #[arg(long, env = TOKEN_ENV, hide_env_values = true)]
    pub token: Option<String>,

    /// Ports to expose (server) or forward (client), e.g. "22,8080:80"
    #[arg(long, value_name = "SPEC")]
    pub ports: Option<String>,

    /// Client only: remote:local pairs, defaults to --ports
    #[arg(long, value_name = "SPEC")]
    pub ports_mapping: Option<String>,

    /// Client only: address the local listeners bind to
    #[arg(long, value_name = "IP", default_value = "127.0.0.1")]
    pub local: IpAddr,

    /// Server only: prefix backend connections with a PROXY header
    /// carrying the client address
    #[arg(long)]
    pub proxy_protocol: bool,

    /// Link configuration file (TOML)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// What the process should do
#[derive(Debug, PartialEq, Eq)]
pub enum Mode {
    Server {
        listen: String,
        token: String,
        pairs: Vec<PortPair>,
    },
    Client {
        url: String,
        token: String,
        pairs: Vec<PortPair>,
        bind_ip: IpAddr,
    },
    Usage,
}

impl Cli {
    /// Resolves the flags into a mode, checking the ones each mode needs.
    pub fn mode(&self) -> Result<Mode> {
        if let Some(listen) = &self.server {
            let token = self.token()?;
            let pairs = required_ports(self.ports.as_deref())?;
            return Ok(Mode::Server {
                listen: listen.clone(),
                token,
                pairs,
            });
        }

        if let Some(url) = &self.client {
            let token = self.token()?;
            let spec = self
                .ports_mapping
                .as_deref()
                .filter(|mapping| !mapping.trim().is_empty())
                .or(self.ports.as_deref());
            let pairs = required_ports(spec)?;
            for pair in &pairs {
                pair.dest_port()?;
            }
            return Ok(Mode::Client {
                url: url.clone(),
                token,
                pairs,
                bind_ip: self.local,
            });
        }

        Ok(Mode::Usage)
    }

    fn token(&self) -> Result<String> {
        match self.token.as_deref() {
            Some(token) if !token.is_empty() => Ok(token.to_string()),
            _ => Err(PortLinkError::MissingFlag("--token")),
        }
    }
}

fn required_ports(spec: Option<&str>) -> Result<Vec<PortPair>> {
    let pairs = parse_ports(spec.unwrap_or_default())?;
    if pairs.is_empty() {
        return Err(PortLinkError::MissingFlag("--ports"));
    }
    Ok(pairs)
}

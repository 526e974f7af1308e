use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

/// An OpenAI-compatible gateway in front of a Gemini-style generative API.
#[derive(Debug, Parser)]
#[command(name = "prism", version)]
pub struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "PRISM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on, overriding the configuration file.
    #[arg(short, long, env = "PRISM_LISTEN_ADDRESS")]
    pub listen_address: Option<SocketAddr>,

    /// Log filter, e.g. "info" or "gateway=debug,server=debug".
    #[arg(long, env = "PRISM_LOG")]
    pub log: Option<String>,
}

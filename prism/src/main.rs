use std::net::SocketAddr;

use args::Args;
use clap::Parser;
use tokio_util::sync::CancellationToken;

mod args;

const DEFAULT_LISTEN_ADDRESS: ([u8; 4], u16) = ([127, 0, 0, 1], 8000);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => config::Config::load(path)?,
        None => config::Config::default(),
    };

    config.validate()?;

    let listen_address = args
        .listen_address
        .or(config.server.listen_address)
        .unwrap_or_else(|| SocketAddr::from(DEFAULT_LISTEN_ADDRESS));

    let log_filter = args.log.clone().unwrap_or_else(|| config.log.filter.clone());

    let shutdown_signal = CancellationToken::new();

    {
        let shutdown_signal = shutdown_signal.clone();

        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown_signal.cancel();
            }
        });
    }

    server::serve(server::ServeConfig {
        listen_address,
        config,
        shutdown_signal,
        log_filter,
        version: env!("CARGO_PKG_VERSION").to_string(),
        bound_addr_sender: None,
    })
    .await
}

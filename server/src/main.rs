use clap::Parser;
use log::info;
use server::{start_relay, RelayConfig};
use std::time::Duration;

/// Main-method of the relay server.
/// Parses command-line arguments, starts the router and runs until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "0.0.0.0")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "12345")]
        port: u16,
        /// Maximum number of concurrent groups (0 for unlimited)
        #[clap(short = 'g', long, default_value = "0")]
        max_groups: usize,
        /// Per-recipient send timeout in milliseconds
        #[clap(long, default_value = "2000")]
        send_timeout_ms: u64,
        /// Time a new connection has to send its join request, in milliseconds
        #[clap(long, default_value = "5000")]
        join_timeout_ms: u64,
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let config = RelayConfig {
        host: args.host,
        port: args.port,
        max_groups: (args.max_groups > 0).then_some(args.max_groups),
        send_timeout: Duration::from_millis(args.send_timeout_ms),
        join_timeout: Duration::from_millis(args.join_timeout_ms),
    };

    let (handle, addr) = start_relay(config).await?;
    info!("Relay server started on {}", addr);

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down gracefully...");
    handle.stop().await;

    Ok(())
}

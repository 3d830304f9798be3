use clap::Parser;
use client::network::Peer;
use log::info;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address, with or without a port
    server: String,

    /// Group to join
    #[arg(short = 'g', long, default_value = "3")]
    group: i32,

    /// Name announced to the group
    #[arg(short = 'n', long, default_value = "peer")]
    name: String,

    /// Milliseconds between position updates
    #[arg(short = 'i', long, default_value = "1000")]
    interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting peer {} for group {}", args.name, args.group);

    let peer = Peer::connect(&args.server, args.group, &args.name).await?;
    info!("Assigned client id {}", peer.id());

    peer.run(Duration::from_millis(args.interval_ms)).await?;

    Ok(())
}

use std::net::IpAddr;

use clap::Parser;
use env_logger::Builder;
use log::{debug, info, LevelFilter};

use routerd::config;
use routerd::server::serve;

#[derive(Parser)]
#[clap(name = "routerd", about = "Dual-protocol (BGP/OSPFv2) routing agent")]
struct Args {
    /// Path to the routerd config file
    config_path: String,
    /// IP Address to listen on
    #[clap(short, long, default_value = "0.0.0.0")]
    address: IpAddr,
    /// TCP port to listen on for BGP
    #[clap(short, long, default_value = "179")]
    port: u16,
    /// TCP port for the JSON-RPC status API
    #[clap(long, default_value = "8179")]
    api_port: u16,
    /// Sets the level of logging verbosity
    #[clap(short, parse(from_occurrences))]
    verbose: u8,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let (routerd_level, other_level) = match args.verbose {
        0 => (LevelFilter::Info, LevelFilter::Warn),
        1 => (LevelFilter::Debug, LevelFilter::Warn),
        2 => (LevelFilter::Trace, LevelFilter::Warn),
        _ => (LevelFilter::Trace, LevelFilter::Trace),
    };
    Builder::new()
        .filter(Some("routerd"), routerd_level)
        .filter(None, other_level)
        .init();
    info!("Logging at levels {}/{}", routerd_level, other_level);

    let config = config::from_file(&args.config_path)?;
    debug!(
        "Found {} peers and {} OSPF interfaces in {}",
        config.peers.len(),
        config.ospf.interfaces.len(),
        args.config_path
    );

    // All protocol state lives on one cooperative scheduler thread
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(args.address, args.port, args.api_port, config))
}

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use parrotlink::discovery::StaticDiscovery;
use parrotlink::{Airframe, Drone, LinkConfig};

/// Measure the acknowledgement rate of a Wi-Fi drone
///
/// Sends the harmless `common.Common.AllStates` request repeatedly and
/// counts the acknowledged ones.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Handshake address of the drone
    #[arg(short, long, default_value = "192.168.99.3:44444")]
    address: SocketAddr,

    /// Airframe: bebop, bebop2 or mambo
    #[arg(long, default_value = "mambo")]
    airframe: String,

    /// Number of requests
    #[arg(short, long, default_value_t = 50)]
    count: u32,

    /// Transmissions per request
    #[arg(short, long, default_value_t = 1)]
    retries: u32,

    /// Wait for each acknowledgement, in ms
    #[arg(short = 'w', long, default_value_t = 500)]
    ack_wait: u64,
}

fn airframe(name: &str) -> Result<Airframe> {
    match name.to_lowercase().as_str() {
        "bebop" => Ok(Airframe::Bebop),
        "bebop2" => Ok(Airframe::Bebop2),
        "mambo" => Ok(Airframe::Mambo),
        other => anyhow::bail!("unknown airframe {}", other),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = LinkConfig { max_packet_retries: args.retries, ack_wait_ms: args.ack_wait, ..LinkConfig::wifi_defaults() };
    let airframe = airframe(&args.airframe)?;
    let mut drone = Drone::wifi(airframe, config, Arc::new(StaticDiscovery::new(args.address)))?;

    println!("=== Acknowledgement probe ===");
    println!("{} requests, {} transmissions each, {} ms ack wait\n", args.count, args.retries, args.ack_wait);

    if !drone.connect(5).await {
        anyhow::bail!("Could not connect to {}", args.address);
    }

    let mut acked = 0;
    let mut total_time = Duration::ZERO;
    for i in 0..args.count {
        let start = Instant::now();
        let ok = drone.ask_for_state_update().await?;
        let elapsed = start.elapsed();
        if ok {
            acked += 1;
            total_time += elapsed;
        }
        println!("  request {:>3}: {} ({:.1} ms)", i + 1, if ok { "acked" } else { "lost" }, elapsed.as_secs_f64() * 1000.0);
    }

    println!("\n--- Results ---");
    println!("Acknowledged: {}/{} ({:.1}%)", acked, args.count, 100.0 * acked as f64 / args.count.max(1) as f64);
    if acked > 0 {
        println!("Mean time to ack: {:.1} ms", total_time.as_secs_f64() * 1000.0 / acked as f64);
    }

    drone.disconnect().await;
    Ok(())
}

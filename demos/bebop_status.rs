use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use parrotlink::discovery::StaticDiscovery;
use parrotlink::{Airframe, Drone, LinkConfig};

/// Connect to a Bebop, ask for its full state and print the sensors
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Handshake address of the drone
    #[arg(short, long, default_value = "192.168.42.1:44444")]
    address: SocketAddr,

    /// Drone is a Bebop 2
    #[arg(long)]
    bebop2: bool,

    /// Link configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Seconds to listen to the sensors
    #[arg(short, long, default_value_t = 5)]
    listen: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => LinkConfig::from_file(path)?,
        None => LinkConfig::wifi_defaults(),
    };
    let airframe = if args.bebop2 { Airframe::Bebop2 } else { Airframe::Bebop };

    let mut drone = Drone::wifi(airframe, config, Arc::new(StaticDiscovery::new(args.address)))?;
    if !drone.connect(10).await {
        anyhow::bail!("Could not connect to the {:?} at {}", airframe, args.address);
    }

    println!("Connected to {:?}, asking for the full state", airframe);
    if !drone.ask_for_state_update().await? {
        println!("State update not acknowledged, listening anyway");
    }
    drone.smart_sleep(Duration::from_secs(args.listen)).await;

    let sensors = drone.sensors();
    println!("\n--- Sensors ---");
    println!("Battery: {}%", sensors.battery);
    println!("Flying state: {}", sensors.flying_state);
    println!("Altitude: {:.2} m", sensors.altitude);

    let mut names: Vec<_> = sensors.sensors().iter().collect();
    names.sort_by(|a, b| a.0.cmp(b.0));
    for (name, value) in names {
        match value {
            Some(value) => println!("{:<48} {}", name, value),
            None => println!("{:<48} ?", name),
        }
    }

    drone.disconnect().await;
    Ok(())
}

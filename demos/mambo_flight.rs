use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use parrotlink::{Drone, LinkConfig, SensorState};

/// Short flight of a Mambo over the Wi-Fi of its FPV camera
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Link configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Flip direction, no flip if not given
    #[arg(short, long)]
    flip: Option<String>,

    /// Print every sensor update
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => LinkConfig::from_file(path)?,
        None => LinkConfig::wifi_defaults(),
    };

    let mut drone = Drone::mambo_wifi(config)?;
    if args.verbose {
        drone.set_observer(Some(Arc::new(|field: &str, state: &SensorState| {
            println!("{} -> {:?}", field, state.get(field));
        })));
    }

    if !drone.connect(10).await {
        anyhow::bail!("Could not connect to the Mambo");
    }
    drone.smart_sleep(Duration::from_secs(2)).await;
    drone.ask_for_state_update().await?;
    drone.smart_sleep(Duration::from_secs(2)).await;

    println!("Battery at {}%, taking off", drone.sensors().battery);
    if !drone.safe_takeoff(Duration::from_secs(5)).await? {
        println!("Takeoff not confirmed, landing");
        drone.safe_land(Duration::from_secs(5)).await?;
        drone.disconnect().await;
        return Ok(());
    }

    drone.smart_sleep(Duration::from_secs(2)).await;

    if let Some(direction) = &args.flip {
        println!("Flipping {}", direction);
        let acked = drone.flip(direction).await?;
        println!("Flip acknowledged: {}", acked);
        drone.smart_sleep(Duration::from_secs(3)).await;
    }

    println!("Turning and moving forward");
    drone.turn_degrees(90).await?;
    drone.smart_sleep(Duration::from_secs(2)).await;
    drone.fly_direct(0, 30, 0, 0, Some(Duration::from_secs(1))).await?;
    drone.smart_sleep(Duration::from_secs(1)).await;

    println!("Landing");
    let landed = drone.safe_land(Duration::from_secs(5)).await?;
    println!("Landed: {}", landed);

    drone.disconnect().await;
    Ok(())
}

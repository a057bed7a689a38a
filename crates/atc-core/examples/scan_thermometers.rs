//! Example: Scanning for Thermometers
//!
//! Listens for advertisements and prints every device that carries
//! Environmental Sensing or BTHome service data.
//!
//! Run with: `cargo run --example scan_thermometers -- [SECONDS]`

use std::env;
use std::time::Duration;

use atc_core::{BleScanner, Scanner};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let seconds = env::args()
        .nth(1)
        .map(|s| s.parse::<u64>())
        .transpose()?
        .unwrap_or(10);

    println!("Scanning for {} seconds...", seconds);
    let scanner = BleScanner::new().await?;
    let advertisements = scanner.scan(Duration::from_secs(seconds)).await?;

    println!();
    println!("{:<20} {:<16} {:>6} {:>8}", "Address", "Name", "RSSI", "Bytes");
    println!("{}", "-".repeat(54));
    for adv in &advertisements {
        println!(
            "{:<20} {:<16} {:>6} {:>8}",
            adv.address,
            adv.name.as_deref().unwrap_or("-"),
            adv.rssi.map(|r| r.to_string()).unwrap_or_else(|| "-".into()),
            adv.payload.len()
        );
    }
    println!();
    println!("Found {} device(s)", advertisements.len());
    Ok(())
}

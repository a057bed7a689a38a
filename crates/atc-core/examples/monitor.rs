//! Example: Monitoring Thermometers
//!
//! Loads a TOML monitor configuration, initializes every listed sensor and
//! prints its values after each scan window.
//!
//! Run with: `cargo run --example monitor -- monitor.toml`
//!
//! ```toml
//! [router]
//! address_prefix = "A4:C1:38"
//!
//! [[sensors]]
//! address = "A4:C1:38:12:34:56"
//! name = "Kitchen"
//! mode = "advertising"
//! ```

use std::env;
use std::sync::Arc;

use atc_core::{AdvertisingRouter, BleScanner, BleTransport, DeviceSession, MonitorConfig};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    let path = if args.len() > 1 {
        &args[1]
    } else {
        eprintln!("Usage: {} <CONFIG.toml>", args[0]);
        std::process::exit(1);
    };

    let config = MonitorConfig::load_validated(path)?;
    let router = AdvertisingRouter::new(config.router.clone());
    let mut names = Vec::new();

    for sensor in &config.sensors {
        let session = DeviceSession::with_config(
            sensor.address.clone(),
            BleTransport::new().await?,
            sensor.session_config(&config.session),
        );
        router.register(Arc::new(session));
        names.push((
            sensor.address.clone(),
            sensor.name.clone().unwrap_or_else(|| sensor.address.clone()),
        ));
    }

    for (address, error) in router.init_all().await {
        warn!(%address, %error, "Continuing without initial settings");
    }

    let scanner = BleScanner::new().await?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            summary = router.scan_and_route(&scanner) => {
                let summary = summary?;
                println!("-- {} advertisement(s), {} decoded", summary.seen, summary.decoded);
            }
        }

        for (address, name) in &names {
            let Some(session) = router.session(address) else {
                continue;
            };
            println!(
                "{:<16} {:>6.1} °C {:>6.1} % {:>4} % {:>5} mV ({})",
                name,
                session.temperature().await,
                session.humidity().await,
                session.battery_level().await,
                session.battery_millivolts().await,
                session.mode()
            );
        }
    }

    for session in router.sessions() {
        if let Err(e) = session.shutdown().await {
            warn!(address = session.address(), error = %e, "Shutdown failed");
        }
    }
    Ok(())
}

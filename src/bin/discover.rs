// src/bin/discover.rs

use std::net::IpAddr;

use anyhow::{Context, Result};
use tracing::{info, warn};

use miio::discovery::Discovery;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    // Extra broadcast addresses may be passed on the command line, one per
    // argument; the multicast probe runs either way.
    let broadcasts: Vec<IpAddr> = std::env::args()
        .skip(1)
        .map(|a| a.parse().with_context(|| format!("invalid address {a:?}")))
        .collect::<Result<_>>()?;

    info!("Scanning for MiIO devices...");
    let found = Discovery::new().probe(&broadcasts).await;

    if found.is_empty() {
        warn!("No devices answered. Are you on the same network segment?");
        return Ok(());
    }

    for device in &found {
        match &device.token {
            Some(token) => info!(
                "Device {} at {} with token {}",
                device.device_id, device.address, token
            ),
            None => info!(
                "Device {} at {} (token hidden; extract it via the vendor app)",
                device.device_id, device.address
            ),
        }
    }
    info!("{} device(s) found", found.len());
    Ok(())
}

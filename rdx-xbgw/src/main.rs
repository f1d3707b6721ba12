use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use xbgw::prelude::*;
use xbgw::{NAME, VERSION};

/// `xbgwd [--settings] <path>`, else `$XBGW_SETTINGS`, else the default file.
fn settings_path() -> Option<PathBuf> {
    let mut args = env::args_os().skip(1);
    match args.next() {
        Some(flag) if flag == "--settings" => args.next().map(PathBuf::from),
        Some(path) => Some(PathBuf::from(path)),
        None => env::var_os("XBGW_SETTINGS").map(PathBuf::from),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    // 2. Load setting overrides. Bad settings stop the process here.
    let path = settings_path();
    let overrides = load_overrides(path.as_deref()).context("failed to load settings")?;

    // 3. Without a hardware transport the radios are simulated in memory. The
    //    peers must outlive the gateway or the links read as closed.
    warn!("No XBee hardware transport available, using in-memory radios");
    let (radio, _radio_peer) = channel_radio();
    let (ddo_radio, _ddo_peer) = channel_radio();

    // 4. Assemble the gateway.
    let gateway = Gateway::builder()
        .overrides(overrides)
        .with_xbee(Box::new(radio))
        .with_ddo(Box::new(ddo_radio))
        .with_debug_commands()
        .with_data_point_reporter(Box::new(LogCollector::new()))
        .build()
        .context("failed to assemble the gateway")?;

    // 5. Run until Ctrl+C.
    info!("{} v{} running. Press Ctrl+C to shut down.", NAME, VERSION);
    for (name, report) in gateway.run().await? {
        info!(
            "{}: {} delivered, {} dropped",
            name, report.delivered, report.dropped
        );
    }
    Ok(())
}

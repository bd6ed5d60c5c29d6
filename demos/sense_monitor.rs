//! Sense monitor example
//!
//! Keeps the link to a SensePi sensor up and prints presence and battery
//! alerts as they arrive, plus a status line every 15 seconds.
//!
//! Run with: cargo run --example sense_monitor -- --address AA:BB:CC:DD:EE:FF
//!
//! Without `--address` the last sensor stored in the state file is resumed.
//! Options:
//!   --store <path>    state file (default: sense_state.json)
//!   --config <path>   JSON file overriding link timings

use sense_ble::{Alert, BroadcastAlertSink, JsonFileStore, LinkConfig, Result, SenseService};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,sense_ble=info".into()),
        )
        .init();

    println!("Sense Monitor");
    println!("=============\n");

    let args: Vec<String> = std::env::args().collect();
    let address = arg_value(&args, "--address");
    let store_path = arg_value(&args, "--store").unwrap_or_else(|| "sense_state.json".to_string());

    let config = match arg_value(&args, "--config") {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => LinkConfig::default(),
    };

    let store = Arc::new(JsonFileStore::open(&store_path)?);
    let alerts = BroadcastAlertSink::default();
    let mut alert_rx = alerts.subscribe();

    let service = SenseService::with_default_adapter(store, Arc::new(alerts), config).await?;

    match &address {
        Some(address) => println!("Connecting to {}...\n", address),
        None => println!("Resuming last sensor from {}...\n", store_path),
    }
    service.start(address.as_deref()).await?;

    let mut status = tokio::time::interval(Duration::from_secs(15));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
            alert = alert_rx.recv() => {
                match alert {
                    Ok(Alert::Status { text, .. }) => println!("[status]  {}", text),
                    Ok(alert) => println!("[{}] {}", alert.title(), alert.body()),
                    Err(RecvError::Lagged(missed)) => println!("(missed {} alerts)", missed),
                    Err(RecvError::Closed) => break,
                }
            }
            _ = status.tick() => {
                let state = service.link_state().await?;
                let battery = match service.battery_pct() {
                    -1 => "unknown".to_string(),
                    pct => format!("{}%", pct),
                };
                println!(
                    "link: {:<12} present: {:<5} battery: {}",
                    state.to_string(),
                    service.presence(),
                    battery
                );
            }
        }
    }

    service.shutdown().await?;
    Ok(())
}

//! Listener demo: find a peripheral advertising the demo service, connect,
//! subscribe to its characteristics and print every value change.
//!
//! Run with: cargo run --example listen

use blue_mambo::{
    BtleplugTransport, LogLevel, Result, SessionConfig, SessionManager, CHARACTERISTIC_UUIDS,
    SERVICE_UUID,
};
use std::sync::Arc;
use std::time::Duration;

const PHASE_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_DELAY: Duration = Duration::from_secs(1);

type Manager = Arc<SessionManager<BtleplugTransport>>;

/// Start over after a short pause.
fn rescan_later(manager: Manager) {
    tokio::spawn(async move {
        tokio::time::sleep(RETRY_DELAY).await;
        scan(&manager);
    });
}

fn scan(manager: &Manager) {
    println!("Scanning for service {}...", SERVICE_UUID);
    let next = manager.clone();
    let retry = manager.clone();
    manager.start_scan(
        PHASE_TIMEOUT,
        move |peripheral| {
            println!(
                "Found {} ({:?}, RSSI {:?} dBm)",
                peripheral.id,
                peripheral.local_name(),
                peripheral.rssi
            );
            connect(&next, peripheral);
        },
        move |err| {
            println!("Scan ended: {}", err);
            rescan_later(retry);
        },
    );
}

fn connect(manager: &Manager, peripheral: blue_mambo::PeripheralHandle) {
    let next = manager.clone();
    let rescan = manager.clone();
    let retry = manager.clone();
    manager.connect(
        &peripheral,
        PHASE_TIMEOUT,
        move |peripheral| {
            println!("Connected to {}", peripheral.id);
            let services = next.clone();
            next.discover_services(&peripheral.id, &[SERVICE_UUID], move |_| {
                for service in services.discovered_services() {
                    println!("Service {}", service.uuid);
                    services.get_characteristics(
                        &service,
                        &CHARACTERISTIC_UUIDS,
                        PHASE_TIMEOUT,
                        |service| {
                            for c in &service.characteristics {
                                println!(
                                    "  Characteristic {} (subscribed: {})",
                                    c.uuid, c.subscribed
                                );
                            }
                        },
                        |c| {
                            println!(
                                "  {} = {}",
                                c.uuid,
                                String::from_utf8_lossy(&c.value)
                            );
                        },
                    );
                }
            });
        },
        move |reason| {
            println!("Disconnected: {}", reason);
            rescan_later(rescan);
        },
        move |err| {
            println!("Connect failed: {}", err);
            rescan_later(retry);
        },
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("blue_mambo=debug")),
        )
        .init();

    let config = SessionConfig::new()
        .with_log_level(LogLevel::Debug)
        .with_scan_services([SERVICE_UUID]);
    let manager = Arc::new(SessionManager::bluetooth(config).await?);

    println!("Radio is {}", manager.radio_state());
    scan(&manager);

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("Failed to wait for Ctrl-C: {}", e);
    }
    println!("\nShutting down...");
    manager.shutdown().await;

    Ok(())
}

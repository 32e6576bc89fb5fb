//! Loopback demo: a central and a peripheral on the in-memory radio.
//!
//! The peripheral advertises the demo service and publishes a counter on
//! both characteristics; the central walks the whole session and prints
//! every value it receives.
//!
//! Run with: cargo run --example loopback

use blue_mambo::ble::LoopbackTransport;
use blue_mambo::{
    Advertiser, EventQueue, LogLevel, LoopbackRadio, Result, SessionConfig, SessionManager,
    CHARACTERISTIC_UUIDS, SERVICE_NAME, SERVICE_UUID,
};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

const PHASE_TIMEOUT: Duration = Duration::from_secs(5);
const UPDATES: usize = 5;

fn listen(manager: &Arc<SessionManager<LoopbackTransport>>) {
    let next = manager.clone();
    manager.start_scan(
        PHASE_TIMEOUT,
        move |peripheral| {
            println!(
                "[central] found {:?} ({})",
                peripheral.local_name(),
                peripheral.id
            );
            let discover = next.clone();
            next.connect(
                &peripheral,
                PHASE_TIMEOUT,
                move |peripheral| {
                    println!("[central] connected to {}", peripheral.id);
                    let services = discover.clone();
                    discover.discover_services(&peripheral.id, &[SERVICE_UUID], move |_| {
                        for service in services.discovered_services() {
                            services.get_characteristics(
                                &service,
                                &CHARACTERISTIC_UUIDS,
                                PHASE_TIMEOUT,
                                |service| {
                                    println!(
                                        "[central] subscribed to {} characteristics of {}",
                                        service.characteristics.len(),
                                        service.uuid
                                    );
                                },
                                |c| {
                                    println!(
                                        "[central] {} = {}",
                                        c.uuid,
                                        String::from_utf8_lossy(&c.value)
                                    );
                                },
                            );
                        }
                    });
                },
                |reason| println!("[central] disconnected: {}", reason),
                |err| println!("[central] connect failed: {}", err),
            );
        },
        |err| println!("[central] scan failed: {}", err),
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

    let radio = LoopbackRadio::new();
    let queue = EventQueue::new();
    let manager = Arc::new(SessionManager::new(
        radio.central(queue.sink()),
        queue,
        SessionConfig::new()
            .with_log_level(LogLevel::Debug)
            .with_scan_services([SERVICE_UUID]),
    ));

    listen(&manager);

    let peripheral = radio.peripheral(SERVICE_NAME, -42);
    tokio::time::sleep(Duration::from_secs(1)).await;
    peripheral
        .start_advertising(SERVICE_UUID, &CHARACTERISTIC_UUIDS)
        .await?;
    println!("[peripheral] advertising {}", SERVICE_UUID);

    tokio::time::sleep(Duration::from_millis(100)).await;
    for i in 1..=UPDATES {
        for (n, characteristic) in CHARACTERISTIC_UUIDS.iter().enumerate() {
            let value = Bytes::from(format!("{:02}", i * 10 + n));
            let notified = peripheral
                .notify_subscribers(*characteristic, value)
                .await?;
            println!("[peripheral] notified {} central(s)", notified);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    manager.disconnect(peripheral.id());
    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.shutdown().await;

    Ok(())
}

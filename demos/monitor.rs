//! Event monitor demo
//!
//! Run with: cargo run --example monitor [SECONDS]
//!
//! Starts a supplier and a consumer on one bus over TCP sockets. The supplier
//! polls a simulated amplitude every 100 ms and runs the change detector
//! (abs_change = 0.5); the consumer prints every change event it receives and
//! periodically prints both sides' statistics.
//!
//! Set RUST_LOG=evbus_rs=debug to follow the subscription and dispatch flow.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use evbus_rs::supplier::{AdminDevice, AttrProperties};
use evbus_rs::wire::{AttributeValue, ChangeThresholds, Quality};
use evbus_rs::{
    Directory, EventBus, EventCallback, EventConfig, EventData, EventPayload, EventSink, EventType,
    TcpConfig,
};

const ADMIN: &str = "dserver/monitor/demo";
const DEVICE: &str = "sys/tg_test/1";
const ATTR: &str = "ampli";

/// Prints received events
struct Printer;

#[async_trait]
impl EventCallback for Printer {
    async fn push_event(&self, event: EventData) {
        match &event.payload {
            EventPayload::Value(v) => println!(
                "[{}] {}/{} = {:?} ({:?})",
                event.event_type,
                event.device,
                event.attr_name,
                v.data.first_f64().unwrap_or(f64::NAN),
                v.quality
            ),
            EventPayload::Error(errors) => {
                for e in errors {
                    println!("[{}] {} error: {} ({})", event.event_type, event.device, e.reason, e.desc);
                }
            }
            other => println!("[{}] {:?}", event.event_type, other),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "evbus_rs=info".into()),
        )
        .init();

    let seconds: u64 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(10);

    let config = EventConfig::tcp(TcpConfig::default()).heartbeat_period(Duration::from_secs(1));
    let bus = EventBus::new(config);

    let supplier = bus.start_supplier(ADMIN).await?;
    supplier
        .register_attribute(
            DEVICE,
            ATTR,
            AttrProperties::polled(ATTR).change(ChangeThresholds::abs(0.5)),
        )
        .await;
    println!(
        "Supplier {} on heartbeat={} event={}",
        supplier.admin_name(),
        supplier.heartbeat_endpoint(),
        supplier.event_endpoint()
    );

    let directory = Directory::new();
    directory
        .register_server(AdminDevice::new(Arc::clone(&supplier)), &[DEVICE])
        .await;

    let consumer = bus.start_consumer(directory).await?;
    let id = consumer
        .subscribe_event(
            DEVICE,
            ATTR,
            EventType::Change,
            EventSink::callback(Printer),
            &[],
            false,
        )
        .await?;
    println!("Subscribed to {}/{} change events (id {})", DEVICE, ATTR, id);

    let poller = {
        let supplier = Arc::clone(&supplier);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(100));
            let mut t = 0.0f64;
            loop {
                interval.tick().await;
                t += 0.1;
                let sample = AttributeValue::double(ATTR, 5.0 * t.sin(), Quality::Valid);
                if let Err(e) = supplier
                    .detect_and_push_events(DEVICE, ATTR, Ok(sample))
                    .await
                {
                    eprintln!("poll failed: {}", e);
                }
            }
        })
    };

    let mut stats = tokio::time::interval(Duration::from_secs(2));
    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            _ = stats.tick() => {
                let s = supplier.stats();
                let c = consumer.stats();
                println!(
                    "Stats: pushed={} ({:.1}/s) heartbeats={} received={} dispatched={}",
                    s.events_pushed,
                    s.event_rate(),
                    s.heartbeats_sent,
                    c.events_received,
                    c.events_dispatched
                );
            }
        }
    }

    poller.abort();
    consumer.unsubscribe_event(id).await?;
    bus.shutdown().await;
    Ok(())
}

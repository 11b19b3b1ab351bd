use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::registry::{SinkHandle, SinkRegistry};
use crate::sink::SinkCtlMsg;

fn new_handle(consumer: &str) -> (SinkHandle, mpsc::Receiver<SinkCtlMsg>) {
    let (tx, rx) = mpsc::channel(100);
    (SinkHandle { consumer: Arc::new(consumer.to_string()), tx }, rx)
}

#[tokio::test]
async fn register_and_get_round_trip() -> Result<()> {
    let registry = SinkRegistry::new();
    let (handle, _rx) = new_handle("sink-0");

    registry.register(handle);
    let fetched = registry.get("sink-0");

    assert!(fetched.is_some(), "expected registered handle to be fetchable");
    assert_eq!(fetched.as_ref().map(|h| h.consumer.as_str()), Some("sink-0"), "unexpected consumer on fetched handle");
    Ok(())
}

#[tokio::test]
async fn deregister_removes_handle() -> Result<()> {
    let registry = SinkRegistry::new();
    let (handle, _rx) = new_handle("sink-0");

    registry.register(handle);
    registry.deregister("sink-0");

    assert!(registry.get("sink-0").is_none(), "expected handle to be removed after deregister");
    Ok(())
}

#[tokio::test]
async fn register_replaces_existing_handle() -> Result<()> {
    let registry = SinkRegistry::new();
    let (first, _first_rx) = new_handle("sink-0");
    let (second, mut second_rx) = new_handle("sink-0");

    registry.register(first);
    registry.register(second);
    let fetched = registry.get("sink-0").ok_or_else(|| anyhow::anyhow!("expected handle to be registered"))?;
    fetched.add_demand(1).await?;

    let msg = second_rx.try_recv();
    assert!(matches!(msg, Ok(SinkCtlMsg::AddDemand(1))), "expected demand signal on the replacement handle's channel");
    Ok(())
}

#[tokio::test]
async fn wakeups_fan_out_to_subscribers() -> Result<()> {
    let registry = SinkRegistry::new();
    let mut sub_a = registry.subscribe_wakeups();
    let mut sub_b = registry.subscribe_wakeups();

    registry.notify_messages_available(Arc::new("sink-0".to_string()));

    let wakeup_a = sub_a.recv().await?;
    let wakeup_b = sub_b.recv().await?;
    assert_eq!(wakeup_a.as_str(), "sink-0", "unexpected wakeup consumer for subscriber a, got {}", wakeup_a);
    assert_eq!(wakeup_b.as_str(), "sink-0", "unexpected wakeup consumer for subscriber b, got {}", wakeup_b);
    Ok(())
}

#[tokio::test]
async fn notify_without_subscribers_is_a_noop() -> Result<()> {
    let registry = SinkRegistry::new();
    registry.notify_messages_available(Arc::new("sink-0".to_string()));
    Ok(())
}

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;

use portnote::events::sse_frame;
use portnote::{Event, EventBroker, EventKind, PortStatus};

#[tokio::test]
async fn test_slow_subscriber_never_blocks_publisher() {
    let broker = Arc::new(EventBroker::new());
    let _stalled = broker.subscribe();
    let mut live = broker.subscribe();

    let start = Instant::now();
    for i in 0..10_000 {
        broker.publish(Event::for_host(EventKind::HostUpdated, i));
        if i % 4 == 0 {
            while live.try_recv().is_some() {}
        }
    }
    assert!(start.elapsed() < Duration::from_secs(5));

    broker.publish(Event::for_host(EventKind::HostDeleted, 7));
    let mut last = None;
    while let Some(data) = live.try_recv() {
        last = Some(data);
    }
    let event: Event = serde_json::from_str(&last.unwrap()).unwrap();
    assert_eq!(event.kind, EventKind::HostDeleted);
}

#[tokio::test]
async fn test_scan_events_render_as_sse() {
    let broker = EventBroker::new();
    let events = broker.subscribe();
    let checked = Utc::now();

    broker.publish(Event::port_status(3, 11, PortStatus::Closed, checked));
    broker.publish(Event::host_scanned(3, true, false, checked));
    drop(broker);

    let frames: Vec<String> = events.map(|data| sse_frame(&data)).collect().await;
    assert_eq!(frames.len(), 2);

    for frame in &frames {
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("}\n\n"));
    }

    let status: serde_json::Value =
        serde_json::from_str(frames[0].trim_start_matches("data: ").trim_end()).unwrap();
    assert_eq!(status["type"], "port_status");
    assert_eq!(status["hostId"], 3);
    assert_eq!(status["portId"], 11);
    assert_eq!(status["payload"]["status"], "closed");
    assert!(status["payload"]["lastChecked"].is_string());

    let scanned: serde_json::Value =
        serde_json::from_str(frames[1].trim_start_matches("data: ").trim_end()).unwrap();
    assert_eq!(scanned["type"], "host_scanned");
    assert!(scanned.get("portId").is_none());
    assert_eq!(scanned["payload"]["changed"], true);
    assert_eq!(scanned["payload"]["success"], false);
}

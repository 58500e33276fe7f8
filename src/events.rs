//! Best-effort fan-out of inventory changes to live observers
//!
//! Every subscriber owns a small bounded queue. [`EventBroker::publish`]
//! serializes an event once and offers it to each queue without waiting; a
//! full queue loses that one message and nothing else. Observers are expected
//! to refetch state when they suspect they missed something.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::models::PortStatus;

/// Default delivery queue capacity per subscriber
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 8;

/// Fixed event vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    HostCreated,
    HostUpdated,
    HostDeleted,
    HostScanStarted,
    HostScanned,
    PortCreated,
    PortUpdated,
    PortDeleted,
    PortHidden,
    PortVisible,
    PortsHidden,
    PortsUnhidden,
    PortsDeleted,
    PortStatus,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::HostCreated => "host_created",
            EventKind::HostUpdated => "host_updated",
            EventKind::HostDeleted => "host_deleted",
            EventKind::HostScanStarted => "host_scan_started",
            EventKind::HostScanned => "host_scanned",
            EventKind::PortCreated => "port_created",
            EventKind::PortUpdated => "port_updated",
            EventKind::PortDeleted => "port_deleted",
            EventKind::PortHidden => "port_hidden",
            EventKind::PortVisible => "port_visible",
            EventKind::PortsHidden => "ports_hidden",
            EventKind::PortsUnhidden => "ports_unhidden",
            EventKind::PortsDeleted => "ports_deleted",
            EventKind::PortStatus => "port_status",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transient change notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            host_id: None,
            port_id: None,
            payload: None,
        }
    }

    pub fn for_host(kind: EventKind, host_id: i64) -> Self {
        Self {
            host_id: Some(host_id),
            ..Self::new(kind)
        }
    }

    pub fn for_port(kind: EventKind, host_id: i64, port_id: i64) -> Self {
        Self {
            host_id: Some(host_id),
            port_id: Some(port_id),
            ..Self::new(kind)
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn host_created(host_id: i64, name: &str, address: &str) -> Self {
        Self::for_host(EventKind::HostCreated, host_id).with_payload(json!({
            "name": name,
            "address": address,
        }))
    }

    pub fn scan_started(host_id: i64, started: DateTime<Utc>) -> Self {
        Self::for_host(EventKind::HostScanStarted, host_id).with_payload(json!({ "started": started }))
    }

    pub fn host_scanned(host_id: i64, changed: bool, success: bool, completed: DateTime<Utc>) -> Self {
        Self::for_host(EventKind::HostScanned, host_id).with_payload(json!({
            "changed": changed,
            "success": success,
            "completed": completed,
        }))
    }

    pub fn port_created(host_id: i64, port_id: i64, number: u16, fingerprint: &str) -> Self {
        Self::for_port(EventKind::PortCreated, host_id, port_id).with_payload(json!({
            "number": number,
            "fingerprint": fingerprint,
        }))
    }

    pub fn port_status(host_id: i64, port_id: i64, status: PortStatus, checked: DateTime<Utc>) -> Self {
        Self::for_port(EventKind::PortStatus, host_id, port_id).with_payload(json!({
            "status": status,
            "lastChecked": checked,
        }))
    }
}

/// Frame a serialized event for a server-sent-events connection
pub fn sse_frame(data: &str) -> String {
    format!("data: {}\n\n", data)
}

type Registry = RwLock<HashMap<u64, mpsc::Sender<Arc<str>>>>;

/// Observer registry with bounded per-subscriber queues
#[derive(Debug)]
pub struct EventBroker {
    subscribers: Arc<Registry>,
    next_id: AtomicU64,
    buffer: usize,
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroker {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_SUBSCRIBER_BUFFER)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    /// Register a new observer
    ///
    /// The returned [`Subscription`] yields serialized events and
    /// unregisters itself when dropped or [`Subscription::unsubscribe`]d.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().insert(id, tx);
        log::debug!("Subscriber {} registered", id);

        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.subscribers),
        }
    }

    /// Offer an event to every subscriber without blocking
    pub fn publish(&self, event: Event) {
        let data: Arc<str> = match serde_json::to_string(&event) {
            Ok(data) => data.into(),
            Err(e) => {
                log::error!("Dropping unserializable {} event: {}", event.kind, e);
                return;
            }
        };

        let subscribers = self.subscribers.read();
        for (id, tx) in subscribers.iter() {
            match tx.try_send(data.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    log::debug!("Subscriber {} queue full, dropped {} event", id, event.kind);
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

/// A registered observer's inbound event stream
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Arc<str>>,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Next serialized event; `None` once the broker is gone
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.rx.recv().await
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<Arc<str>> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving events
    pub fn unsubscribe(self) {
        drop(self);
    }

    fn deregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.write().remove(&self.id);
            log::debug!("Subscriber {} removed", self.id);
        }
    }
}

impl Stream for Subscription {
    type Item = Arc<str>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.deregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_publish_without_subscribers() {
        let broker = EventBroker::new();
        broker.publish(Event::for_host(EventKind::HostCreated, 1));
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(Event::for_port(EventKind::PortStatus, 4, 9)).unwrap();
        assert_eq!(json, json!({ "type": "port_status", "hostId": 4, "portId": 9 }));

        let bare = serde_json::to_string(&Event::new(EventKind::PortsDeleted)).unwrap();
        assert_eq!(bare, r#"{"type":"ports_deleted"}"#);
        assert_eq!(sse_frame(&bare), "data: {\"type\":\"ports_deleted\"}\n\n");
    }

    #[test]
    fn test_kind_names_match_serde() {
        let kinds = [
            EventKind::HostCreated,
            EventKind::HostUpdated,
            EventKind::HostDeleted,
            EventKind::HostScanStarted,
            EventKind::HostScanned,
            EventKind::PortCreated,
            EventKind::PortUpdated,
            EventKind::PortDeleted,
            EventKind::PortHidden,
            EventKind::PortVisible,
            EventKind::PortsHidden,
            EventKind::PortsUnhidden,
            EventKind::PortsDeleted,
            EventKind::PortStatus,
        ];
        for kind in kinds {
            let serialized = serde_json::to_string(&kind).unwrap();
            assert_eq!(serialized, format!("\"{}\"", kind.as_str()));
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let broker = EventBroker::new();
        let mut a = broker.subscribe();
        let mut b = broker.subscribe();

        broker.publish(Event::for_host(EventKind::HostScanStarted, 2));

        let got_a = a.recv().await.unwrap();
        let got_b = b.recv().await.unwrap();
        assert_eq!(got_a, got_b);
        let event: Event = serde_json::from_str(&got_a).unwrap();
        assert_eq!(event.kind, EventKind::HostScanStarted);
        assert_eq!(event.host_id, Some(2));
    }

    #[tokio::test]
    async fn test_full_queue_drops_only_overflow() {
        let broker = EventBroker::with_buffer(2);
        let mut slow = broker.subscribe();
        let mut fast = broker.subscribe();

        for host in 1..=3 {
            broker.publish(Event::for_host(EventKind::HostUpdated, host));
            // The fast subscriber keeps up
            assert!(fast.try_recv().is_some());
        }

        let first: Event = serde_json::from_str(&slow.try_recv().unwrap()).unwrap();
        let second: Event = serde_json::from_str(&slow.try_recv().unwrap()).unwrap();
        assert_eq!(first.host_id, Some(1));
        assert_eq!(second.host_id, Some(2));
        assert!(slow.try_recv().is_none());

        // Delivery resumes once there is room again
        broker.publish(Event::for_host(EventKind::HostUpdated, 4));
        let resumed: Event = serde_json::from_str(&slow.recv().await.unwrap()).unwrap();
        assert_eq!(resumed.host_id, Some(4));
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let broker = EventBroker::new();
        let sub = broker.subscribe();
        let other = broker.subscribe();
        assert_eq!(broker.subscriber_count(), 2);

        sub.unsubscribe();
        assert_eq!(broker.subscriber_count(), 1);
        drop(other);
        assert_eq!(broker.subscriber_count(), 0);

        broker.publish(Event::new(EventKind::HostDeleted));
    }

    #[tokio::test]
    async fn test_subscription_is_a_stream() {
        let broker = EventBroker::new();
        let sub = broker.subscribe();
        broker.publish(Event::for_host(EventKind::HostCreated, 1));
        broker.publish(Event::for_host(EventKind::HostDeleted, 1));

        let frames: Vec<String> = sub.take(2).map(|data| sse_frame(&data)).collect().await;
        assert_eq!(frames.len(), 2);
        assert!(frames[0].starts_with("data: {\"type\":\"host_created\""));
        assert!(frames[1].ends_with("\n\n"));
    }

    #[tokio::test]
    async fn test_concurrent_subscribe_and_publish() {
        let broker = Arc::new(EventBroker::new());
        let publisher = {
            let broker = broker.clone();
            tokio::spawn(async move {
                for i in 0..500 {
                    broker.publish(Event::for_host(EventKind::HostUpdated, i));
                    tokio::task::yield_now().await;
                }
            })
        };

        for _ in 0..50 {
            let sub = broker.subscribe();
            tokio::task::yield_now().await;
            drop(sub);
        }

        publisher.await.unwrap();
        assert_eq!(broker.subscriber_count(), 0);
    }
}

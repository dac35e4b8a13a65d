//! Connection life-cycle events
//!
//! The core reports every state change through [`EventEmitter::emit`]. The
//! [`EventBroker`] is the in-process emitter: it fans events out to filtered
//! subscribers in the order they were emitted.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc::{channel, error::TrySendError, Receiver, Sender};

use crate::bluetooth::types::PeripheralIdentity;

/// Status carried by a [`ConnectionEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Connected,
    Disconnected,
    ConnectionFailed,
    PairingStarted,
    PairingCompleted,
    ForgotDevice,
    /// A known peripheral came back into range while nothing was connected
    DeviceAvailable,
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::ConnectionFailed => "connection_failed",
            Self::PairingStarted => "pairing_started",
            Self::PairingCompleted => "pairing_completed",
            Self::ForgotDevice => "forgot_device",
            Self::DeviceAvailable => "device_available",
        };
        f.write_str(name)
    }
}

/// One entry in the connection history
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEvent {
    pub device_name: String,
    pub device_id: String,
    pub status: EventStatus,
    pub details: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ConnectionEvent {
    pub fn new(peripheral: &PeripheralIdentity, status: EventStatus) -> Self {
        Self {
            device_name: peripheral.label().to_string(),
            device_id: peripheral.id.clone(),
            status,
            details: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({})",
            self.timestamp.format("%H:%M:%S"),
            self.status,
            self.device_name
        )?;
        if let Some(details) = &self.details {
            write!(f, ": {}", details)?;
        }
        Ok(())
    }
}

/// Sink for connection events
///
/// Emission is fire-and-forget; implementations must not block.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: ConnectionEvent);
}

/// Defines which events a subscriber is interested in
pub enum EventFilter {
    /// Accept all events
    All,
    /// Only the listed statuses
    Statuses(Vec<EventStatus>),
    /// Only events for the listed peripheral ids
    Devices(Vec<String>),
    /// Custom filter function
    Custom(Box<dyn Fn(&ConnectionEvent) -> bool + Send + Sync + 'static>),
}

impl fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "EventFilter::All"),
            Self::Statuses(statuses) => write!(f, "EventFilter::Statuses({:?})", statuses),
            Self::Devices(ids) => write!(f, "EventFilter::Devices({:?})", ids),
            Self::Custom(_) => write!(f, "EventFilter::Custom(<function>)"),
        }
    }
}

impl EventFilter {
    pub fn all() -> Self {
        Self::All
    }

    pub fn statuses(statuses: Vec<EventStatus>) -> Self {
        Self::Statuses(statuses)
    }

    pub fn devices(ids: Vec<String>) -> Self {
        Self::Devices(ids)
    }

    pub fn custom<F>(filter_fn: F) -> Self
    where
        F: Fn(&ConnectionEvent) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Box::new(filter_fn))
    }

    pub fn matches(&self, event: &ConnectionEvent) -> bool {
        match self {
            Self::All => true,
            Self::Statuses(statuses) => statuses.contains(&event.status),
            Self::Devices(ids) => ids.iter().any(|id| *id == event.device_id),
            Self::Custom(filter_fn) => filter_fn(event),
        }
    }
}

/// Subscriber ID type
pub type SubscriberId = u32;

struct Subscriber {
    id: SubscriberId,
    sender: Sender<ConnectionEvent>,
    filter: EventFilter,
}

struct BrokerInner {
    next_subscriber_id: SubscriberId,
    subscribers: Vec<Subscriber>,
}

/// Fan-out emitter with per-subscriber filters
pub struct EventBroker {
    inner: Mutex<BrokerInner>,
    capacity: usize,
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroker {
    pub fn new() -> Self {
        Self::with_capacity(100)
    }

    /// Broker whose subscriber channels buffer `capacity` events
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BrokerInner {
                next_subscriber_id: 1,
                subscribers: Vec::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to events with a filter
    pub fn subscribe(&self, filter: EventFilter) -> (SubscriberId, Receiver<ConnectionEvent>) {
        let (tx, rx) = channel(self.capacity);
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        inner.subscribers.push(Subscriber { id, sender: tx, filter });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.subscribers.retain(|s| s.id != id);
        }
    }

    /// Replace a subscriber's filter; false if the subscriber is gone
    pub fn modify_filter(&self, id: SubscriberId, filter: EventFilter) -> bool {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(subscriber) = inner.subscribers.iter_mut().find(|s| s.id == id) {
                subscriber.filter = filter;
                return true;
            }
        }
        false
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.subscribers.len()).unwrap_or(0)
    }
}

impl EventEmitter for EventBroker {
    fn emit(&self, event: ConnectionEvent) {
        log::debug!("Event: {}", event);
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.subscribers.retain(|subscriber| {
            if !subscriber.filter.matches(&event) {
                return !subscriber.sender.is_closed();
            }
            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    log::warn!("Event subscriber {} is lagging, dropping {}", subscriber.id, event.status);
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }
}

/// Emitter that only writes events to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEmitter;

impl EventEmitter for LogEmitter {
    fn emit(&self, event: ConnectionEvent) {
        log::info!("{}", event);
    }
}

/// A helper to create a Stream from an event receiver
pub fn receiver_to_stream(mut rx: Receiver<ConnectionEvent>) -> impl Stream<Item = ConnectionEvent> {
    async_stream::stream! {
        while let Some(event) = rx.recv().await {
            yield event;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn event(id: &str, status: EventStatus) -> ConnectionEvent {
        ConnectionEvent::new(&PeripheralIdentity::new(id, Some("NavBand".into())), status)
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(EventStatus::ConnectionFailed.to_string(), "connection_failed");
        assert_eq!(
            serde_json::to_string(&EventStatus::ForgotDevice).unwrap_or_default(),
            "\"forgot_device\""
        );
    }

    #[test]
    fn test_event_filters() {
        let connected = event("AA:01", EventStatus::Connected);
        let failed = event("BB:02", EventStatus::ConnectionFailed);

        assert!(EventFilter::all().matches(&connected));

        let statuses = EventFilter::statuses(vec![EventStatus::ConnectionFailed]);
        assert!(!statuses.matches(&connected));
        assert!(statuses.matches(&failed));

        let devices = EventFilter::devices(vec!["AA:01".to_string()]);
        assert!(devices.matches(&connected));
        assert!(!devices.matches(&failed));

        let custom = EventFilter::custom(|e| e.details.is_some());
        assert!(!custom.matches(&connected));
        assert!(custom.matches(&connected.clone().with_details("link loss")));
    }

    #[test]
    fn test_event_uses_label_when_name_missing() {
        let e = ConnectionEvent::new(&PeripheralIdentity::new("AA:01", None), EventStatus::Connected);
        assert_eq!(e.device_name, "AA:01");
        assert_eq!(e.device_id, "AA:01");
    }

    #[tokio::test]
    async fn test_broker_preserves_order() {
        let broker = EventBroker::new();
        let (_, rx) = broker.subscribe(EventFilter::all());

        broker.emit(event("AA:01", EventStatus::PairingStarted));
        broker.emit(event("AA:01", EventStatus::Connected));
        broker.emit(event("AA:01", EventStatus::Disconnected));
        broker.unsubscribe(1);

        let statuses: Vec<EventStatus> = receiver_to_stream(rx).map(|e| e.status).collect().await;
        assert_eq!(
            statuses,
            vec![EventStatus::PairingStarted, EventStatus::Connected, EventStatus::Disconnected]
        );
    }

    #[tokio::test]
    async fn test_broker_prunes_closed_subscribers() {
        let broker = EventBroker::new();
        let (_, rx) = broker.subscribe(EventFilter::all());
        let (id, _keep) = broker.subscribe(EventFilter::statuses(vec![EventStatus::Connected]));
        assert_eq!(broker.subscriber_count(), 2);

        drop(rx);
        broker.emit(event("AA:01", EventStatus::Disconnected));
        assert_eq!(broker.subscriber_count(), 1);

        assert!(broker.modify_filter(id, EventFilter::all()));
        assert!(!broker.modify_filter(99, EventFilter::all()));
    }
}

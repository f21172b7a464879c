use crate::dispatcher::PrintJob;
use crate::status::ConnectionState;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

/// Notifications emitted by the registry and the dispatcher.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// A printer was registered, updated, restored or removed
    IdentitySetChanged { printer_ids: Vec<String> },
    /// A printer's connection state changed
    StateChanged {
        printer_id: String,
        state: ConnectionState,
    },
    /// The default target for sends without an explicit printer changed
    ActiveChanged { printer_id: Option<String> },
    /// A job entered `pending` or `sending`
    JobUpdated { job: PrintJob },
    /// A job finished successfully
    JobCompleted { job: PrintJob },
    /// A job failed; the reason is in the job status
    JobFailed { job: PrintJob },
}

impl BridgeEvent {
    pub fn job(&self) -> Option<&PrintJob> {
        match self {
            BridgeEvent::JobUpdated { job }
            | BridgeEvent::JobCompleted { job }
            | BridgeEvent::JobFailed { job } => Some(job),
            _ => None,
        }
    }
}

pub trait BridgeObserver: Send + Sync {
    fn on_event(&self, event: &BridgeEvent);
}

impl<F> BridgeObserver for F
where
    F: Fn(&BridgeEvent) + Send + Sync,
{
    fn on_event(&self, event: &BridgeEvent) {
        self(event)
    }
}

/// Synchronous fan-out to observers, in subscription order.
///
/// Observers run without the list lock held, so they may call back into the
/// registry or dispatcher (or subscribe) from inside `on_event`. An event
/// emitted from an observer is delivered before the outer emit returns.
#[derive(Default)]
pub struct EventBus {
    observers: Mutex<Vec<Arc<dyn BridgeObserver>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn BridgeObserver>) {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        observers.push(observer);
        debug!("Event observer subscribed (total: {})", observers.len());
    }

    /// Subscribe through an unbounded channel, for async consumers
    /// such as a history store.
    pub fn subscribe_channel(&self) -> mpsc::UnboundedReceiver<BridgeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(Arc::new(move |event: &BridgeEvent| {
            let _ = tx.send(event.clone());
        }));
        rx
    }

    pub fn emit(&self, event: BridgeEvent) {
        let observers: Vec<Arc<dyn BridgeObserver>> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in &observers {
            observer.on_event(&event);
        }
    }

    pub fn emit_all(&self, events: Vec<BridgeEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observers_called_in_subscription_order() {
        let bus = EventBus::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let calls = calls.clone();
            bus.subscribe(Arc::new(move |_: &BridgeEvent| {
                calls.lock().unwrap().push(name);
            }));
        }

        bus.emit(BridgeEvent::ActiveChanged { printer_id: None });

        assert_eq!(*calls.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_channel_subscriber_receives_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_channel();

        bus.emit(BridgeEvent::StateChanged {
            printer_id: "prn_1".to_string(),
            state: ConnectionState::Connecting,
        });

        match rx.recv().await {
            Some(BridgeEvent::StateChanged { printer_id, state }) => {
                assert_eq!(printer_id, "prn_1");
                assert_eq!(state, ConnectionState::Connecting);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_observer_can_emit_and_subscribe_while_handling() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&bus);
        let sink = seen.clone();
        bus.subscribe(Arc::new(move |event: &BridgeEvent| {
            sink.lock().unwrap().push(event.clone());
            if let (BridgeEvent::IdentitySetChanged { .. }, Some(bus)) = (event, weak.upgrade()) {
                bus.subscribe(Arc::new(|_: &BridgeEvent| {}));
                bus.emit(BridgeEvent::ActiveChanged { printer_id: None });
            }
        }));

        bus.emit(BridgeEvent::IdentitySetChanged {
            printer_ids: Vec::new(),
        });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(matches!(seen[1], BridgeEvent::ActiveChanged { printer_id: None }));
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = BridgeEvent::ActiveChanged {
            printer_id: Some("prn_9".to_string()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "active_changed");
        assert_eq!(json["printer_id"], "prn_9");
    }
}

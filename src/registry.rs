//! Connection Registry: the printer identities, their runtime connection
//! state, the live transport sessions and the active printer.
//!
//! The registry lock is never held across an await; transports connect and
//! close outside it, and events are emitted after it is released.

use crate::config::{NewPrinter, PrinterIdentity, PrinterUpdate};
use crate::errors::{BridgeError, ConnectionError, RegistryError};
use crate::events::{BridgeEvent, EventBus};
use crate::status::ConnectionState;
use crate::transport::{TransportFactory, TransportSession};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};

struct PrinterEntry {
    identity: PrinterIdentity,
    state: watch::Sender<ConnectionState>,
    session: Option<Arc<TransportSession>>,
    /// A disconnect is releasing `session`; the state stays `connected`
    /// until the transport is closed
    closing: bool,
    last_error: Option<ConnectionError>,
}

impl PrinterEntry {
    fn new(identity: PrinterIdentity) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            identity,
            state,
            session: None,
            closing: false,
            last_error: None,
        }
    }

    fn current(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Publish a new state and return the matching event.
    fn transition(&self, next: ConnectionState) -> BridgeEvent {
        let previous = self.state.send_replace(next.clone());
        debug_assert!(
            previous.can_transition_to(&next),
            "illegal transition {:?} -> {:?}",
            previous,
            next
        );
        debug!(
            "Printer {} state: {} → {}",
            self.identity.id,
            previous.as_str(),
            next.as_str()
        );
        BridgeEvent::StateChanged {
            printer_id: self.identity.id.clone(),
            state: next,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    printers: HashMap<String, PrinterEntry>,
    /// Registration order, for stable listings
    order: Vec<String>,
    active: Option<String>,
}

/// Point-in-time view of one printer for UIs and status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct PrinterSnapshot {
    #[serde(flatten)]
    pub identity: PrinterIdentity,
    pub state: ConnectionState,
    pub status: Option<String>,
    pub active: bool,
}

enum ConnectPlan {
    AlreadyConnected,
    Wait(watch::Receiver<ConnectionState>),
    AwaitClose(watch::Receiver<ConnectionState>),
    Open(PrinterIdentity),
}

enum DisconnectPlan {
    Done(Option<BridgeEvent>),
    /// Another operation owns the printer; wait for the state to move on
    Wait(watch::Receiver<ConnectionState>, ConnectionState),
    Close(Arc<TransportSession>),
}

pub struct PrinterRegistry {
    inner: RwLock<RegistryInner>,
    factory: Arc<dyn TransportFactory>,
    events: Arc<EventBus>,
}

impl PrinterRegistry {
    pub fn new(factory: Arc<dyn TransportFactory>, events: Arc<EventBus>) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            factory,
            events,
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a printer. The registry assigns the id.
    pub fn register(&self, new: NewPrinter) -> Result<PrinterIdentity, RegistryError> {
        new.transport.validate()?;
        let display_name = new.display_name.trim();
        if display_name.is_empty() {
            return Err(RegistryError::InvalidConfig(
                "display name must not be empty".to_string(),
            ));
        }

        let identity = PrinterIdentity {
            id: format!("prn_{}", uuid::Uuid::new_v4().simple()),
            display_name: display_name.to_string(),
            transport: new.transport,
            paper_width: new.paper_width,
        };

        let printer_ids = {
            let mut inner = self.write();
            let key = identity.transport.endpoint_key();
            if let Some(existing) = inner
                .printers
                .values()
                .find(|e| e.identity.transport.endpoint_key() == key)
            {
                return Err(RegistryError::AlreadyExists(format!(
                    "{} already targets {}",
                    existing.identity.id, key
                )));
            }

            inner.order.push(identity.id.clone());
            inner
                .printers
                .insert(identity.id.clone(), PrinterEntry::new(identity.clone()));
            inner.order.clone()
        };

        info!(
            "Registered printer {} ({}) via {}",
            identity.display_name,
            identity.id,
            identity.kind()
        );
        self.events.emit(BridgeEvent::IdentitySetChanged { printer_ids });
        Ok(identity)
    }

    /// Change a printer's name or transport settings. The transport can only
    /// change while the printer is disconnected or in error.
    pub fn update(&self, id: &str, update: PrinterUpdate) -> Result<PrinterIdentity, RegistryError> {
        if let Some(transport) = &update.transport {
            transport.validate()?;
        }
        if let Some(name) = &update.display_name {
            if name.trim().is_empty() {
                return Err(RegistryError::InvalidConfig(
                    "display name must not be empty".to_string(),
                ));
            }
        }

        let (identity, printer_ids) = {
            let mut inner = self.write();

            if let Some(transport) = &update.transport {
                let key = transport.endpoint_key();
                let clash = inner
                    .printers
                    .values()
                    .any(|e| e.identity.id != id && e.identity.transport.endpoint_key() == key);
                if clash {
                    return Err(RegistryError::AlreadyExists(key));
                }
            }

            let entry = inner
                .printers
                .get_mut(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

            if update.transport.is_some()
                && matches!(
                    entry.current(),
                    ConnectionState::Connecting | ConnectionState::Connected
                )
            {
                return Err(RegistryError::InvalidConfig(format!(
                    "disconnect {} before changing its transport",
                    id
                )));
            }

            if let Some(name) = update.display_name {
                entry.identity.display_name = name.trim().to_string();
            }
            if let Some(transport) = update.transport {
                entry.identity.transport = transport;
                entry.last_error = None;
            }

            let identity = entry.identity.clone();
            (identity, inner.order.clone())
        };

        self.events.emit(BridgeEvent::IdentitySetChanged { printer_ids });
        Ok(identity)
    }

    /// Remove a printer, closing its session first if it has one.
    pub async fn unregister(&self, id: &str) -> Result<(), RegistryError> {
        let (entry, was_active, printer_ids) = {
            let mut inner = self.write();
            let entry = inner
                .printers
                .remove(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            inner.order.retain(|existing| existing != id);
            let was_active = inner.active.as_deref() == Some(id);
            if was_active {
                inner.active = None;
            }
            (entry, was_active, inner.order.clone())
        };

        let was_connected = entry.current().is_connected();
        if let Some(session) = &entry.session {
            session.close().await;
        }

        let mut events = Vec::new();
        if was_connected {
            events.push(BridgeEvent::StateChanged {
                printer_id: id.to_string(),
                state: ConnectionState::Disconnected,
            });
        }
        if was_active {
            events.push(BridgeEvent::ActiveChanged { printer_id: None });
        }
        events.push(BridgeEvent::IdentitySetChanged { printer_ids });

        info!("Unregistered printer {}", id);
        self.events.emit_all(events);
        Ok(())
    }

    /// Replace the whole identity set, e.g. from the persisted store. Every
    /// restored printer starts disconnected; existing sessions are closed.
    pub async fn restore(&self, identities: Vec<PrinterIdentity>, active: Option<String>) {
        let (old_sessions, printer_ids, active) = {
            let mut inner = self.write();
            let old_sessions: Vec<Arc<TransportSession>> = inner
                .printers
                .values_mut()
                .filter_map(|e| e.session.take())
                .collect();

            inner.printers.clear();
            inner.order.clear();
            for identity in identities {
                if inner.printers.contains_key(&identity.id) {
                    warn!("Skipping duplicate restored printer id {}", identity.id);
                    continue;
                }
                inner.order.push(identity.id.clone());
                inner
                    .printers
                    .insert(identity.id.clone(), PrinterEntry::new(identity));
            }
            inner.active = active.filter(|id| inner.printers.contains_key(id));
            (old_sessions, inner.order.clone(), inner.active.clone())
        };

        for session in old_sessions {
            session.close().await;
        }

        info!("Restored {} printers", printer_ids.len());
        self.events.emit_all(vec![
            BridgeEvent::IdentitySetChanged { printer_ids },
            BridgeEvent::ActiveChanged { printer_id: active },
        ]);
    }

    pub fn list(&self) -> Vec<PrinterIdentity> {
        let inner = self.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.printers.get(id))
            .map(|e| e.identity.clone())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<PrinterIdentity> {
        self.read().printers.get(id).map(|e| e.identity.clone())
    }

    pub fn state(&self, id: &str) -> Option<ConnectionState> {
        self.read().printers.get(id).map(PrinterEntry::current)
    }

    pub fn last_error(&self, id: &str) -> Option<ConnectionError> {
        self.read().printers.get(id).and_then(|e| e.last_error.clone())
    }

    /// Watch one printer's connection state.
    pub fn subscribe_state(&self, id: &str) -> Option<watch::Receiver<ConnectionState>> {
        self.read().printers.get(id).map(|e| e.state.subscribe())
    }

    /// The live session, present only while connected and not closing.
    pub fn session(&self, id: &str) -> Option<Arc<TransportSession>> {
        self.read()
            .printers
            .get(id)
            .filter(|e| !e.closing)
            .and_then(|e| e.session.clone())
    }

    pub fn snapshot(&self) -> Vec<PrinterSnapshot> {
        let inner = self.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.printers.get(id))
            .map(|e| PrinterSnapshot {
                identity: e.identity.clone(),
                state: e.current(),
                status: e.session.as_ref().map(|s| s.status()),
                active: inner.active.as_deref() == Some(e.identity.id.as_str()),
            })
            .collect()
    }

    pub fn active(&self) -> Option<String> {
        self.read().active.clone()
    }

    pub fn set_active(&self, id: &str) -> Result<(), RegistryError> {
        {
            let mut inner = self.write();
            if !inner.printers.contains_key(id) {
                return Err(RegistryError::NotFound(id.to_string()));
            }
            if inner.active.as_deref() == Some(id) {
                return Ok(());
            }
            inner.active = Some(id.to_string());
        }

        self.events.emit(BridgeEvent::ActiveChanged {
            printer_id: Some(id.to_string()),
        });
        Ok(())
    }

    pub fn clear_active(&self) {
        let changed = self.write().active.take().is_some();
        if changed {
            self.events.emit(BridgeEvent::ActiveChanged { printer_id: None });
        }
    }

    /// Bring a printer to `connected`.
    ///
    /// Already connected: returns immediately. Already connecting: waits for
    /// the attempt in progress and shares its outcome. Closing: waits for the
    /// old transport to be released before opening a new one. At most one
    /// transport is ever open per printer.
    pub async fn connect(&self, id: &str) -> Result<ConnectionState, BridgeError> {
        loop {
            let mut events = Vec::new();
            let plan = {
                let mut inner = self.write();
                let entry = inner
                    .printers
                    .get_mut(id)
                    .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

                match entry.current() {
                    ConnectionState::Connected if entry.closing => {
                        ConnectPlan::AwaitClose(entry.state.subscribe())
                    }
                    ConnectionState::Connected => ConnectPlan::AlreadyConnected,
                    ConnectionState::Connecting => ConnectPlan::Wait(entry.state.subscribe()),
                    previous => {
                        if matches!(previous, ConnectionState::Error(_)) {
                            events.push(entry.transition(ConnectionState::Disconnected));
                        }
                        events.push(entry.transition(ConnectionState::Connecting));
                        ConnectPlan::Open(entry.identity.clone())
                    }
                }
            };
            self.events.emit_all(events);

            return match plan {
                ConnectPlan::AlreadyConnected => Ok(ConnectionState::Connected),
                ConnectPlan::Wait(rx) => self.await_attempt(id, rx).await,
                ConnectPlan::AwaitClose(mut rx) => {
                    debug!("Printer {} is closing; waiting before reconnecting", id);
                    if rx
                        .wait_for(|state| *state != ConnectionState::Connected)
                        .await
                        .is_err()
                    {
                        return Err(RegistryError::NotFound(id.to_string()).into());
                    }
                    continue;
                }
                ConnectPlan::Open(identity) => self.open_session(identity).await,
            };
        }
    }

    async fn await_attempt(
        &self,
        id: &str,
        mut rx: watch::Receiver<ConnectionState>,
    ) -> Result<ConnectionState, BridgeError> {
        debug!("Printer {} is already connecting; waiting for the outcome", id);
        let settled = rx
            .wait_for(|state| !matches!(state, ConnectionState::Connecting))
            .await
            .map(|state| (*state).clone());

        match settled {
            Ok(ConnectionState::Connected) => Ok(ConnectionState::Connected),
            Ok(ConnectionState::Error(message)) => Err(self
                .last_error(id)
                .unwrap_or(ConnectionError::Unavailable(message))
                .into()),
            Ok(other) => Err(ConnectionError::Unavailable(format!(
                "connection attempt ended in state {}",
                other.as_str()
            ))
            .into()),
            // Sender dropped: the printer was unregistered mid-connect
            Err(_) => Err(RegistryError::NotFound(id.to_string()).into()),
        }
    }

    async fn open_session(&self, identity: PrinterIdentity) -> Result<ConnectionState, BridgeError> {
        let id = identity.id.clone();
        info!(
            "Connecting printer {} ({}) via {}",
            identity.display_name,
            id,
            identity.kind()
        );

        let mut transport = self.factory.create(&identity);

        match transport.connect().await {
            Ok(()) => {
                let session = Arc::new(TransportSession::new(&id, transport));
                let event = {
                    let mut inner = self.write();
                    match inner.printers.get_mut(&id) {
                        Some(entry) if entry.current() == ConnectionState::Connecting => {
                            entry.session = Some(session.clone());
                            entry.last_error = None;
                            Some(entry.transition(ConnectionState::Connected))
                        }
                        _ => None,
                    }
                };

                match event {
                    Some(event) => {
                        info!("Printer {} connected", id);
                        self.events.emit(event);
                        Ok(ConnectionState::Connected)
                    }
                    None => {
                        // Removed or restored while we were connecting
                        warn!("Printer {} went away during connect; closing new session", id);
                        session.close().await;
                        Err(RegistryError::NotFound(id).into())
                    }
                }
            }
            Err(e) => {
                transport.disconnect().await;
                warn!("Printer {} connect failed: {}", id, e);

                let event = {
                    let mut inner = self.write();
                    match inner.printers.get_mut(&id) {
                        Some(entry) if entry.current() == ConnectionState::Connecting => {
                            entry.last_error = Some(e.clone());
                            Some(entry.transition(ConnectionState::Error(e.to_string())))
                        }
                        _ => None,
                    }
                };
                if let Some(event) = event {
                    self.events.emit(event);
                }
                Err(e.into())
            }
        }
    }

    /// Release a printer's session. Idempotent; an attempt in progress is
    /// allowed to finish first, and concurrent disconnects all return once
    /// the one closing the transport is done.
    pub async fn disconnect(&self, id: &str) -> Result<(), RegistryError> {
        loop {
            let plan = {
                let mut inner = self.write();
                let entry = inner
                    .printers
                    .get_mut(id)
                    .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

                match entry.current() {
                    state @ ConnectionState::Connecting => {
                        DisconnectPlan::Wait(entry.state.subscribe(), state)
                    }
                    state @ ConnectionState::Connected if entry.closing => {
                        DisconnectPlan::Wait(entry.state.subscribe(), state)
                    }
                    ConnectionState::Connected => match entry.session.clone() {
                        Some(session) => {
                            entry.closing = true;
                            DisconnectPlan::Close(session)
                        }
                        None => DisconnectPlan::Done(Some(
                            entry.transition(ConnectionState::Disconnected),
                        )),
                    },
                    ConnectionState::Error(_) => DisconnectPlan::Done(Some(
                        entry.transition(ConnectionState::Disconnected),
                    )),
                    ConnectionState::Disconnected => DisconnectPlan::Done(None),
                }
            };

            match plan {
                DisconnectPlan::Wait(mut rx, observed) => {
                    let _ = rx.wait_for(|state| *state != observed).await;
                }
                DisconnectPlan::Done(event) => {
                    if let Some(event) = event {
                        self.events.emit(event);
                    }
                    return Ok(());
                }
                DisconnectPlan::Close(session) => {
                    // Waits for an in-flight send to finish before releasing
                    session.close().await;
                    info!("Printer {} disconnected", id);

                    let event = {
                        let mut inner = self.write();
                        match inner.printers.get_mut(id) {
                            Some(entry)
                                if entry
                                    .session
                                    .as_ref()
                                    .is_some_and(|current| Arc::ptr_eq(current, &session)) =>
                            {
                                entry.session = None;
                                entry.closing = false;
                                Some(entry.transition(ConnectionState::Disconnected))
                            }
                            _ => None,
                        }
                    };
                    if let Some(event) = event {
                        self.events.emit(event);
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Called when a send discovers the session is gone. Only acts if
    /// `session` is still the printer's current session and no disconnect
    /// is already releasing it.
    pub async fn mark_lost(&self, id: &str, session: &Arc<TransportSession>) {
        let (lost, event) = {
            let mut inner = self.write();
            match inner.printers.get_mut(id) {
                Some(entry)
                    if !entry.closing
                        && entry
                            .session
                            .as_ref()
                            .is_some_and(|current| Arc::ptr_eq(current, session)) =>
                {
                    let lost = entry.session.take();
                    (lost, Some(entry.transition(ConnectionState::Disconnected)))
                }
                _ => (None, None),
            }
        };

        if let Some(lost) = lost {
            warn!("Printer {} lost its connection", id);
            lost.close().await;
        }
        if let Some(event) = event {
            self.events.emit(event);
        }
    }

    /// Close every open session (shutdown).
    pub async fn disconnect_all(&self) {
        let ids: Vec<String> = self.read().order.clone();
        for id in ids {
            if let Err(e) = self.disconnect(&id).await {
                debug!("Disconnect of {} during shutdown skipped: {}", id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::transport::{MockPrinterTransport, PrinterTransport};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Hands out mock transports that connect successfully.
    struct ConnectingFactory {
        created: AtomicUsize,
        fail_with: Option<ConnectionError>,
    }

    impl TransportFactory for ConnectingFactory {
        fn create(&self, _identity: &PrinterIdentity) -> Box<dyn PrinterTransport> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let mut mock = MockPrinterTransport::new();
            mock.expect_kind()
                .return_const(crate::config::TransportKind::Network);
            let outcome = self.fail_with.clone();
            mock.expect_connect().returning(move || match &outcome {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            });
            mock.expect_disconnect().returning(|| ());
            mock.expect_is_connected().return_const(true);
            mock.expect_status().return_const("mock".to_string());
            Box::new(mock)
        }
    }

    fn registry(fail_with: Option<ConnectionError>) -> (PrinterRegistry, Arc<ConnectingFactory>) {
        let factory = Arc::new(ConnectingFactory {
            created: AtomicUsize::new(0),
            fail_with,
        });
        let registry = PrinterRegistry::new(factory.clone(), Arc::new(EventBus::new()));
        (registry, factory)
    }

    #[test]
    fn test_register_assigns_unique_ids() {
        let (registry, _) = registry(None);
        let a = registry
            .register(NewPrinter::network("Bar", "192.168.1.10", 9100))
            .unwrap();
        let b = registry
            .register(NewPrinter::network("Kitchen", "192.168.1.11", 9100))
            .unwrap();

        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("prn_"));
        assert_eq!(registry.state(&a.id), Some(ConnectionState::Disconnected));
        let names: Vec<String> = registry.list().into_iter().map(|p| p.display_name).collect();
        assert_eq!(names, vec!["Bar", "Kitchen"]);
    }

    #[test]
    fn test_duplicate_endpoint_rejected() {
        let (registry, _) = registry(None);
        registry
            .register(NewPrinter::network("Bar", "192.168.1.10", 9100))
            .unwrap();
        let err = registry
            .register(NewPrinter::network("Bar again", "192.168.1.10", 9100))
            .unwrap_err();
        assert_eq!(err.kind(), "already_exists");
    }

    #[tokio::test]
    async fn test_connect_then_connect_again_is_noop() {
        let (registry, factory) = registry(None);
        let printer = registry
            .register(NewPrinter::network("Bar", "192.168.1.10", 9100))
            .unwrap();

        assert_eq!(registry.connect(&printer.id).await.unwrap(), ConnectionState::Connected);
        assert_eq!(registry.connect(&printer.id).await.unwrap(), ConnectionState::Connected);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert!(registry.session(&printer.id).is_some());
    }

    #[tokio::test]
    async fn test_failed_connect_holds_no_session() {
        let (registry, _) = registry(Some(ConnectionError::PermissionDenied("usb".to_string())));
        let printer = registry
            .register(NewPrinter::network("Bar", "192.168.1.10", 9100))
            .unwrap();

        let err = registry.connect(&printer.id).await.unwrap_err();
        assert_eq!(err.kind(), "permission_denied");
        assert!(matches!(registry.state(&printer.id), Some(ConnectionState::Error(_))));
        assert!(registry.session(&printer.id).is_none());
        assert_eq!(
            registry.last_error(&printer.id),
            Some(ConnectionError::PermissionDenied("usb".to_string()))
        );

        registry.disconnect(&printer.id).await.unwrap();
        assert_eq!(registry.state(&printer.id), Some(ConnectionState::Disconnected));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (registry, _) = registry(None);
        let printer = registry
            .register(NewPrinter::network("Bar", "192.168.1.10", 9100))
            .unwrap();

        registry.disconnect(&printer.id).await.unwrap();
        registry.connect(&printer.id).await.unwrap();
        registry.disconnect(&printer.id).await.unwrap();
        registry.disconnect(&printer.id).await.unwrap();

        assert_eq!(registry.state(&printer.id), Some(ConnectionState::Disconnected));
        assert!(registry.session(&printer.id).is_none());
    }

    #[tokio::test]
    async fn test_unregister_clears_active() {
        let (registry, _) = registry(None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry.events().subscribe(Arc::new(move |event: &BridgeEvent| {
            sink.lock().unwrap().push(event.clone());
        }));

        let printer = registry
            .register(NewPrinter::network("Bar", "192.168.1.10", 9100))
            .unwrap();
        registry.set_active(&printer.id).unwrap();
        registry.connect(&printer.id).await.unwrap();
        registry.unregister(&printer.id).await.unwrap();

        assert_eq!(registry.active(), None);
        assert!(registry.get(&printer.id).is_none());
        assert_eq!(
            registry.unregister(&printer.id).await.unwrap_err().kind(),
            "not_found"
        );

        let events = seen.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, BridgeEvent::ActiveChanged { printer_id: None })));
        assert!(matches!(
            events.last(),
            Some(BridgeEvent::IdentitySetChanged { printer_ids }) if printer_ids.is_empty()
        ));
    }

    #[tokio::test]
    async fn test_transport_change_requires_disconnect() {
        let (registry, _) = registry(None);
        let printer = registry
            .register(NewPrinter::network("Bar", "192.168.1.10", 9100))
            .unwrap();
        registry.connect(&printer.id).await.unwrap();

        let update = PrinterUpdate {
            display_name: None,
            transport: Some(TransportConfig::Network {
                host: "192.168.1.20".to_string(),
                port: 9100,
            }),
        };
        assert_eq!(
            registry.update(&printer.id, update.clone()).unwrap_err().kind(),
            "invalid_config"
        );

        // Renaming is always allowed
        let renamed = registry
            .update(
                &printer.id,
                PrinterUpdate {
                    display_name: Some("Front bar".to_string()),
                    transport: None,
                },
            )
            .unwrap();
        assert_eq!(renamed.display_name, "Front bar");

        registry.disconnect(&printer.id).await.unwrap();
        let moved = registry.update(&printer.id, update).unwrap();
        assert_eq!(moved.transport.endpoint_key(), "net_192.168.1.20:9100");
    }

    #[tokio::test]
    async fn test_restore_starts_disconnected() {
        let (registry, _) = registry(None);
        let printer = registry
            .register(NewPrinter::network("Bar", "192.168.1.10", 9100))
            .unwrap();
        registry.connect(&printer.id).await.unwrap();

        registry
            .restore(vec![printer.clone()], Some("prn_missing".to_string()))
            .await;

        assert_eq!(registry.state(&printer.id), Some(ConnectionState::Disconnected));
        assert!(registry.session(&printer.id).is_none());
        assert_eq!(registry.active(), None);
    }

    #[test]
    fn test_set_active_unknown_printer() {
        let (registry, _) = registry(None);
        assert_eq!(registry.set_active("prn_nope").unwrap_err().kind(), "not_found");
    }
}

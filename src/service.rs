//! Component facade wiring registry, dispatcher, event bus and store
//! together, the way the client application holds them.

use crate::config::{ClientConfig, NewPrinter, PrinterIdentity, PrinterUpdate};
use crate::dispatcher::{Dispatcher, JobHandle, PrintJob};
use crate::errors::{DispatchError, RegistryError, RelayError, Result};
use crate::events::{BridgeObserver, EventBus};
use crate::registry::{PrinterRegistry, PrinterSnapshot};
use crate::relay::client::RelayClient;
use crate::relay::wire::{DiscoveryRequest, DiscoveryResponse, StatusResponse};
use crate::status::ConnectionState;
use crate::store::PrinterStore;
use crate::transport::{DefaultTransportFactory, TransportFactory};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

pub struct PrinterService {
    registry: Arc<PrinterRegistry>,
    dispatcher: Dispatcher,
    events: Arc<EventBus>,
    relay: RelayClient,
    store: Option<PrinterStore>,
    /// Serializes saves so an older snapshot never lands after a newer one
    persist_lock: Mutex<()>,
}

impl PrinterService {
    pub fn new(config: ClientConfig) -> Self {
        let relay = RelayClient::new(
            &config.relay_url,
            config.relay_token.clone(),
            config.relay_timeout(),
        );
        let store = config.store_path.clone().map(PrinterStore::new);
        let factory = Arc::new(DefaultTransportFactory::new(relay.clone(), config));
        Self::with_factory(factory, relay, store)
    }

    pub fn with_factory(
        factory: Arc<dyn TransportFactory>,
        relay: RelayClient,
        store: Option<PrinterStore>,
    ) -> Self {
        let events = Arc::new(EventBus::new());
        let registry = Arc::new(PrinterRegistry::new(factory, events.clone()));
        let dispatcher = Dispatcher::new(registry.clone(), events.clone());

        Self {
            registry,
            dispatcher,
            events,
            relay,
            store,
            persist_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<PrinterRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn subscribe(&self, observer: Arc<dyn BridgeObserver>) {
        self.events.subscribe(observer);
    }

    /// Load the persisted identity set into the registry. Every printer
    /// comes back `disconnected`.
    pub async fn load(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let stored = store.load().await?;
        let count = stored.printers.len();
        self.registry
            .restore(stored.printers, stored.active_printer_id)
            .await;
        Ok(count)
    }

    async fn persist(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let _guard = self.persist_lock.lock().await;
        let result = store
            .save(self.registry.list(), self.registry.active())
            .await;
        if let Err(e) = &result {
            error!("Failed to persist printers to {:?}: {}", store.path(), e);
        }
        result
    }

    pub async fn register(&self, new: NewPrinter) -> Result<PrinterIdentity> {
        let identity = self.registry.register(new)?;
        self.persist().await?;
        Ok(identity)
    }

    pub async fn update(&self, id: &str, update: PrinterUpdate) -> Result<PrinterIdentity> {
        let identity = self.registry.update(id, update)?;
        self.persist().await?;
        Ok(identity)
    }

    pub async fn unregister(&self, id: &str) -> Result<()> {
        self.registry.unregister(id).await?;
        self.persist().await
    }

    pub async fn set_active(&self, id: &str) -> Result<()> {
        self.registry.set_active(id)?;
        self.persist().await
    }

    pub async fn clear_active(&self) -> Result<()> {
        self.registry.clear_active();
        self.persist().await
    }

    pub fn list(&self) -> Vec<PrinterIdentity> {
        self.registry.list()
    }

    pub fn snapshot(&self) -> Vec<PrinterSnapshot> {
        self.registry.snapshot()
    }

    pub fn state(&self, id: &str) -> std::result::Result<ConnectionState, RegistryError> {
        self.registry
            .state(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub async fn connect(&self, id: &str) -> Result<ConnectionState> {
        self.registry.connect(id).await
    }

    pub async fn disconnect(&self, id: &str) -> Result<()> {
        Ok(self.registry.disconnect(id).await?)
    }

    /// Queue `payload` for `printer_id` (or the active printer).
    pub fn send(
        &self,
        payload: impl Into<Arc<[u8]>>,
        printer_id: Option<&str>,
    ) -> std::result::Result<JobHandle, DispatchError> {
        self.dispatcher.send(payload, printer_id)
    }

    pub async fn send_and_wait(
        &self,
        payload: impl Into<Arc<[u8]>>,
        printer_id: Option<&str>,
    ) -> Result<PrintJob> {
        self.dispatcher.send_and_wait(payload, printer_id).await
    }

    pub fn job(&self, id: &str) -> Option<PrintJob> {
        self.dispatcher.job(id)
    }

    pub fn recent_jobs(&self, limit: usize) -> Vec<PrintJob> {
        self.dispatcher.recent_jobs(limit)
    }

    /// Ask the relay to probe a subnet for raw-port printers.
    pub async fn discover(&self, request: &DiscoveryRequest) -> std::result::Result<DiscoveryResponse, RelayError> {
        self.relay.discover(request).await
    }

    pub async fn relay_status(&self) -> std::result::Result<StatusResponse, RelayError> {
        self.relay.status().await
    }

    /// Close every open session. Identities and the store are untouched.
    pub async fn shutdown(&self) {
        info!("Closing all printer sessions");
        self.registry.disconnect_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;
    use crate::status::JobStatus;
    use crate::transport::{MockPrinterTransport, PrinterTransport};
    use std::time::Duration;
    use tempfile::TempDir;

    struct OkFactory;

    impl TransportFactory for OkFactory {
        fn create(&self, _identity: &PrinterIdentity) -> Box<dyn PrinterTransport> {
            let mut mock = MockPrinterTransport::new();
            mock.expect_kind().return_const(TransportKind::Network);
            mock.expect_connect().returning(|| Ok(()));
            mock.expect_disconnect().returning(|| ());
            mock.expect_send().returning(|_| Ok(()));
            mock.expect_is_connected().return_const(true);
            mock.expect_status().return_const("mock".to_string());
            Box::new(mock)
        }
    }

    fn service(dir: &TempDir) -> PrinterService {
        PrinterService::with_factory(
            Arc::new(OkFactory),
            RelayClient::new("http://127.0.0.1:9", None, Duration::from_millis(200)),
            Some(PrinterStore::new(dir.path().join("printers.json"))),
        )
    }

    #[tokio::test]
    async fn test_register_persists_and_reload_is_disconnected() {
        let dir = TempDir::new().unwrap();
        let first = service(&dir);

        let printer = first
            .register(NewPrinter::network("Bar", "192.168.1.20", 9100))
            .await
            .unwrap();
        first.set_active(&printer.id).await.unwrap();
        first.connect(&printer.id).await.unwrap();
        assert_eq!(first.state(&printer.id).unwrap(), ConnectionState::Connected);

        let second = service(&dir);
        assert_eq!(second.load().await.unwrap(), 1);
        assert_eq!(second.list(), vec![printer.clone()]);
        assert_eq!(second.registry().active(), Some(printer.id.clone()));
        assert_eq!(
            second.state(&printer.id).unwrap(),
            ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn test_unregister_persists_removal() {
        let dir = TempDir::new().unwrap();
        let first = service(&dir);
        let printer = first
            .register(NewPrinter::network("Bar", "192.168.1.20", 9100))
            .await
            .unwrap();
        first.unregister(&printer.id).await.unwrap();

        let second = service(&dir);
        assert_eq!(second.load().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_send_to_active_printer() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let printer = service
            .register(NewPrinter::network("Bar", "192.168.1.20", 9100))
            .await
            .unwrap();

        assert_eq!(
            service.send(vec![0x1b, 0x40], None).unwrap_err(),
            DispatchError::NoTarget
        );

        service.set_active(&printer.id).await.unwrap();
        service.connect(&printer.id).await.unwrap();

        let job = service.send_and_wait(vec![0x1b, 0x40], None).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(service.job(&job.id).unwrap().status, JobStatus::Completed);

        service.shutdown().await;
        assert_eq!(
            service.state(&printer.id).unwrap(),
            ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn test_state_of_unknown_printer() {
        let dir = TempDir::new().unwrap();
        let err = service(&dir).state("prn_missing").unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }
}

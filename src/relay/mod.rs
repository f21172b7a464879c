//! Bridge Relay Service: performs raw TCP exchanges with printers on behalf
//! of clients that cannot open sockets themselves.
//!
//! Every admitted request runs as its own task with its own socket and
//! timeouts. The only shared state is the admission semaphore and a few
//! counters used for status reporting.

pub mod client;
pub mod discovery;
pub mod server;
pub mod session;
pub mod wire;

use crate::config::RelayConfig;
use crate::errors::RelayError;
use crate::telemetry::{TelemetryCollector, TelemetryEvent};
use session::{RelayOutcome, RelaySessionDescriptor};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};
use wire::{DiscoveryRequest, DiscoveryResponse, RelayRequest, StatusResponse};

pub struct RelayService {
    config: RelayConfig,
    sessions: Arc<Semaphore>,
    discoveries: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    started_at: Instant,
    telemetry: Arc<TelemetryCollector>,
}

/// Decrements a counter when dropped, so cancelled requests never leak a slot.
struct CounterGuard(Arc<AtomicUsize>);

impl CounterGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> (Self, usize) {
        let previous = counter.fetch_add(1, Ordering::SeqCst);
        (Self(counter.clone()), previous)
    }
}

impl Drop for CounterGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RelayService {
    pub fn new(config: RelayConfig) -> Self {
        Self::with_telemetry(config, Arc::new(TelemetryCollector::new()))
    }

    pub fn with_telemetry(config: RelayConfig, telemetry: Arc<TelemetryCollector>) -> Self {
        Self {
            sessions: Arc::new(Semaphore::new(config.max_sessions.max(1))),
            discoveries: Arc::new(Semaphore::new(config.max_concurrent_discoveries.max(1))),
            queued: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            started_at: Instant::now(),
            telemetry,
            config,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn telemetry(&self) -> &Arc<TelemetryCollector> {
        &self.telemetry
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            in_flight_sessions: self.in_flight(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            max_sessions: self.config.max_sessions,
            queued_requests: self.queued(),
        }
    }

    fn describe(&self, request: &RelayRequest) -> Result<RelaySessionDescriptor, RelayError> {
        if request.host.trim().is_empty() {
            return Err(RelayError::InvalidRequest("host is required".to_string()));
        }
        if request.port == 0 {
            return Err(RelayError::InvalidRequest("port must be non-zero".to_string()));
        }
        if request.payload.len() > self.config.max_payload_bytes {
            return Err(RelayError::InvalidRequest(format!(
                "payload of {} bytes exceeds the {} byte limit",
                request.payload.len(),
                self.config.max_payload_bytes
            )));
        }

        Ok(RelaySessionDescriptor {
            host: request.host.trim().to_string(),
            port: request.port,
            connect_timeout: self
                .config
                .clamp_timeout(request.connect_timeout_ms, self.config.connect_timeout_ms),
            idle_timeout: self
                .config
                .clamp_timeout(request.idle_timeout_ms, self.config.idle_timeout_ms),
        })
    }

    /// Wait for a session slot. Fails fast with `Busy` once the admission
    /// queue is full, or after waiting `admission_wait` without a slot.
    async fn admit(&self) -> Result<OwnedSemaphorePermit, RelayError> {
        if let Ok(permit) = self.sessions.clone().try_acquire_owned() {
            return Ok(permit);
        }

        let (_queued, ahead) = CounterGuard::enter(&self.queued);
        if ahead >= self.config.admission_queue {
            return Err(RelayError::Busy(format!(
                "admission queue full ({} waiting)",
                ahead
            )));
        }

        match tokio::time::timeout(self.config.admission_wait(), self.sessions.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(RelayError::Internal("relay is shutting down".to_string())),
            Err(_) => Err(RelayError::Busy(format!(
                "no session slot freed within {}ms",
                self.config.admission_wait_ms
            ))),
        }
    }

    /// Perform one relay exchange.
    ///
    /// The exchange runs on its own task and finishes even if the caller
    /// stops waiting for it.
    pub async fn relay(&self, request: RelayRequest) -> Result<RelayOutcome, RelayError> {
        let descriptor = match self.describe(&request) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.record_rejection(&e).await;
                return Err(e);
            }
        };

        let permit = match self.admit().await {
            Ok(permit) => permit,
            Err(e) => {
                warn!("Relay request for {} rejected: {}", descriptor.addr(), e);
                self.record_rejection(&e).await;
                return Err(e);
            }
        };

        let (in_flight, _) = CounterGuard::enter(&self.in_flight);
        let capture = request
            .response_expected
            .then_some(self.config.max_response_bytes);
        let payload = request.payload;
        let destination = descriptor.addr();

        debug!(
            "Relay session start: {} ({} bytes, in flight: {})",
            destination,
            payload.len(),
            self.in_flight()
        );

        let started = Instant::now();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            let _in_flight = in_flight;
            session::run_session(&descriptor, &payload, capture).await
        });

        let result = handle
            .await
            .map_err(|e| RelayError::Internal(format!("relay session task failed: {}", e)))
            .and_then(|result| result);

        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(outcome) => {
                debug!("Relay session to {} done in {}ms", destination, duration_ms);
                self.telemetry
                    .record_event(TelemetryEvent::RelaySessionCompleted {
                        destination,
                        bytes_written: outcome.bytes_written,
                        duration_ms,
                    })
                    .await;
            }
            Err(e) => {
                warn!("Relay session to {} failed: {}", destination, e);
                if matches!(e, RelayError::Internal(_)) {
                    crate::sentry_init::capture_relay_failure(e.kind(), &e.to_string());
                }
                self.telemetry
                    .record_event(TelemetryEvent::RelaySessionFailed {
                        destination,
                        error_kind: e.kind().to_string(),
                        duration_ms,
                    })
                    .await;
            }
        }

        result
    }

    /// Probe a subnet for hosts accepting connections on the printing port.
    pub async fn discover(&self, request: DiscoveryRequest) -> Result<DiscoveryResponse, RelayError> {
        let _permit = self.discoveries.clone().try_acquire_owned().map_err(|_| {
            RelayError::Busy(format!(
                "{} discoveries already running",
                self.config.max_concurrent_discoveries
            ))
        })?;

        let response = discovery::discover(&request, &self.config).await?;

        self.telemetry
            .record_event(TelemetryEvent::DiscoveryCompleted {
                scanned: response.scanned,
                found: response.hosts.len(),
                duration_ms: response.elapsed_ms,
            })
            .await;

        Ok(response)
    }

    async fn record_rejection(&self, error: &RelayError) {
        self.telemetry
            .record_event(TelemetryEvent::RelayRejected {
                reason: error.kind().to_string(),
            })
            .await;
    }
}

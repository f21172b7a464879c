use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, info};

const HISTORY_LIMIT: usize = 200;
const DURATION_SAMPLES: usize = 1000;

/// Telemetry event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// Relay exchange finished successfully
    RelaySessionCompleted {
        destination: String,
        bytes_written: usize,
        duration_ms: u64,
    },
    /// Relay exchange failed after admission
    RelaySessionFailed {
        destination: String,
        error_kind: String,
        duration_ms: u64,
    },
    /// Request turned away before a session started (backpressure, bad input)
    RelayRejected { reason: String },
    /// Subnet discovery finished
    DiscoveryCompleted {
        scanned: usize,
        found: usize,
        duration_ms: u64,
    },
}

/// Telemetry metrics for reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryMetrics {
    pub sessions_completed: u64,
    pub sessions_failed: u64,
    pub requests_rejected: u64,
    pub bytes_relayed: u64,
    /// Average session duration (milliseconds)
    pub avg_session_duration_ms: u64,
    /// Success rate (0.0 - 1.0)
    pub success_rate: f64,
    pub discoveries_completed: u64,
    pub last_update_ts: u64,
}

impl Default for TelemetryMetrics {
    fn default() -> Self {
        Self {
            sessions_completed: 0,
            sessions_failed: 0,
            requests_rejected: 0,
            bytes_relayed: 0,
            avg_session_duration_ms: 0,
            success_rate: 1.0,
            discoveries_completed: 0,
            last_update_ts: now_secs(),
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Telemetry collector for aggregating relay metrics
pub struct TelemetryCollector {
    metrics: Arc<RwLock<TelemetryMetrics>>,
    event_history: Arc<RwLock<VecDeque<(u64, TelemetryEvent)>>>,
    session_durations: Arc<RwLock<VecDeque<u64>>>,
}

impl TelemetryCollector {
    pub fn new() -> Self {
        debug!("Initializing telemetry collector");
        Self {
            metrics: Arc::new(RwLock::new(TelemetryMetrics::default())),
            event_history: Arc::new(RwLock::new(VecDeque::new())),
            session_durations: Arc::new(RwLock::new(VecDeque::new())),
        }
    }

    pub async fn record_event(&self, event: TelemetryEvent) {
        let timestamp = now_secs();
        let mut metrics = self.metrics.write().await;

        match &event {
            TelemetryEvent::RelaySessionCompleted {
                bytes_written,
                duration_ms,
                ..
            } => {
                metrics.sessions_completed += 1;
                metrics.bytes_relayed += *bytes_written as u64;

                let mut durations = self.session_durations.write().await;
                durations.push_back(*duration_ms);
                if durations.len() > DURATION_SAMPLES {
                    durations.pop_front();
                }
                let sum: u64 = durations.iter().sum();
                metrics.avg_session_duration_ms = sum / durations.len() as u64;

                update_success_rate(&mut metrics);
            }
            TelemetryEvent::RelaySessionFailed {
                destination,
                error_kind,
                ..
            } => {
                metrics.sessions_failed += 1;
                update_success_rate(&mut metrics);
                debug!(
                    "Relay to {} failed ({}) - Success rate: {:.2}%",
                    destination,
                    error_kind,
                    metrics.success_rate * 100.0
                );
            }
            TelemetryEvent::RelayRejected { reason } => {
                metrics.requests_rejected += 1;
                debug!("Relay request rejected: {}", reason);
            }
            TelemetryEvent::DiscoveryCompleted { .. } => {
                metrics.discoveries_completed += 1;
            }
        }

        metrics.last_update_ts = timestamp;
        drop(metrics);

        let mut history = self.event_history.write().await;
        history.push_back((timestamp, event));
        if history.len() > HISTORY_LIMIT {
            history.pop_front();
        }
    }

    pub async fn get_metrics(&self) -> TelemetryMetrics {
        self.metrics.read().await.clone()
    }

    /// Get event history (last N events)
    pub async fn get_event_history(&self, limit: usize) -> Vec<(u64, TelemetryEvent)> {
        let history = self.event_history.read().await;
        let start = history.len().saturating_sub(limit);
        history.iter().skip(start).cloned().collect()
    }

    /// Export metrics in Prometheus text format. Live gauges are passed in
    /// because the relay service owns them.
    pub async fn export_prometheus(&self, in_flight: usize, queued: usize) -> String {
        let metrics = self.get_metrics().await;

        format!(
            "# HELP relay_sessions_completed_total Relay exchanges that finished successfully\n\
             # TYPE relay_sessions_completed_total counter\n\
             relay_sessions_completed_total {}\n\
             \n\
             # HELP relay_sessions_failed_total Relay exchanges that failed after admission\n\
             # TYPE relay_sessions_failed_total counter\n\
             relay_sessions_failed_total {}\n\
             \n\
             # HELP relay_requests_rejected_total Requests rejected before a session started\n\
             # TYPE relay_requests_rejected_total counter\n\
             relay_requests_rejected_total {}\n\
             \n\
             # HELP relay_bytes_relayed_total Payload bytes written to printers\n\
             # TYPE relay_bytes_relayed_total counter\n\
             relay_bytes_relayed_total {}\n\
             \n\
             # HELP relay_avg_session_duration_ms Average relay session duration in milliseconds\n\
             # TYPE relay_avg_session_duration_ms gauge\n\
             relay_avg_session_duration_ms {}\n\
             \n\
             # HELP relay_success_rate Relay session success rate (0.0 - 1.0)\n\
             # TYPE relay_success_rate gauge\n\
             relay_success_rate {:.4}\n\
             \n\
             # HELP relay_in_flight_sessions Sessions currently talking to a printer\n\
             # TYPE relay_in_flight_sessions gauge\n\
             relay_in_flight_sessions {}\n\
             \n\
             # HELP relay_queued_requests Requests waiting for a session slot\n\
             # TYPE relay_queued_requests gauge\n\
             relay_queued_requests {}\n\
             \n\
             # HELP relay_discoveries_completed_total Subnet discoveries run\n\
             # TYPE relay_discoveries_completed_total counter\n\
             relay_discoveries_completed_total {}\n",
            metrics.sessions_completed,
            metrics.sessions_failed,
            metrics.requests_rejected,
            metrics.bytes_relayed,
            metrics.avg_session_duration_ms,
            metrics.success_rate,
            in_flight,
            queued,
            metrics.discoveries_completed,
        )
    }
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn update_success_rate(metrics: &mut TelemetryMetrics) {
    let total = metrics.sessions_completed + metrics.sessions_failed;
    if total > 0 {
        metrics.success_rate = metrics.sessions_completed as f64 / total as f64;
    }
}

/// Log a metrics summary on a fixed interval until the task is aborted.
pub fn spawn_reporter(
    collector: Arc<TelemetryCollector>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately; skip it so the first report has data
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let metrics = collector.get_metrics().await;

            info!(
                "Telemetry Report - Sessions: {} completed, {} failed, {} rejected | Success: {:.1}% | Avg duration: {}ms | Bytes: {}",
                metrics.sessions_completed,
                metrics.sessions_failed,
                metrics.requests_rejected,
                metrics.success_rate * 100.0,
                metrics.avg_session_duration_ms,
                metrics.bytes_relayed,
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(duration_ms: u64) -> TelemetryEvent {
        TelemetryEvent::RelaySessionCompleted {
            destination: "192.168.1.50:9100".to_string(),
            bytes_written: 20,
            duration_ms,
        }
    }

    #[tokio::test]
    async fn test_record_session_completed() {
        let collector = TelemetryCollector::new();
        collector.record_event(completed(150)).await;

        let metrics = collector.get_metrics().await;
        assert_eq!(metrics.sessions_completed, 1);
        assert_eq!(metrics.bytes_relayed, 20);
        assert_eq!(metrics.avg_session_duration_ms, 150);
        assert_eq!(metrics.success_rate, 1.0);
    }

    #[tokio::test]
    async fn test_success_rate_calculation() {
        let collector = TelemetryCollector::new();

        // 3 completed, 1 failed = 75% success rate
        for _ in 0..3 {
            collector.record_event(completed(100)).await;
        }
        collector
            .record_event(TelemetryEvent::RelaySessionFailed {
                destination: "192.168.1.51:9100".to_string(),
                error_kind: "connect_refused".to_string(),
                duration_ms: 2,
            })
            .await;

        let metrics = collector.get_metrics().await;
        assert_eq!(metrics.sessions_failed, 1);
        assert!((metrics.success_rate - 0.75).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_rejections_do_not_affect_success_rate() {
        let collector = TelemetryCollector::new();
        collector
            .record_event(TelemetryEvent::RelayRejected {
                reason: "busy".to_string(),
            })
            .await;

        let metrics = collector.get_metrics().await;
        assert_eq!(metrics.requests_rejected, 1);
        assert_eq!(metrics.success_rate, 1.0);
    }

    #[tokio::test]
    async fn test_event_history_limit() {
        let collector = TelemetryCollector::new();

        for i in 0..1500 {
            collector.record_event(completed(i)).await;
        }

        let history = collector.get_event_history(2000).await;
        assert_eq!(history.len(), HISTORY_LIMIT);
    }

    #[tokio::test]
    async fn test_prometheus_export() {
        let collector = TelemetryCollector::new();
        collector.record_event(completed(200)).await;

        let prometheus = collector.export_prometheus(3, 1).await;

        assert!(prometheus.contains("relay_sessions_completed_total 1"));
        assert!(prometheus.contains("relay_in_flight_sessions 3"));
        assert!(prometheus.contains("relay_queued_requests 1"));
        assert!(prometheus.contains("# TYPE relay_success_rate gauge"));
    }
}

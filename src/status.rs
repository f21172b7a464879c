/// Print job status constants, single source of truth for the wire and
/// for event consumers (history store, UI).
pub const PENDING: &str = "pending";
pub const SENDING: &str = "sending";
pub const COMPLETED: &str = "completed";
pub const FAILED: &str = "failed";

/// Connection state constants
pub const DISCONNECTED: &str = "disconnected";
pub const CONNECTING: &str = "connecting";
pub const CONNECTED: &str = "connected";
pub const ERROR: &str = "error";

use serde::{Deserialize, Serialize};

/// Runtime connection state of a printer identity. Never persisted.
///
/// Legal transitions:
///   disconnected → connecting → {connected, error} → disconnected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "message", rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => DISCONNECTED,
            ConnectionState::Connecting => CONNECTING,
            ConnectionState::Connected => CONNECTED,
            ConnectionState::Error(_) => ERROR,
        }
    }

    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        matches!(
            (self, next),
            (ConnectionState::Disconnected, ConnectionState::Connecting)
                | (ConnectionState::Connecting, ConnectionState::Connected)
                | (ConnectionState::Connecting, ConnectionState::Error(_))
                | (ConnectionState::Connected, ConnectionState::Disconnected)
                | (ConnectionState::Error(_), ConnectionState::Disconnected)
        )
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Human-readable description for display
    pub fn describe(&self) -> String {
        match self {
            ConnectionState::Error(message) => format!("error: {}", message),
            other => other.as_str().to_string(),
        }
    }
}

/// Lifecycle of a print job. Transitions only move forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Sending,
    Completed,
    Failed(String),
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => PENDING,
            JobStatus::Sending => SENDING,
            JobStatus::Completed => COMPLETED,
            JobStatus::Failed(_) => FAILED,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Sending => 1,
            JobStatus::Completed | JobStatus::Failed(_) => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    /// Terminal states accept nothing; otherwise the next state must rank higher.
    pub fn can_advance_to(&self, next: &JobStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_lifecycle() {
        let disconnected = ConnectionState::Disconnected;
        let connecting = ConnectionState::Connecting;
        let connected = ConnectionState::Connected;
        let error = ConnectionState::Error("refused".to_string());

        assert!(disconnected.can_transition_to(&connecting));
        assert!(connecting.can_transition_to(&connected));
        assert!(connecting.can_transition_to(&error));
        assert!(connected.can_transition_to(&disconnected));
        assert!(error.can_transition_to(&disconnected));
    }

    #[test]
    fn test_error_only_reachable_from_connecting() {
        let error = ConnectionState::Error("boom".to_string());
        assert!(!ConnectionState::Disconnected.can_transition_to(&error));
        assert!(!ConnectionState::Connected.can_transition_to(&error));
        assert!(!error.can_transition_to(&ConnectionState::Connecting));
        assert!(!ConnectionState::Disconnected.can_transition_to(&ConnectionState::Connected));
    }

    #[test]
    fn test_job_status_is_monotonic() {
        assert!(JobStatus::Pending.can_advance_to(&JobStatus::Sending));
        assert!(JobStatus::Sending.can_advance_to(&JobStatus::Completed));
        assert!(JobStatus::Sending.can_advance_to(&JobStatus::Failed("x".to_string())));
        assert!(!JobStatus::Sending.can_advance_to(&JobStatus::Pending));
        assert!(!JobStatus::Completed.can_advance_to(&JobStatus::Failed("x".to_string())));
        assert!(!JobStatus::Failed("x".to_string()).can_advance_to(&JobStatus::Completed));
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_value(ConnectionState::Error("timeout".to_string())).unwrap();
        assert_eq!(json["state"], "error");
        assert_eq!(json["message"], "timeout");

        let json = serde_json::to_value(JobStatus::Completed).unwrap();
        assert_eq!(json["status"], COMPLETED);
    }
}

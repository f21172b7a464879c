use thiserror::Error;

/// Failure to establish a transport session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Printer unavailable: {0}")]
    Unavailable(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Connection timed out: {0}")]
    Timeout(String),

    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),
}

impl ConnectionError {
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionError::Unavailable(_) => "unavailable",
            ConnectionError::PermissionDenied(_) => "permission_denied",
            ConnectionError::Timeout(_) => "timeout",
            ConnectionError::ProtocolMismatch(_) => "protocol_mismatch",
        }
    }
}

/// Failure to deliver a payload over an established session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Printer not connected")]
    NotConnected,

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },
}

impl SendError {
    pub fn kind(&self) -> &'static str {
        match self {
            SendError::NotConnected => "not_connected",
            SendError::TransportFailure(_) => "transport_failure",
            SendError::PayloadTooLarge { .. } => "payload_too_large",
        }
    }
}

/// Outcome of a failed relay exchange. Each variant is reported on the wire
/// by its `kind()` so the Network driver can rebuild it on the client side.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Connection refused by {0}")]
    ConnectRefused(String),

    #[error("Connect to {addr} timed out after {after_ms}ms")]
    ConnectTimeout { addr: String, after_ms: u64 },

    #[error("Write to printer failed: {0}")]
    WriteFailed(String),

    #[error("Printer stalled for more than {0}ms")]
    IdleTimeout(u64),

    #[error("Destination unreachable: {0}")]
    Unreachable(String),

    #[error("Relay busy: {0}")]
    Busy(String),

    #[error("Invalid relay request: {0}")]
    InvalidRequest(String),

    #[error("Relay internal error: {0}")]
    Internal(String),

    /// Client side only: the relay itself could not be reached
    #[error("Bridge relay unreachable: {0}")]
    RelayUnreachable(String),

    /// Client side only: the relay accepted the call but did not answer in time
    #[error("Bridge relay did not answer in time: {0}")]
    RelayTimeout(String),
}

impl RelayError {
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::ConnectRefused(_) => "connect_refused",
            RelayError::ConnectTimeout { .. } => "connect_timeout",
            RelayError::WriteFailed(_) => "write_failed",
            RelayError::IdleTimeout(_) => "idle_timeout",
            RelayError::Unreachable(_) => "unreachable",
            RelayError::Busy(_) => "busy",
            RelayError::InvalidRequest(_) => "invalid_request",
            RelayError::Internal(_) => "internal",
            RelayError::RelayUnreachable(_) => "relay_unreachable",
            RelayError::RelayTimeout(_) => "relay_timeout",
        }
    }

    /// Rebuild an error from its wire representation. Unknown kinds are
    /// treated as internal errors so a newer relay never breaks an older client.
    pub fn from_wire(kind: &str, message: &str) -> Self {
        let message = message.to_string();
        match kind {
            "connect_refused" => RelayError::ConnectRefused(message),
            "connect_timeout" => RelayError::ConnectTimeout {
                addr: message,
                after_ms: 0,
            },
            "write_failed" => RelayError::WriteFailed(message),
            "idle_timeout" => RelayError::IdleTimeout(0),
            "unreachable" => RelayError::Unreachable(message),
            "busy" => RelayError::Busy(message),
            "invalid_request" => RelayError::InvalidRequest(message),
            _ => RelayError::Internal(format!("{}: {}", kind, message)),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Printer not found: {0}")]
    NotFound(String),

    #[error("Printer already registered: {0}")]
    AlreadyExists(String),

    #[error("Invalid printer configuration: {0}")]
    InvalidConfig(String),
}

impl RegistryError {
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::NotFound(_) => "not_found",
            RegistryError::AlreadyExists(_) => "already_exists",
            RegistryError::InvalidConfig(_) => "invalid_config",
        }
    }
}

/// Rejections raised before a job enters the queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("No target printer given and no active printer set")]
    NoTarget,

    #[error("Printer not connected: {0}")]
    NotConnected(String),
}

impl DispatchError {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::NoTarget => "no_target",
            DispatchError::NotConnected(_) => "not_connected",
        }
    }
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl BridgeError {
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Config(_) => "config",
            BridgeError::Registry(e) => e.kind(),
            BridgeError::Connection(e) => e.kind(),
            BridgeError::Send(e) => e.kind(),
            BridgeError::Relay(e) => e.kind(),
            BridgeError::Dispatch(e) => e.kind(),
            BridgeError::Usb(_) => "usb",
            BridgeError::Http(_) => "http",
            BridgeError::Io(_) => "io",
            BridgeError::Json(_) => "json",
            BridgeError::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

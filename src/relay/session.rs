//! One relay exchange: connect, write, optionally read, tear down.
//!
//! A session owns its socket and timeouts and shares nothing with other
//! sessions, so a stalled or refused printer only fails its own request.

use crate::errors::RelayError;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Writes are split so the idle timeout measures stalls, not total transfer time.
const WRITE_SLICE: usize = 8 * 1024;
const READ_BUFFER: usize = 4 * 1024;
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySessionDescriptor {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl RelaySessionDescriptor {
    pub fn addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub bytes_written: usize,
    /// Present only when a response was requested; may be empty.
    pub response: Option<Vec<u8>>,
    pub elapsed: Duration,
}

/// Run one exchange against the destination.
///
/// `capture` is the response size cap when the caller expects the printer to
/// answer. Silence, EOF or a read error after a successful write all end the
/// capture without failing the exchange.
pub async fn run_session(
    descriptor: &RelaySessionDescriptor,
    payload: &[u8],
    capture: Option<usize>,
) -> Result<RelayOutcome, RelayError> {
    let started = Instant::now();
    let addr = descriptor.addr();

    let mut stream = match tokio::time::timeout(descriptor.connect_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(classify_connect_error(&addr, descriptor.connect_timeout, e)),
        Err(_) => {
            return Err(RelayError::ConnectTimeout {
                addr,
                after_ms: descriptor.connect_timeout.as_millis() as u64,
            })
        }
    };

    configure_socket(&stream);
    debug!("Relay session connected to {}", addr);

    let written = write_payload(&mut stream, payload, descriptor.idle_timeout, &addr).await;
    let bytes_written = match written {
        Ok(n) => n,
        Err(e) => {
            let _ = stream.shutdown().await;
            return Err(e);
        }
    };

    let response = match capture {
        Some(limit) => Some(read_response(&mut stream, limit, descriptor.idle_timeout).await),
        None => None,
    };

    if let Err(e) = stream.shutdown().await {
        debug!("Relay session shutdown for {} failed: {} (ignored)", addr, e);
    }

    Ok(RelayOutcome {
        bytes_written,
        response,
        elapsed: started.elapsed(),
    })
}

async fn write_payload(
    stream: &mut TcpStream,
    payload: &[u8],
    idle: Duration,
    addr: &str,
) -> Result<usize, RelayError> {
    let mut written = 0;
    for slice in payload.chunks(WRITE_SLICE) {
        match tokio::time::timeout(idle, stream.write_all(slice)).await {
            Ok(Ok(())) => written += slice.len(),
            Ok(Err(e)) => {
                return Err(RelayError::WriteFailed(format!(
                    "{} after {} bytes: {}",
                    addr, written, e
                )))
            }
            Err(_) => return Err(RelayError::IdleTimeout(idle.as_millis() as u64)),
        }
    }

    match tokio::time::timeout(idle, stream.flush()).await {
        Ok(Ok(())) => Ok(written),
        Ok(Err(e)) => Err(RelayError::WriteFailed(format!("{}: {}", addr, e))),
        Err(_) => Err(RelayError::IdleTimeout(idle.as_millis() as u64)),
    }
}

async fn read_response(stream: &mut TcpStream, limit: usize, idle: Duration) -> Vec<u8> {
    let mut response = Vec::new();
    let mut buf = [0u8; READ_BUFFER];

    while response.len() < limit {
        let want = (limit - response.len()).min(buf.len());
        match tokio::time::timeout(idle, stream.read(&mut buf[..want])).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => response.extend_from_slice(&buf[..n]),
            Ok(Err(e)) => {
                debug!("Response read ended with error: {}", e);
                break;
            }
            // Printer went quiet
            Err(_) => break,
        }
    }

    response
}

fn classify_connect_error(addr: &str, timeout: Duration, e: io::Error) -> RelayError {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => RelayError::ConnectRefused(addr.to_string()),
        io::ErrorKind::TimedOut => RelayError::ConnectTimeout {
            addr: addr.to_string(),
            after_ms: timeout.as_millis() as u64,
        },
        _ => RelayError::Unreachable(format!("{}: {}", addr, e)),
    }
}

fn configure_socket(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {} (non-fatal)", e);
    }

    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
    let keepalive = keepalive.with_interval(Duration::from_secs(10));

    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        debug!("Failed to set TCP keepalive: {} (non-fatal)", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv6_addr_is_bracketed() {
        let descriptor = RelaySessionDescriptor {
            host: "fe80::1".to_string(),
            port: 9100,
            connect_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(1),
        };
        assert_eq!(descriptor.addr(), "[fe80::1]:9100");

        let descriptor = RelaySessionDescriptor {
            host: "192.168.1.50".to_string(),
            ..descriptor
        };
        assert_eq!(descriptor.addr(), "192.168.1.50:9100");
    }

    #[test]
    fn test_connect_error_classification() {
        let timeout = Duration::from_millis(250);
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(
            classify_connect_error("10.0.0.1:9100", timeout, refused),
            RelayError::ConnectRefused("10.0.0.1:9100".to_string())
        );

        let timed_out = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(
            classify_connect_error("10.0.0.1:9100", timeout, timed_out).kind(),
            "connect_timeout"
        );

        let other = io::Error::new(io::ErrorKind::Other, "no route to host");
        assert_eq!(
            classify_connect_error("10.0.0.1:9100", timeout, other).kind(),
            "unreachable"
        );
    }
}

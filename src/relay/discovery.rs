//! Subnet discovery: TCP-connect probes against the raw printing port.

use crate::config::RelayConfig;
use crate::errors::RelayError;
use crate::relay::wire::{DiscoveredHost, DiscoveryRequest, DiscoveryResponse};
use futures_util::stream::{self, StreamExt};
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, info};

const DEFAULT_FIRST_HOST: u8 = 1;
const DEFAULT_LAST_HOST: u8 = 254;

/// Expand a discovery target into the list of addresses to probe.
///
/// Accepted forms: a three-octet prefix ("192.168.1"), CIDR
/// ("192.168.1.0/24"), a single address, or empty for the local subnet.
/// The `first_host`/`last_host` slice applies to prefix forms only.
pub fn plan_hosts(
    subnet_prefix: &str,
    first_host: Option<u8>,
    last_host: Option<u8>,
    max_hosts: usize,
) -> Result<Vec<Ipv4Addr>, RelayError> {
    let target = subnet_prefix.trim().trim_end_matches('.');

    let hosts = if target.is_empty() {
        let local = local_subnet_prefix()?;
        debug!("Discovery target defaulted to local subnet {}.0/24", local);
        prefix_hosts(&local, first_host, last_host)?
    } else if target.contains('/') {
        parse_cidr(target, max_hosts)?
    } else if target.split('.').count() == 4 {
        let ip: Ipv4Addr = target
            .parse()
            .map_err(|_| RelayError::InvalidRequest(format!("invalid IPv4 address: {}", target)))?;
        vec![ip]
    } else {
        prefix_hosts(target, first_host, last_host)?
    };

    if hosts.len() > max_hosts {
        return Err(RelayError::InvalidRequest(format!(
            "discovery range covers {} hosts (limit {})",
            hosts.len(),
            max_hosts
        )));
    }

    Ok(hosts)
}

fn prefix_hosts(
    prefix: &str,
    first_host: Option<u8>,
    last_host: Option<u8>,
) -> Result<Vec<Ipv4Addr>, RelayError> {
    let octets: Vec<u8> = prefix
        .split('.')
        .map(|part| part.parse::<u8>())
        .collect::<Result<_, _>>()
        .map_err(|_| RelayError::InvalidRequest(format!("invalid subnet prefix: {}", prefix)))?;

    let [a, b, c] = octets[..] else {
        return Err(RelayError::InvalidRequest(format!(
            "subnet prefix must have three octets, got '{}'",
            prefix
        )));
    };

    let first = first_host.unwrap_or(DEFAULT_FIRST_HOST);
    let last = last_host.unwrap_or(DEFAULT_LAST_HOST);
    if first > last {
        return Err(RelayError::InvalidRequest(format!(
            "first_host {} is after last_host {}",
            first, last
        )));
    }

    Ok((first..=last).map(|d| Ipv4Addr::new(a, b, c, d)).collect())
}

/// Parse CIDR notation into host addresses, excluding network and broadcast
/// addresses for prefixes shorter than /31. Ranges larger than `max_hosts`
/// are rejected before any address is materialized.
pub fn parse_cidr(cidr: &str, max_hosts: usize) -> Result<Vec<Ipv4Addr>, RelayError> {
    let (base, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| RelayError::InvalidRequest(format!("invalid CIDR notation: {}", cidr)))?;

    let base_ip: Ipv4Addr = base
        .parse()
        .map_err(|_| RelayError::InvalidRequest(format!("invalid IP address: {}", base)))?;

    let prefix_len: u32 = prefix
        .parse()
        .ok()
        .filter(|p| *p <= 32)
        .ok_or_else(|| RelayError::InvalidRequest(format!("invalid prefix length: {}", prefix)))?;

    let mask = u32::MAX.checked_shl(32 - prefix_len).unwrap_or(0);
    let network = u32::from(base_ip) & mask;
    let broadcast = network | !mask;

    let (first, last) = if prefix_len >= 31 {
        (network, broadcast)
    } else {
        (network + 1, broadcast - 1)
    };

    let count = u64::from(last - first) + 1;
    if count > max_hosts as u64 {
        return Err(RelayError::InvalidRequest(format!(
            "discovery range covers {} hosts (limit {})",
            count, max_hosts
        )));
    }

    Ok((first..=last).map(Ipv4Addr::from).collect())
}

fn local_subnet_prefix() -> Result<String, RelayError> {
    match local_ip_address::local_ip() {
        Ok(IpAddr::V4(ip)) => {
            let [a, b, c, _] = ip.octets();
            Ok(format!("{}.{}.{}", a, b, c))
        }
        Ok(IpAddr::V6(_)) | Err(_) => Err(RelayError::InvalidRequest(
            "could not determine the local IPv4 subnet; pass subnet_prefix explicitly".to_string(),
        )),
    }
}

/// Probe every host concurrently (at most `concurrency` in flight) and
/// return the responsive ones sorted by address.
pub async fn probe_hosts(
    hosts: Vec<Ipv4Addr>,
    port: u16,
    probe_timeout: Duration,
    concurrency: usize,
) -> Vec<DiscoveredHost> {
    let mut found: Vec<(Ipv4Addr, Duration)> = stream::iter(hosts)
        .map(|ip| async move { probe(ip, port, probe_timeout).await.map(|rtt| (ip, rtt)) })
        .buffer_unordered(concurrency.max(1))
        .filter_map(|hit| async move { hit })
        .collect()
        .await;

    found.sort_by_key(|(ip, _)| *ip);

    found
        .into_iter()
        .map(|(ip, rtt)| DiscoveredHost {
            host: ip.to_string(),
            response_time_ms: rtt.as_millis() as u64,
        })
        .collect()
}

async fn probe(ip: Ipv4Addr, port: u16, probe_timeout: Duration) -> Option<Duration> {
    let started = Instant::now();
    match tokio::time::timeout(probe_timeout, TcpStream::connect((ip, port))).await {
        Ok(Ok(_stream)) => Some(started.elapsed()),
        _ => None,
    }
}

/// Run a full discovery request with the relay's limits applied.
pub async fn discover(
    request: &DiscoveryRequest,
    config: &RelayConfig,
) -> Result<DiscoveryResponse, RelayError> {
    let started = Instant::now();
    let port = request.port.unwrap_or(config.discovery_port);
    if port == 0 {
        return Err(RelayError::InvalidRequest("discovery port must be non-zero".to_string()));
    }

    let hosts = plan_hosts(
        &request.subnet_prefix,
        request.first_host,
        request.last_host,
        config.discovery_max_hosts,
    )?;
    let probe_timeout =
        config.clamp_timeout(request.probe_timeout_ms, config.discovery_probe_timeout_ms);
    let scanned = hosts.len();

    info!(
        "Discovery: probing {} hosts on port {} (timeout {:?})",
        scanned, port, probe_timeout
    );

    let found = probe_hosts(hosts, port, probe_timeout, config.discovery_concurrency).await;

    info!("Discovery found {} responsive hosts", found.len());

    Ok(DiscoveryResponse {
        hosts: found,
        scanned,
        port,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

// Integration tests for relay sessions against real loopback sockets

mod common;

#[cfg(target_os = "linux")]
use common::stalled_listener;
use common::{closed_port, test_payload, FakePrinter, TestRelay};
use eatsome_printer_bridge::config::RelayConfig;
use eatsome_printer_bridge::errors::RelayError;
use eatsome_printer_bridge::relay::client::RelayClient;
use eatsome_printer_bridge::relay::wire::RelayRequest;
use eatsome_printer_bridge::relay::RelayService;
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn held_request(port: u16, idle_ms: u64) -> RelayRequest {
    // A silent printer keeps the session open until the idle timeout ends the read
    let mut request = RelayRequest::new("127.0.0.1", port, test_payload(16)).expect_response();
    request.idle_timeout_ms = Some(idle_ms);
    request
}

#[tokio::test]
async fn test_payload_delivered_byte_exact() {
    let printer = FakePrinter::start().await;
    let service = RelayService::new(RelayConfig::default());

    let payload = test_payload(20_000);
    let outcome = service
        .relay(RelayRequest::new("127.0.0.1", printer.port(), payload.clone()))
        .await
        .unwrap();

    assert_eq!(outcome.bytes_written, 20_000);
    assert_eq!(outcome.response, None);
    assert_eq!(printer.wait_for_jobs(1).await, vec![payload]);
    assert_eq!(service.in_flight(), 0);
}

#[tokio::test]
async fn test_refused_destination() {
    let service = RelayService::new(RelayConfig::default());
    let port = closed_port().await;

    let err = service
        .relay(RelayRequest::new("127.0.0.1", port, test_payload(8)))
        .await
        .unwrap_err();

    assert_eq!(err, RelayError::ConnectRefused(format!("127.0.0.1:{}", port)));
}

// A destination that never completes the TCP handshake
#[cfg(target_os = "linux")]
#[tokio::test]
#[serial]
async fn test_unanswered_handshake_fails_within_connect_timeout() {
    let stalled = stalled_listener("127.0.0.1", 0);
    let service = RelayService::new(RelayConfig::default());
    let mut request = RelayRequest::new("127.0.0.1", stalled.addr.port(), test_payload(8));
    request.connect_timeout_ms = Some(1_000);

    let started = Instant::now();
    let err = service.relay(request).await.unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(
        err,
        RelayError::ConnectTimeout {
            addr: stalled.addr.to_string(),
            after_ms: 1_000,
        }
    );
    assert!(elapsed >= Duration::from_millis(1_000), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1_500), "{:?}", elapsed);
    assert_eq!(service.in_flight(), 0);
}

#[tokio::test]
async fn test_response_bytes_are_captured() {
    let printer = FakePrinter::start_with_reply(vec![0x10, 0x04, 0x12]).await;
    let service = RelayService::new(RelayConfig::default());

    let outcome = service
        .relay(RelayRequest::new("127.0.0.1", printer.port(), vec![0x10, 0x04, 0x01]).expect_response())
        .await
        .unwrap();

    assert_eq!(outcome.response, Some(vec![0x10, 0x04, 0x12]));
}

#[tokio::test]
async fn test_response_capture_is_bounded() {
    let printer = FakePrinter::start_with_reply(vec![0xAA; 64]).await;
    let service = RelayService::new(RelayConfig {
        max_response_bytes: 10,
        ..RelayConfig::default()
    });

    let outcome = service
        .relay(RelayRequest::new("127.0.0.1", printer.port(), vec![0x1B]).expect_response())
        .await
        .unwrap();

    assert_eq!(outcome.response, Some(vec![0xAA; 10]));
}

#[tokio::test]
#[serial]
async fn test_silent_printer_is_not_an_error() {
    let printer = FakePrinter::start().await;
    let service = RelayService::new(RelayConfig::default());

    let outcome = service.relay(held_request(printer.port(), 200)).await.unwrap();

    assert_eq!(outcome.bytes_written, 16);
    assert_eq!(outcome.response, Some(Vec::new()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failing_session_does_not_affect_others() {
    let printer = FakePrinter::start().await;
    let refused = closed_port().await;
    let service = Arc::new(RelayService::new(RelayConfig::default()));

    let good = {
        let service = service.clone();
        let port = printer.port();
        tokio::spawn(async move {
            service
                .relay(RelayRequest::new("127.0.0.1", port, b"good".to_vec()))
                .await
        })
    };
    let bad = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .relay(RelayRequest::new("127.0.0.1", refused, b"bad".to_vec()))
                .await
        })
    };

    assert_eq!(good.await.unwrap().unwrap().bytes_written, 4);
    assert_eq!(bad.await.unwrap().unwrap_err().kind(), "connect_refused");
    assert_eq!(printer.wait_for_jobs(1).await, vec![b"good".to_vec()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_full_admission_queue_signals_busy() {
    let printer = FakePrinter::start().await;
    let service = Arc::new(RelayService::new(RelayConfig {
        max_sessions: 1,
        admission_queue: 0,
        ..RelayConfig::default()
    }));

    let holder = {
        let service = service.clone();
        let request = held_request(printer.port(), 600);
        tokio::spawn(async move { service.relay(request).await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(service.in_flight(), 1);

    let err = service
        .relay(RelayRequest::new("127.0.0.1", printer.port(), b"x".to_vec()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "busy");

    assert!(holder.await.unwrap().is_ok());
    assert_eq!(service.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_queued_request_runs_when_slot_frees() {
    let printer = FakePrinter::start().await;
    let service = Arc::new(RelayService::new(RelayConfig {
        max_sessions: 1,
        admission_queue: 4,
        admission_wait_ms: 5_000,
        ..RelayConfig::default()
    }));

    let holder = {
        let service = service.clone();
        let request = held_request(printer.port(), 400);
        tokio::spawn(async move { service.relay(request).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let waiter = {
        let service = service.clone();
        let port = printer.port();
        tokio::spawn(async move {
            service
                .relay(RelayRequest::new("127.0.0.1", port, b"queued".to_vec()))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(service.status().queued_requests, 1);

    assert!(holder.await.unwrap().is_ok());
    assert_eq!(waiter.await.unwrap().unwrap().bytes_written, 6);
    assert_eq!(service.queued(), 0);
}

#[tokio::test]
async fn test_wire_errors_keep_their_kind() {
    let relay = TestRelay::start().await;
    let client = RelayClient::new(&relay.url(), None, Duration::from_secs(5));

    let err = client
        .relay(&RelayRequest::new("127.0.0.1", closed_port().await, b"x".to_vec()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "connect_refused");

    let err = client
        .relay(&RelayRequest::new("127.0.0.1", 0, b"x".to_vec()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_request");

    let status = client.status().await.unwrap();
    assert_eq!(status.in_flight_sessions, 0);
    assert_eq!(status.version, env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_token_required_when_configured() {
    let relay = TestRelay::start_with(RelayConfig {
        auth_token: Some("bridge-secret".to_string()),
        ..RelayConfig::default()
    })
    .await;
    let printer = FakePrinter::start().await;

    let anonymous = RelayClient::new(&relay.url(), None, Duration::from_secs(5));
    let err = anonymous.status().await.unwrap_err();
    assert_eq!(err.kind(), "invalid_request");

    let authorized = RelayClient::new(
        &relay.url(),
        Some("bridge-secret".to_string()),
        Duration::from_secs(5),
    );
    let response = authorized
        .relay(&RelayRequest::new("127.0.0.1", printer.port(), b"ok".to_vec()))
        .await
        .unwrap();
    assert!(response.accepted);
    assert_eq!(response.bytes_written, 2);
}

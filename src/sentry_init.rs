use once_cell::sync::Lazy;
use regex::Regex;
use sentry::{ClientInitGuard, ClientOptions};
use std::env;
use std::sync::Arc;

// Compiled once; every outgoing event is scrubbed with these
static BEARER_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)bearer\s+[A-Za-z0-9._~+/=-]+").expect("Invalid bearer regex pattern")
});
static EMAIL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b")
        .expect("Invalid email regex pattern")
});
static IPV4_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("Invalid IPv4 regex pattern")
});

/// Initialize Sentry crash reporting for the relay daemon.
///
/// # Environment Variables
/// - `SENTRY_DSN`: Sentry Data Source Name (required)
/// - `SENTRY_ENVIRONMENT`: Environment name (default: "development")
/// - `SENTRY_RELEASE`: Release version (default: from Cargo.toml)
/// - `SENTRY_TRACES_SAMPLE_RATE`: Performance monitoring sample rate (default: 0.1)
///
/// Returns `None` when no DSN is configured. The guard must outlive the
/// runtime or buffered events are lost. Call before installing the tracing
/// subscriber so the `sentry_tracing` layer has a client from the first
/// log line on; nothing is logged from here.
pub fn init() -> Option<ClientInitGuard> {
    let dsn = match env::var("SENTRY_DSN").ok() {
        Some(d) if !d.is_empty() => d,
        _ => return None,
    };

    let environment = env::var("SENTRY_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
    let release = env::var("SENTRY_RELEASE").unwrap_or_else(|_| {
        format!("{}@{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    });
    let traces_sample_rate = env::var("SENTRY_TRACES_SAMPLE_RATE")
        .ok()
        .and_then(|s| s.parse::<f32>().ok())
        .unwrap_or(0.1);

    let guard = sentry::init((
        dsn,
        ClientOptions {
            release: Some(release.into()),
            environment: Some(environment.into()),
            traces_sample_rate,
            attach_stacktrace: true,
            send_default_pii: false,
            before_send: Some(Arc::new(before_send_filter)),
            ..Default::default()
        },
    ));

    Some(guard)
}

fn before_send_filter(
    mut event: sentry::protocol::Event<'static>,
) -> Option<sentry::protocol::Event<'static>> {
    if let Some(message) = event.message.as_mut() {
        *message = scrub(message);
    }

    for exception in &mut event.exception.values {
        if let Some(value) = exception.value.as_mut() {
            *value = scrub(value);
        }
    }

    for breadcrumb in &mut event.breadcrumbs.values {
        if let Some(message) = breadcrumb.message.as_mut() {
            *message = scrub(message);
        }
    }

    event
        .tags
        .insert("bridge_version".into(), env!("CARGO_PKG_VERSION").into());
    event.tags.insert("platform".into(), std::env::consts::OS.into());
    event.tags.insert("arch".into(), std::env::consts::ARCH.into());

    Some(event)
}

/// Remove credentials, e-mail addresses and printer addresses from a message.
pub fn scrub(message: &str) -> String {
    // Tokens first: a token may itself look like an address
    let cleaned = BEARER_REGEX.replace_all(message, "Bearer [TOKEN_REDACTED]");
    let cleaned = EMAIL_REGEX.replace_all(&cleaned, "[EMAIL_REDACTED]");
    IPV4_REGEX.replace_all(&cleaned, "[IP_REDACTED]").to_string()
}

/// Report a relay session that failed for a reason other than the
/// destination (internal errors, dead session tasks).
pub fn capture_relay_failure(kind: &str, message: &str) {
    sentry::with_scope(
        |scope| {
            scope.set_tag("event_type", "relay_failure");
            scope.set_tag("error_kind", kind);
        },
        || {
            sentry::capture_message(
                &format!("Relay session failed: {}", scrub(message)),
                sentry::Level::Error,
            );
        },
    );
}

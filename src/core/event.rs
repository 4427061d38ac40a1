//! The structured events the proxy emits for the event sink (C2).

use std::fmt;
use std::net::SocketAddr;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "INFO",
            Severity::Warn => "WARNING",
            Severity::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// The structured payload carried by each event kind.
#[derive(Debug, Clone)]
pub enum EventPayload {
    ConnOpen {
        client: SocketAddr,
    },
    ConnClose {
        client: SocketAddr,
    },
    HttpReq {
        client: SocketAddr,
        host: String,
        target: String,
        duration_ms: u128,
    },
    CacheHit {
        key: String,
    },
    CacheMiss {
        key: String,
    },
    BlockedHttp {
        host: String,
    },
    BlockedHttps {
        host: String,
    },
    UpstreamStatus {
        host: String,
        status_line: String,
    },
    UpstreamTimeout {
        host: String,
    },
    RelayError {
        client: SocketAddr,
        host: String,
        reason: String,
    },
    HandlerError {
        client: SocketAddr,
        reason: String,
    },
}

/// A single emitted event: timestamp, severity, and a structured payload.
#[derive(Debug, Clone)]
pub struct Event {
    pub at: SystemTime,
    pub severity: Severity,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(severity: Severity, payload: EventPayload) -> Self {
        Self {
            at: SystemTime::now(),
            severity,
            payload,
        }
    }

    /// Renders the event as the single dashboard/log-relevant message line
    /// (the text the original logger's format string called `message`).
    pub fn message(&self) -> String {
        match &self.payload {
            EventPayload::ConnOpen { client } => format!("[+] New connection from {client}"),
            EventPayload::ConnClose { client } => format!("[-] Connection closed {client}"),
            EventPayload::HttpReq {
                client,
                host,
                target,
                duration_ms,
            } => format!(
                "[Response] http://{host}{target} | client {client} | Duration: {:.2}s",
                *duration_ms as f64 / 1000.0
            ),
            EventPayload::CacheHit { key } => format!("[Cache HIT] {key}"),
            EventPayload::CacheMiss { key } => format!("[Cache MISS] {key}"),
            EventPayload::BlockedHttp { host } => format!("[Blocked] Attempted access to {host}"),
            EventPayload::BlockedHttps { host } => {
                format!("[Blocked HTTPS] Attempted access to {host}")
            }
            EventPayload::UpstreamStatus { host, status_line } => {
                format!("[Status Code] {host} -> {status_line}")
            }
            EventPayload::UpstreamTimeout { host } => {
                format!("[!] Timeout while reading from {host}")
            }
            EventPayload::RelayError {
                client,
                host,
                reason,
            } => format!("[!] Connection error in HTTPS tunnel: {client} <-> {host} | {reason}"),
            EventPayload::HandlerError { client, reason } => {
                format!("[!] Error handling client {client}: {reason}")
            }
        }
    }
}

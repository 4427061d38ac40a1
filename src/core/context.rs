//! Per-connection ephemeral state.
//!
//! `ConnectionContext` lives for the lifetime of a single accepted socket. It is
//! created by the acceptor and handed to the handler; it never outlives the
//! connection it describes.

use std::net::SocketAddr;
use std::time::Instant;

/// The path a connection took through the request handler state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Http,
    Tunnel,
    Blocked,
    BadRequest,
}

/// Per-request ephemeral data, as described by the data model's `ConnectionContext`.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub client_addr: SocketAddr,
    pub upstream_addr: Option<String>,
    pub start: Instant,
    pub mode: Option<Mode>,
}

impl ConnectionContext {
    pub fn new(client_addr: SocketAddr) -> Self {
        Self {
            client_addr,
            upstream_addr: None,
            start: Instant::now(),
            mode: None,
        }
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = Some(mode);
    }

    pub fn set_upstream(&mut self, addr: impl Into<String>) {
        self.upstream_addr = Some(addr.into());
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

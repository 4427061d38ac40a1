//! The connection acceptor (C6): owns the listening socket and spawns one
//! detached worker per accepted connection.

use std::io;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;

use crate::handler::Handler;

const LISTEN_BACKLOG: u32 = 100;

pub struct Acceptor {
    listener: TcpListener,
    handler: Arc<Handler>,
}

impl Acceptor {
    /// Binds `host:port` with `SO_REUSEADDR` set and a backlog of 100,
    /// matching the listening-socket contract.
    pub async fn bind(host: &str, port: u16, handler: Handler) -> io::Result<Self> {
        let addr = format!("{host}:{port}")
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{e}")))?;

        let socket = match addr {
            std::net::SocketAddr::V4(_) => TcpSocket::new_v4()?,
            std::net::SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;

        Ok(Self {
            listener,
            handler: Arc::new(handler),
        })
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` signals true. Each accepted
    /// socket is handed to a freshly spawned, detached worker running the
    /// request handler state machine; the acceptor never joins them, so
    /// shutdown here only stops taking new connections.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("acceptor stopping: no longer accepting new connections");
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, client_addr)) => {
                            let handler = Arc::clone(&self.handler);
                            tokio::spawn(async move {
                                handler.handle(stream, client_addr).await;
                            });
                        }
                        Err(e) => {
                            log::warn!("accept failed: {e}");
                        }
                    }
                }
            }
        }
    }
}

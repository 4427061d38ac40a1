//! The per-connection request handler (C5): HTTP forward-with-cache, or an
//! opaque HTTPS `CONNECT` tunnel. One call to `Handler::handle` owns one
//! accepted socket end to end and never lets an error escape to the acceptor.

mod parse;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::blacklist::Blacklist;
use crate::cache::{normalize, Cache, CacheEntry};
use crate::core::context::{ConnectionContext, Mode};
use crate::core::event::{Event, EventPayload, Severity};
use crate::logging::EventSink;

const INITIAL_READ_CAP: usize = 8192;
const STREAM_CHUNK: usize = 4096;
const IO_TIMEOUT: Duration = Duration::from_secs(5);
const CACHE_SIZE_CEILING: usize = 1_000_000;
const DEFAULT_HTTP_PORT: u16 = 80;

const RESPONSE_400: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\nMissing Host Header";
const RESPONSE_403: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\r\nBlocked by Proxy";
const RESPONSE_504: &[u8] = b"HTTP/1.1 504 Gateway Timeout\r\n\r\n";
const RESPONSE_200_CONNECT: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Holds the shared dependencies a connection worker needs; cheap to clone,
/// intended to be handed to a fresh `tokio::spawn` per accepted socket.
#[derive(Clone)]
pub struct Handler {
    cache: Arc<Cache>,
    blacklist: Arc<Blacklist>,
    sink: EventSink,
}

impl Handler {
    pub fn new(cache: Arc<Cache>, blacklist: Arc<Blacklist>, sink: EventSink) -> Self {
        Self {
            cache,
            blacklist,
            sink,
        }
    }

    fn emit(&self, severity: Severity, payload: EventPayload) {
        self.sink.emit(Event::new(severity, payload));
    }

    /// Drives one accepted socket through the full state machine. Never
    /// panics and never returns an error. Every failure path is converted
    /// to a `HANDLER_ERROR` event or a client-visible status response.
    pub async fn handle(&self, mut client: TcpStream, client_addr: SocketAddr) {
        let mut ctx = ConnectionContext::new(client_addr);
        self.emit(
            Severity::Info,
            EventPayload::ConnOpen { client: client_addr },
        );

        let mut buf = vec![0u8; INITIAL_READ_CAP];
        let n = match timeout(IO_TIMEOUT, client.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => n,
            _ => {
                self.emit(
                    Severity::Info,
                    EventPayload::ConnClose { client: client_addr },
                );
                return;
            }
        };
        buf.truncate(n);

        let outcome = match parse::parse_request_line(&buf) {
            Some((line, _)) if line.method.eq_ignore_ascii_case("CONNECT") => {
                ctx.set_mode(Mode::Tunnel);
                let target = line.target.to_string();
                self.handle_connect(&mut client, &mut ctx, &target).await
            }
            Some((line, _)) => {
                ctx.set_mode(Mode::Http);
                let target = line.target.to_string();
                self.handle_http(&mut client, &mut ctx, &buf, &target).await
            }
            None => {
                ctx.set_mode(Mode::BadRequest);
                let _ = write_timed(&mut client, RESPONSE_400).await;
                Err("malformed request: no parseable request line".to_string())
            }
        };

        if let Err(reason) = outcome {
            self.emit(
                Severity::Warn,
                EventPayload::HandlerError {
                    client: client_addr,
                    reason,
                },
            );
        }
        self.emit(
            Severity::Info,
            EventPayload::ConnClose { client: client_addr },
        );
    }

    async fn handle_http(
        &self,
        client: &mut TcpStream,
        ctx: &mut ConnectionContext,
        request_bytes: &[u8],
        target: &str,
    ) -> Result<(), String> {
        let client_addr = ctx.client_addr;

        let host_header = match parse::find_header(request_bytes, "Host") {
            Some(h) => h.to_string(),
            None => {
                write_timed(client, RESPONSE_400).await?;
                return Ok(());
            }
        };

        let (dest_host, dest_port) = parse::split_host_port(&host_header);
        let dest_port = dest_port.unwrap_or(DEFAULT_HTTP_PORT);
        let key = normalize(&host_header, target);

        if self.blacklist.is_blocked(&dest_host) {
            ctx.set_mode(Mode::Blocked);
            self.emit(
                Severity::Warn,
                EventPayload::BlockedHttp {
                    host: dest_host.clone(),
                },
            );
            write_timed(client, RESPONSE_403).await?;
            return Ok(());
        }

        if let Some(entry) = self.cache.get(&key) {
            self.emit(Severity::Info, EventPayload::CacheHit { key });
            write_timed(client, &entry.bytes).await?;
            return Ok(());
        }
        self.emit(Severity::Info, EventPayload::CacheMiss { key: key.clone() });

        ctx.set_upstream(format!("{dest_host}:{dest_port}"));
        let mut upstream =
            match timeout(IO_TIMEOUT, TcpStream::connect((dest_host.as_str(), dest_port))).await {
                Ok(Ok(stream)) => stream,
                // UPSTREAM_UNREACHABLE: close without sending a body.
                Ok(Err(e)) => {
                    log::warn!("failed to connect to upstream {dest_host}:{dest_port}: {e}");
                    return Ok(());
                }
                Err(_) => {
                    log::warn!("timed out connecting to upstream {dest_host}:{dest_port}");
                    return Ok(());
                }
            };

        if write_timed(&mut upstream, request_bytes).await.is_err() {
            self.emit(
                Severity::Warn,
                EventPayload::UpstreamTimeout {
                    host: dest_host.clone(),
                },
            );
            let _ = write_timed(client, RESPONSE_504).await;
            return Ok(());
        }

        let mut accumulated = Vec::new();
        let mut first_byte_received = false;
        let mut clean_close = false;
        let mut chunk = vec![0u8; STREAM_CHUNK];

        loop {
            match timeout(IO_TIMEOUT, upstream.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    clean_close = true;
                    break;
                }
                Ok(Ok(read)) => {
                    first_byte_received = true;
                    if write_timed(client, &chunk[..read]).await.is_err() {
                        return Err("failed writing response to client mid-stream".to_string());
                    }
                    if accumulated.len() < CACHE_SIZE_CEILING {
                        accumulated.extend_from_slice(&chunk[..read]);
                    }
                }
                Ok(Err(e)) => {
                    return Err(format!("upstream read error: {e}"));
                }
                Err(_) => {
                    self.emit(
                        Severity::Warn,
                        EventPayload::UpstreamTimeout {
                            host: dest_host.clone(),
                        },
                    );
                    if !first_byte_received {
                        let _ = write_timed(client, RESPONSE_504).await;
                    }
                    break;
                }
            }
        }

        if clean_close && !accumulated.is_empty() {
            self.emit(
                Severity::Info,
                EventPayload::UpstreamStatus {
                    host: dest_host.clone(),
                    status_line: parse::status_line_of(&accumulated),
                },
            );
        }

        if clean_close && accumulated.len() < CACHE_SIZE_CEILING {
            self.cache.set(key, CacheEntry::new(accumulated));
        }

        self.emit(
            Severity::Info,
            EventPayload::HttpReq {
                client: client_addr,
                host: dest_host,
                target: target.to_string(),
                duration_ms: ctx.elapsed().as_millis(),
            },
        );

        Ok(())
    }

    async fn handle_connect(
        &self,
        client: &mut TcpStream,
        ctx: &mut ConnectionContext,
        target: &str,
    ) -> Result<(), String> {
        let client_addr = ctx.client_addr;
        let (host, port) = match parse::parse_connect_target(target) {
            Some(hp) => hp,
            None => {
                write_timed(client, RESPONSE_400).await?;
                return Ok(());
            }
        };

        if self.blacklist.is_blocked(&host) {
            ctx.set_mode(Mode::Blocked);
            self.emit(
                Severity::Warn,
                EventPayload::BlockedHttps { host: host.clone() },
            );
            write_timed(client, RESPONSE_403).await?;
            return Ok(());
        }

        ctx.set_upstream(format!("{host}:{port}"));
        let mut upstream = match timeout(IO_TIMEOUT, TcpStream::connect((host.as_str(), port))).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                log::warn!("failed to connect to upstream {host}:{port} for CONNECT: {e}");
                return Ok(());
            }
            Err(_) => {
                log::warn!("timed out connecting to upstream {host}:{port} for CONNECT");
                return Ok(());
            }
        };

        if write_timed(client, RESPONSE_200_CONNECT).await.is_err() {
            return Ok(());
        }

        self.relay(client, &mut upstream, client_addr, &host).await
    }

    /// Blind bidirectional relay: whichever side has bytes ready gets
    /// forwarded to the other, up to 4 KiB at a time. A 5-second idle tick
    /// with nothing readable just loops again; the tunnel stays open as long
    /// as either side is alive.
    async fn relay(
        &self,
        client: &mut TcpStream,
        upstream: &mut TcpStream,
        client_addr: SocketAddr,
        host: &str,
    ) -> Result<(), String> {
        let (mut client_r, mut client_w) = client.split();
        let (mut upstream_r, mut upstream_w) = upstream.split();

        let mut client_buf = vec![0u8; STREAM_CHUNK];
        let mut upstream_buf = vec![0u8; STREAM_CHUNK];

        loop {
            tokio::select! {
                result = client_r.read(&mut client_buf) => {
                    match result {
                        Ok(0) => return Ok(()),
                        Ok(read) => {
                            if upstream_w.write_all(&client_buf[..read]).await.is_err() {
                                self.emit(Severity::Warn, EventPayload::RelayError {
                                    client: client_addr,
                                    host: host.to_string(),
                                    reason: "write to upstream failed".to_string(),
                                });
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            self.emit(Severity::Warn, EventPayload::RelayError {
                                client: client_addr,
                                host: host.to_string(),
                                reason: format!("client read error: {e}"),
                            });
                            return Ok(());
                        }
                    }
                }
                result = upstream_r.read(&mut upstream_buf) => {
                    match result {
                        Ok(0) => return Ok(()),
                        Ok(read) => {
                            if client_w.write_all(&upstream_buf[..read]).await.is_err() {
                                self.emit(Severity::Warn, EventPayload::RelayError {
                                    client: client_addr,
                                    host: host.to_string(),
                                    reason: "write to client failed".to_string(),
                                });
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            self.emit(Severity::Warn, EventPayload::RelayError {
                                client: client_addr,
                                host: host.to_string(),
                                reason: format!("upstream read error: {e}"),
                            });
                            return Ok(());
                        }
                    }
                }
                _ = tokio::time::sleep(IO_TIMEOUT) => {
                    continue;
                }
            }
        }
    }
}

async fn write_timed(stream: &mut TcpStream, data: &[u8]) -> Result<(), String> {
    match timeout(IO_TIMEOUT, stream.write_all(data)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("timed out writing to socket".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;
    use tokio::net::TcpListener;

    fn handler() -> Handler {
        Handler::new(
            Arc::new(Cache::new(10)),
            Arc::new(Blacklist::empty()),
            test_sink(),
        )
    }

    fn test_sink() -> EventSink {
        let (_tx, rx) = tokio::sync::watch::channel(false);
        crate::logging::spawn(
            std::env::temp_dir().join("handler-test-proxy.log"),
            std::env::temp_dir().join("handler-test-proxy-dash.log"),
            rx,
        )
        .0
    }

    async fn spawn_echo_upstream(response: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = vec![0u8; 8192];
                let _ = sock.read(&mut buf).await;
                let _ = sock.write_all(response).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn missing_host_header_yields_400() {
        let h = handler();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            h.handle(stream, peer).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /a HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut resp = Vec::new();
        let _ = client.read_to_end(&mut resp).await;
        server.await.unwrap();

        assert!(resp.starts_with(b"HTTP/1.1 400 Bad Request"));
        assert!(resp.ends_with(b"Missing Host Header"));
    }

    #[tokio::test]
    async fn blocked_host_yields_403_and_no_upstream_dial() {
        let blacklist = Arc::new(Blacklist::new(vec![
            Regex::new("(?i)ads\\.example\\.com").unwrap()
        ]));
        let h = Handler::new(Arc::new(Cache::new(10)), blacklist, test_sink());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            h.handle(stream, peer).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: ads.example.com\r\n\r\n")
            .await
            .unwrap();
        let mut resp = Vec::new();
        let _ = client.read_to_end(&mut resp).await;
        server.await.unwrap();

        assert!(resp.starts_with(b"HTTP/1.1 403 Forbidden"));
        assert!(resp.ends_with(b"Blocked by Proxy"));
    }

    #[tokio::test]
    async fn connect_to_blocked_host_yields_403_and_no_upstream_dial() {
        let blacklist = Arc::new(Blacklist::new(vec![
            Regex::new("(?i)ads\\.example\\.com").unwrap()
        ]));
        let h = Handler::new(Arc::new(Cache::new(10)), blacklist, test_sink());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            h.handle(stream, peer).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"CONNECT ads.example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut resp = Vec::new();
        let _ = client.read_to_end(&mut resp).await;
        server.await.unwrap();

        assert!(resp.starts_with(b"HTTP/1.1 403 Forbidden"));
        assert!(resp.ends_with(b"Blocked by Proxy"));
    }

    #[tokio::test]
    async fn cache_miss_then_hit_avoids_second_upstream_dial() {
        let cache = Arc::new(Cache::new(10));
        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let upstream_addr = spawn_echo_upstream(response).await;

        let host_header = format!("127.0.0.1:{}", upstream_addr.port());

        for _ in 0..2 {
            let h = Handler::new(
                Arc::clone(&cache),
                Arc::new(Blacklist::empty()),
                test_sink(),
            );
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let server = tokio::spawn(async move {
                let (stream, peer) = listener.accept().await.unwrap();
                h.handle(stream, peer).await;
            });

            let mut client = TcpStream::connect(addr).await.unwrap();
            let request = format!("GET /a HTTP/1.1\r\nHost: {host_header}\r\n\r\n");
            client.write_all(request.as_bytes()).await.unwrap();
            let mut resp = Vec::new();
            let _ = client.read_to_end(&mut resp).await;
            server.await.unwrap();

            assert!(resp.ends_with(b"hello"));
        }

        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn connect_tunnel_relays_bytes_unmodified_both_directions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = listener.local_addr().unwrap();
        let upstream_task = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
            let n = sock.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"ping");
            sock.write_all(b"pong").await.unwrap();
        });

        let h = handler();
        let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy_listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, peer) = proxy_listener.accept().await.unwrap();
            h.handle(stream, peer).await;
        });

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let connect_req = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", upstream_addr.port());
        client.write_all(connect_req.as_bytes()).await.unwrap();

        let mut established = vec![0u8; RESPONSE_200_CONNECT.len()];
        client.read_exact(&mut established).await.unwrap();
        assert_eq!(established, RESPONSE_200_CONNECT);

        client.write_all(b"ping").await.unwrap();
        let mut reply = vec![0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");

        drop(client);
        upstream_task.await.unwrap();
        server.await.unwrap();
    }
}

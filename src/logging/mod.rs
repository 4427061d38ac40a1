//! The structured event sink (C2): a full event log plus a filtered,
//! ring-buffered log the dashboard tails.
//!
//! Callers never touch the file handles directly: they push onto an
//! unbounded channel and a single background task owns the files,
//! serializing every write.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use once_cell::sync::Lazy;
use regex::RegexSet;
use tokio::fs::{create_dir_all, metadata, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::event::Event;

const DASH_LOG_CAPACITY: usize = 15;

/// Patterns a message must match at least one of to be mirrored into the
/// filtered dashboard log.
static DASHBOARD_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"New connection from",
        r"\[Blocked\]",
        r"\[Cache HIT\]",
        r"\[Cache MISS\]",
        r"\[Blocked HTTPS\]",
        r"Connection error in HTTPS tunnel",
        r"\[!\] Error handling client",
    ])
    .expect("dashboard filter patterns must compile")
});

/// Handle passed around the proxy; cheap to clone, emits never block on I/O.
#[derive(Clone)]
pub struct EventSink {
    sender: UnboundedSender<Event>,
}

impl EventSink {
    pub fn emit(&self, event: Event) {
        // The receiver only goes away once the background task has already
        // been told to shut down; a dropped event at that point is fine.
        let _ = self.sender.send(event);
    }
}

/// Spawns the background writer task and returns a sink handle plus its
/// `JoinHandle`.
pub fn spawn(
    full_log_path: impl Into<PathBuf>,
    dash_log_path: impl Into<PathBuf>,
    mut shutdown: watch::Receiver<bool>,
) -> (EventSink, JoinHandle<()>) {
    let (sender, receiver) = unbounded_channel::<Event>();
    let full_log_path = full_log_path.into();
    let dash_log_path = dash_log_path.into();

    let handle = tokio::spawn(async move {
        run(full_log_path, dash_log_path, receiver, &mut shutdown).await;
    });

    (EventSink { sender }, handle)
}

async fn open_append(path: &Path) -> io::Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && metadata(parent).await.is_err() {
            create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new()
        .write(true)
        .append(true)
        .create(true)
        .open(path)
        .await?;
    Ok(BufWriter::new(file))
}

fn format_line(event: &Event) -> String {
    let ts = chrono::DateTime::<Local>::from(event.at).format("%Y-%m-%d %H:%M:%S,%3f");
    format!("{ts} [{}] {}", event.severity, event.message())
}

async fn rewrite_dash_log(path: &Path, lines: &VecDeque<String>) {
    match open_write_truncate(path).await {
        Ok(mut file) => {
            for line in lines {
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    log::error!("failed to write dashboard log: {e}");
                    return;
                }
                let _ = file.write_all(b"\n").await;
            }
            let _ = file.flush().await;
        }
        Err(e) => log::error!("failed to open dashboard log {}: {e}", path.display()),
    }
}

async fn open_write_truncate(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && metadata(parent).await.is_err() {
            create_dir_all(parent).await?;
        }
    }
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await
}

async fn run(
    full_log_path: PathBuf,
    dash_log_path: PathBuf,
    mut receiver: UnboundedReceiver<Event>,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut full_log = match open_append(&full_log_path).await {
        Ok(f) => f,
        Err(e) => {
            log::error!("failed to open event log {}: {e}", full_log_path.display());
            return;
        }
    };
    let mut dash_lines: VecDeque<String> = VecDeque::with_capacity(DASH_LOG_CAPACITY);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            event = receiver.recv() => {
                match event {
                    Some(event) => {
                        let line = format_line(&event);
                        if let Err(e) = full_log.write_all(line.as_bytes()).await {
                            log::error!("failed to write event log: {e}");
                        }
                        let _ = full_log.write_all(b"\n").await;
                        let _ = full_log.flush().await;

                        if DASHBOARD_PATTERNS.is_match(&line) {
                            if dash_lines.len() == DASH_LOG_CAPACITY {
                                dash_lines.pop_front();
                            }
                            dash_lines.push_back(line);
                            rewrite_dash_log(&dash_log_path, &dash_lines).await;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let _ = full_log.flush().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{EventPayload, Severity};
    use std::net::SocketAddr;
    use std::time::Duration;

    fn addr() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[tokio::test]
    async fn full_log_gets_every_event_dash_log_only_matching() {
        let dir = tempfile::tempdir().unwrap();
        let full_path = dir.path().join("proxy.log");
        let dash_path = dir.path().join("proxy_dash.log");
        let (_tx, rx) = watch::channel(false);
        let (sink, handle) = spawn(full_path.clone(), dash_path.clone(), rx);

        sink.emit(Event::new(
            Severity::Info,
            EventPayload::ConnOpen { client: addr() },
        ));
        sink.emit(Event::new(
            Severity::Info,
            EventPayload::UpstreamStatus {
                host: "example.com".into(),
                status_line: "HTTP/1.1 200 OK".into(),
            },
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(sink);
        let _ = handle.await;

        let full = tokio::fs::read_to_string(&full_path).await.unwrap();
        assert!(full.contains("New connection from"));
        assert!(full.contains("Status Code"));

        let dash = tokio::fs::read_to_string(&dash_path).await.unwrap();
        assert!(dash.contains("New connection from"));
        assert!(!dash.contains("Status Code"));
    }

    #[tokio::test]
    async fn dash_log_caps_at_fifteen_lines() {
        let dir = tempfile::tempdir().unwrap();
        let full_path = dir.path().join("proxy.log");
        let dash_path = dir.path().join("proxy_dash.log");
        let (_tx, rx) = watch::channel(false);
        let (sink, handle) = spawn(full_path, dash_path.clone(), rx);

        for _ in 0..20 {
            sink.emit(Event::new(
                Severity::Info,
                EventPayload::ConnOpen { client: addr() },
            ));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(sink);
        let _ = handle.await;

        let dash = tokio::fs::read_to_string(&dash_path).await.unwrap();
        let line_count = dash.lines().count();
        assert_eq!(line_count, DASH_LOG_CAPACITY);
    }
}

//! Cache snapshot persistence: a background task that periodically writes
//! the cache's current contents to disk in a small length-prefixed binary
//! format, and a loader that rebuilds a `Cache` from that file at startup.
//!
//! The format is deliberately not compatible with the original pickle-based
//! snapshot: `u32 key_len | key bytes | u64 body_len | body bytes`, repeated
//! in most-recently-used-first order. Persistence is best-effort: a write or
//! decode failure is logged and otherwise ignored, it never changes proxy
//! behavior.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;

use super::{Cache, CacheEntry};
use std::sync::Arc;

fn encode(entries: &[(String, CacheEntry)]) -> Vec<u8> {
    let mut buf = Vec::new();
    for (key, entry) in entries {
        let key_bytes = key.as_bytes();
        buf.extend_from_slice(&(key_bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(key_bytes);
        buf.extend_from_slice(&(entry.bytes.len() as u64).to_le_bytes());
        buf.extend_from_slice(&entry.bytes);
    }
    buf
}

fn truncated() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "truncated cache snapshot")
}

fn take_u32(data: &mut &[u8]) -> io::Result<u32> {
    let (bytes, rest) = split_at(data, 4)?;
    *data = rest;
    Ok(u32::from_le_bytes(bytes.try_into().map_err(|_| truncated())?))
}

fn take_u64(data: &mut &[u8]) -> io::Result<u64> {
    let (bytes, rest) = split_at(data, 8)?;
    *data = rest;
    Ok(u64::from_le_bytes(bytes.try_into().map_err(|_| truncated())?))
}

fn take_bytes(data: &mut &[u8], len: usize) -> io::Result<Vec<u8>> {
    let (bytes, rest) = split_at(data, len)?;
    *data = rest;
    Ok(bytes.to_vec())
}

fn take_string(data: &mut &[u8], len: usize) -> io::Result<String> {
    let bytes = take_bytes(data, len)?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn split_at(data: &[u8], at: usize) -> io::Result<(&[u8], &[u8])> {
    if data.len() < at {
        return Err(truncated());
    }
    Ok(data.split_at(at))
}

fn decode(mut data: &[u8]) -> io::Result<Vec<(String, CacheEntry)>> {
    let mut out = Vec::new();
    while !data.is_empty() {
        let key_len = take_u32(&mut data)? as usize;
        let key = take_string(&mut data, key_len)?;
        let body_len = take_u64(&mut data)? as usize;
        let body = take_bytes(&mut data, body_len)?;
        out.push((key, CacheEntry::new(body)));
    }
    Ok(out)
}

/// Writes the cache's current contents to `path`. Failures are returned so
/// callers can log them but are never fatal to the proxy.
pub async fn write_snapshot(cache: &Cache, path: impl AsRef<Path>) -> io::Result<()> {
    let entries = cache.snapshot();
    let bytes = encode(&entries);
    let tmp_path = {
        let mut p = path.as_ref().as_os_str().to_owned();
        p.push(".tmp");
        PathBuf::from(p)
    };
    let mut file = fs::File::create(&tmp_path).await?;
    file.write_all(&bytes).await?;
    file.flush().await?;
    fs::rename(&tmp_path, path.as_ref()).await?;
    Ok(())
}

/// Loads a snapshot from `path` and restores it into `cache`. A missing file
/// is treated as "start with an empty cache", not an error; a corrupt file
/// logs and also falls back to an empty cache rather than refusing to start.
pub async fn load_snapshot(cache: &Cache, path: impl AsRef<Path>) {
    let path = path.as_ref();
    let mut file = match fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return,
        Err(e) => {
            log::warn!("failed to open cache snapshot {}: {e}", path.display());
            return;
        }
    };

    let mut data = Vec::new();
    if let Err(e) = file.read_to_end(&mut data).await {
        log::warn!("failed to read cache snapshot {}: {e}", path.display());
        return;
    }

    match decode(&data) {
        Ok(entries) => {
            log::info!(
                "restored {} cache entries from {}",
                entries.len(),
                path.display()
            );
            cache.restore(entries);
        }
        Err(e) => {
            log::warn!(
                "cache snapshot {} is corrupt ({e}), starting with an empty cache",
                path.display()
            );
        }
    }
}

/// Spawns a task that periodically snapshots `cache` to `path` until told to
/// stop via `shutdown`, and writes one final snapshot on the way out.
pub fn spawn_periodic(
    cache: Arc<Cache>,
    path: impl Into<PathBuf>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let path = path.into();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately, skip it
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = write_snapshot(&cache, &path).await {
                        log::warn!("failed to persist cache snapshot {}: {e}", path.display());
                    }
                }
            }
        }
        if let Err(e) = write_snapshot(&cache, &path).await {
            log::warn!(
                "failed to persist final cache snapshot {}: {e}",
                path.display()
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(body: &str) -> CacheEntry {
        CacheEntry::new(body.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.snap");

        let cache = Cache::new(10);
        cache.set("http://a/".to_string(), entry("hello"));
        cache.set("http://b/".to_string(), entry("world"));
        write_snapshot(&cache, &path).await.unwrap();

        let restored = Cache::new(10);
        load_snapshot(&restored, &path).await;
        assert_eq!(restored.get("http://a/").unwrap().bytes.as_ref(), b"hello");
        assert_eq!(restored.get("http://b/").unwrap().bytes.as_ref(), b"world");
    }

    #[tokio::test]
    async fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.snap");
        let cache = Cache::new(10);
        load_snapshot(&cache, &path).await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.snap");
        fs::write(&path, b"not a valid snapshot").await.unwrap();
        let cache = Cache::new(10);
        load_snapshot(&cache, &path).await;
        assert!(cache.is_empty());
    }
}

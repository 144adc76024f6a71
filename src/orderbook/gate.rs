//! Cross-process rebuild gate.
//!
//! Every process that rebuilds a book for an exchange drops a marker file into
//! a shared directory (`<marker_dir>/<exchange>/`). Before fetching, a rebuild
//! counts the recent markers; if too many books on the same exchange are
//! already rebuilding it waits once before going ahead, which keeps a fleet of
//! books from hammering the snapshot endpoint after a shared disconnect.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RebuildConfig;
use crate::types::now_ms;
use crate::Result;

static MARKER_COUNTER: AtomicU64 = AtomicU64::new(0);

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Creation time encoded in a marker name (`<ms>` or `<ms>-<pid>-<n>`)
fn marker_created_ms(name: &str) -> Option<i64> {
    name.split('-').next()?.parse().ok()
}

/// File-marker rate limiter shared by all books of one exchange
#[derive(Debug, Clone)]
pub struct RebuildGate {
    dir: PathBuf,
    max_concurrent: usize,
    active_window: Duration,
    stale_after: Duration,
    busy_delay: Duration,
}

/// Marker held for the duration of a rebuild; removed on drop
#[derive(Debug)]
pub struct RebuildLease {
    path: PathBuf,
}

impl RebuildLease {
    /// Marker file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RebuildLease {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "rebuild marker already gone");
        }
    }
}

impl RebuildGate {
    /// Gate over `dir` with the limits from `config`
    pub fn new(dir: impl Into<PathBuf>, config: &RebuildConfig) -> Self {
        Self {
            dir: dir.into(),
            max_concurrent: config.max_concurrent(),
            active_window: config.active_window(),
            stale_after: config.stale_after(),
            busy_delay: config.busy_delay(),
        }
    }

    /// Count markers created within the active window, deleting stale ones
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Io`] if the directory cannot be created or read.
    pub async fn active_count(&self) -> Result<usize> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let now = now_ms();
        let active_ms = millis(self.active_window);
        let stale_ms = millis(self.stale_after);

        let mut active = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(created) = name.to_str().and_then(marker_created_ms) else {
                continue;
            };
            if created.saturating_add(active_ms) > now {
                active += 1;
            } else if created.saturating_add(stale_ms) < now {
                // a crashed process never removed it
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
        Ok(active)
    }

    /// Wait out a busy exchange once, then register this rebuild
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Io`] if the marker directory or file cannot be
    /// created.
    pub async fn acquire(&self, book: &str) -> Result<RebuildLease> {
        let active = self.active_count().await?;
        if active >= self.max_concurrent {
            warn!(
                book,
                active,
                wait_ms = millis(self.busy_delay),
                "too many concurrent rebuilds, backing off"
            );
            tokio::time::sleep(self.busy_delay).await;
        }

        let name = format!(
            "{}-{}-{}",
            now_ms(),
            std::process::id(),
            MARKER_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let path = self.dir.join(name);
        tokio::fs::File::create(&path).await?;
        debug!(book, path = %path.display(), "rebuild marker created");
        Ok(RebuildLease { path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "book-resync-gate-{}-{}-{}",
            tag,
            std::process::id(),
            MARKER_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn gate(dir: &Path, busy_delay: Duration) -> RebuildGate {
        let config = RebuildConfig::new().with_max_concurrent(3, busy_delay);
        RebuildGate::new(dir, &config)
    }

    #[test]
    fn test_marker_name_parsing() {
        assert_eq!(marker_created_ms("1700000000000"), Some(1_700_000_000_000));
        assert_eq!(marker_created_ms("1700000000000-42-7"), Some(1_700_000_000_000));
        assert_eq!(marker_created_ms("lock"), None);
    }

    #[tokio::test]
    async fn test_lease_removes_marker_on_drop() {
        let dir = scratch_dir("lease");
        let gate = gate(&dir, Duration::from_millis(1));

        let lease = gate.acquire("[BTCUSDT@test]").await.unwrap();
        assert!(lease.path().exists());
        assert_eq!(gate.active_count().await.unwrap(), 1);

        let path = lease.path().to_path_buf();
        drop(lease);
        assert!(!path.exists());
        assert_eq!(gate.active_count().await.unwrap(), 0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_stale_markers_swept() {
        let dir = scratch_dir("stale");
        std::fs::create_dir_all(&dir).unwrap();
        let stale = dir.join("1000");
        let middle_aged = dir.join(format!("{}", now_ms() - 30_000));
        std::fs::write(&stale, b"").unwrap();
        std::fs::write(&middle_aged, b"").unwrap();

        let gate = gate(&dir, Duration::from_millis(1));
        assert_eq!(gate.active_count().await.unwrap(), 0);
        assert!(!stale.exists());
        assert!(middle_aged.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_busy_exchange_waits() {
        let dir = scratch_dir("busy");
        std::fs::create_dir_all(&dir).unwrap();
        for n in 0..3 {
            std::fs::write(dir.join(format!("{}-0-{n}", now_ms())), b"").unwrap();
        }

        let gate = gate(&dir, Duration::from_millis(50));
        let started = tokio::time::Instant::now();
        let lease = gate.acquire("[ETHUSDT@test]").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(lease.path().exists());

        drop(lease);
        let _ = std::fs::remove_dir_all(&dir);
    }
}

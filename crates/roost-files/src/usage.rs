//! Cached disk usage for a jailed directory.

use std::time::{Duration, Instant};

use log::debug;
use tokio::sync::Mutex;

use crate::error::JailResult;
use crate::jail::Jail;

/// Disk usage of a jail root, recomputed at most once per interval.
///
/// Walking a large data directory is expensive, so callers read through this
/// cache. A zero interval disables checking entirely and always reports 0.
#[derive(Debug)]
pub struct DiskUsage {
    jail: Jail,
    interval: Duration,
    cached: Mutex<Option<(Instant, u64)>>,
}

impl DiskUsage {
    pub fn new(jail: Jail, interval: Duration) -> Self {
        Self {
            jail,
            interval,
            cached: Mutex::new(None),
        }
    }

    /// Current usage in bytes.
    ///
    /// Concurrent callers wait on the same computation instead of starting
    /// their own walk.
    pub async fn get(&self) -> JailResult<u64> {
        if self.interval.is_zero() {
            return Ok(0);
        }

        let mut cached = self.cached.lock().await;
        if let Some((at, size)) = *cached
            && at.elapsed() < self.interval
        {
            return Ok(size);
        }

        let size = self.jail.directory_size("").await?;
        debug!(
            "computed disk usage for {}: {} bytes",
            self.jail.root().display(),
            size
        );
        *cached = Some((Instant::now(), size));
        Ok(size)
    }

    /// Drop the cached value so the next read walks the tree again.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

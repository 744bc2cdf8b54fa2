//! Single-flight, short-TTL wrapper around a discovery backend.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

use super::{DiscoveryBackend, Platform};
use crate::device::Device;
use crate::error::Result;

/// How long a scan result is served to other callers.
pub const DEFAULT_TTL: Duration = Duration::from_secs(1);

/// Collapses concurrent and back-to-back scans into one.
///
/// Callers arriving while a scan runs wait for it and share its result.
/// Failed scans are not cached.
pub struct CachedDiscovery {
    inner: Arc<dyn DiscoveryBackend>,
    ttl: Duration,
    last: Mutex<Option<(Instant, Vec<Device>)>>,
}

impl CachedDiscovery {
    pub fn new(inner: Arc<dyn DiscoveryBackend>) -> Self {
        Self::with_ttl(inner, DEFAULT_TTL)
    }

    pub fn with_ttl(inner: Arc<dyn DiscoveryBackend>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            last: Mutex::new(None),
        }
    }

    /// Drops the cached result so the next scan hits the backend.
    pub async fn invalidate(&self) {
        *self.last.lock().await = None;
    }
}

impl fmt::Debug for CachedDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedDiscovery")
            .field("inner", &self.inner)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DiscoveryBackend for CachedDiscovery {
    fn platform(&self) -> Platform {
        self.inner.platform()
    }

    async fn scan(&self) -> Result<Vec<Device>> {
        let mut last = self.last.lock().await;
        if let Some((at, devices)) = last.as_ref()
            && at.elapsed() < self.ttl
        {
            trace!(devices = devices.len(), "serving cached scan");
            return Ok(devices.clone());
        }

        let devices = self.inner.scan().await?;
        *last = Some((Instant::now(), devices.clone()));
        Ok(devices)
    }

    fn parent_disk_name(&self, name: &str) -> Option<String> {
        self.inner.parent_disk_name(name)
    }
}

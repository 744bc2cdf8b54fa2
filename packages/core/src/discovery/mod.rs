//! Removable device discovery.
//!
//! Each host platform has its own [`DiscoveryBackend`]; the daemon only sees
//! the trait. Backends enumerate disks, keep the removable ones, probe their
//! partitions and cross-reference the live mount table.

mod cache;
mod geom;
mod lsblk;
mod mount_table;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::device::Device;
use crate::error::Result;
use crate::executor::ExecutionContext;

pub use cache::{CachedDiscovery, DEFAULT_TTL};
pub use geom::{
    GeomBackend, classify_file_output, parse_dumpe2fs, parse_geom_disk_list,
    parse_glabel_status, parse_gpart_partitions,
};
pub use lsblk::{LsblkBackend, parse_blkid_export, parse_lsblk_json, parse_size};
pub use mount_table::MountTable;

/// Host platform family, which fixes the tool set and naming conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    FreeBsd,
    Linux,
}

impl Platform {
    /// Platform this binary was built for.
    pub const fn current() -> Self {
        if cfg!(target_os = "freebsd") {
            Self::FreeBsd
        } else {
            Self::Linux
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FreeBsd => f.write_str("freebsd"),
            Self::Linux => f.write_str("linux"),
        }
    }
}

/// Enumerates removable disks and partitions.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync + fmt::Debug {
    fn platform(&self) -> Platform;

    /// Returns every removable disk and partition, sorted by path.
    ///
    /// An empty list means "no devices". When every enumeration method
    /// fails the result is [`crate::Error::DiscoveryUnavailable`].
    async fn scan(&self) -> Result<Vec<Device>>;

    /// Returns the parent disk of partition `name` by naming convention.
    fn parent_disk_name(&self, name: &str) -> Option<String>;
}

/// Returns the backend for the host OS.
pub fn default_backend(ctx: ExecutionContext) -> Arc<dyn DiscoveryBackend> {
    match Platform::current() {
        Platform::FreeBsd => Arc::new(GeomBackend::new(ctx)),
        Platform::Linux => Arc::new(LsblkBackend::new(ctx)),
    }
}

/// Sorts by path and drops duplicate paths, keeping the first record seen.
pub(crate) fn finalize(mut devices: Vec<Device>) -> Vec<Device> {
    devices.sort_by(|a, b| a.path.cmp(&b.path));
    devices.dedup_by(|later, earlier| later.path == earlier.path);
    devices
}

/// Splits a trailing run of ASCII digits off `name`.
pub(crate) fn split_trailing_digits(name: &str) -> (&str, &str) {
    let stem_len = name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    name.split_at(stem_len)
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory [`DiscoveryBackend`] double.

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    /// Plays back queued scan results, then repeats the last good list.
    #[derive(Debug, Default)]
    pub struct StaticDiscovery {
        queue: Mutex<VecDeque<Result<Vec<Device>>>>,
        current: Mutex<Vec<Device>>,
        scans: AtomicUsize,
    }

    impl StaticDiscovery {
        pub fn new(devices: Vec<Device>) -> Arc<Self> {
            let discovery = Self::default();
            *discovery.current.lock() = devices;
            Arc::new(discovery)
        }

        /// Queues one scan result.
        pub fn push(&self, result: Result<Vec<Device>>) {
            self.queue.lock().push_back(result);
        }

        /// Replaces the steady-state device list.
        pub fn set(&self, devices: Vec<Device>) {
            *self.current.lock() = devices;
        }

        pub fn scans(&self) -> usize {
            self.scans.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DiscoveryBackend for StaticDiscovery {
        fn platform(&self) -> Platform {
            Platform::FreeBsd
        }

        async fn scan(&self) -> Result<Vec<Device>> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            let queued = self.queue.lock().pop_front();
            match queued {
                Some(Ok(devices)) => {
                    *self.current.lock() = devices.clone();
                    Ok(finalize(devices))
                }
                Some(Err(err)) => Err(err),
                None => Ok(finalize(self.current.lock().clone())),
            }
        }

        fn parent_disk_name(&self, name: &str) -> Option<String> {
            geom::parent_disk(name)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    #[test]
    fn test_finalize_sorts_and_dedups() {
        let dev = Path::new("/dev");
        let devices = finalize(vec![
            Device::new("da1", dev),
            Device::new("da0p1", dev),
            Device {
                size: 7,
                ..Device::new("da1", dev)
            },
            Device::new("da0", dev),
        ]);

        let names: Vec<_> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["da0", "da0p1", "da1"]);
        assert_eq!(devices[2].size, 0);
    }

    #[test]
    fn test_split_trailing_digits() {
        assert_eq!(split_trailing_digits("sdb12"), ("sdb", "12"));
        assert_eq!(split_trailing_digits("sdb"), ("sdb", ""));
    }
}

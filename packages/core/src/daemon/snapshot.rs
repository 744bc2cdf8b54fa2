//! Device set snapshots and diffing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::device::Device;

/// Devices from one scan, keyed by path.
pub type Snapshot = BTreeMap<PathBuf, Device>;

/// Builds a snapshot. A later duplicate path replaces an earlier one.
pub fn snapshot_of(devices: impl IntoIterator<Item = Device>) -> Snapshot {
    devices
        .into_iter()
        .map(|device| (device.path.clone(), device))
        .collect()
}

/// Change between two consecutive snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Added(Device),
    Removed(Device),
}

impl DeviceEvent {
    pub fn device(&self) -> &Device {
        match self {
            Self::Added(device) | Self::Removed(device) => device,
        }
    }

    pub fn path(&self) -> &Path {
        &self.device().path
    }
}

/// Events turning `old` into `new`, in path order.
///
/// Devices present in both are not reported, even if their attributes
/// changed.
pub fn diff(old: &Snapshot, new: &Snapshot) -> Vec<DeviceEvent> {
    let mut events: Vec<DeviceEvent> = new
        .iter()
        .filter(|(path, _)| !old.contains_key(*path))
        .map(|(_, device)| DeviceEvent::Added(device.clone()))
        .chain(
            old.iter()
                .filter(|(path, _)| !new.contains_key(*path))
                .map(|(_, device)| DeviceEvent::Removed(device.clone())),
        )
        .collect();
    events.sort_by(|a, b| a.path().cmp(b.path()));
    events
}

/// Most recent scan, shared between the poll task and readers.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    current: RwLock<Snapshot>,
}

impl SnapshotStore {
    /// Installs `next` and returns the previous snapshot.
    pub fn replace(&self, next: Snapshot) -> Snapshot {
        std::mem::replace(&mut *self.current.write(), next)
    }

    pub fn current(&self) -> Snapshot {
        self.current.read().clone()
    }

    pub fn get(&self, path: &Path) -> Option<Device> {
        self.current.read().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.current.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.read().is_empty()
    }
}

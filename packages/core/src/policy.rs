//! Mount policy lookups.

use std::path::Path;

/// Decides which devices are handled and how they are mounted.
///
/// Label and volume ID are passed as empty strings when the device has
/// none.
pub trait MountPolicy: Send + Sync {
    /// Device is skipped entirely: no hooks, no automount.
    fn should_ignore(&self, label: &str, volume_id: &str, path: &Path) -> bool;

    fn should_automount(&self, label: &str, volume_id: &str, path: &Path) -> bool;

    /// Options passed to the mount tool as `-o a,b,c`, in order.
    fn mount_options(
        &self,
        fstype: &str,
        label: &str,
        volume_id: &str,
        path: &Path,
    ) -> Vec<String>;
}

//! Device record module.
//!
//! A [`Device`] is a snapshot of one discovered disk or partition. Records are
//! rebuilt wholesale on every scan; only the daemon's bookkeeping keeps
//! copies across scans.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Longest sanitized stem kept before the collision suffix.
const MAX_MOUNT_NAME_LEN: usize = 48;

/// Number of UUID characters used when a device has no label.
const UUID_PREFIX_LEN: usize = 8;

/// One discovered disk or partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Device {
    /// Device name (e.g., "da0p1", "sdb1").
    pub name: String,
    /// Full device path; unique within a snapshot (e.g., "/dev/da0p1").
    pub path: PathBuf,
    /// Volume label, if set.
    pub label: Option<String>,
    /// Filesystem UUID.
    pub uuid: Option<String>,
    /// Filesystem type (e.g., "msdosfs", "vfat", "ext4").
    pub fstype: Option<String>,
    /// Size in bytes; 0 when unknown.
    pub size: u64,
    /// Current mount point, if mounted.
    pub mount_point: Option<PathBuf>,
    pub is_mounted: bool,
    pub is_encrypted: bool,
    pub is_unlocked: bool,
    pub is_partition: bool,
    pub is_removable: bool,
    /// Partition number parsed from the name (`da0p2` -> 2).
    pub partition_index: Option<u32>,
}

impl Device {
    /// Creates a record for `name` under the device directory `dev_dir`.
    pub fn new(name: impl Into<String>, dev_dir: &Path) -> Self {
        let name = name.into();
        Self {
            path: dev_dir.join(&name),
            name,
            ..Self::default()
        }
    }

    /// Records a live mount. Keeps `is_mounted` and `mount_point` in step.
    pub fn set_mounted(&mut self, mount_point: impl Into<PathBuf>) {
        self.mount_point = Some(mount_point.into());
        self.is_mounted = true;
    }

    /// Clears mount state.
    pub fn clear_mount(&mut self) {
        self.mount_point = None;
        self.is_mounted = false;
    }

    /// Label as passed to policy lookups; empty when unset.
    pub fn label_str(&self) -> &str {
        self.label.as_deref().unwrap_or("")
    }

    /// Volume ID as passed to policy lookups; empty when unset.
    pub fn volume_id(&self) -> &str {
        self.uuid.as_deref().unwrap_or("")
    }

    /// Filesystem type to hand to the mount tool.
    ///
    /// `None` when unknown or the "auto" sentinel, so `-t` is omitted.
    pub fn mount_fstype(&self) -> Option<&str> {
        self.fstype
            .as_deref()
            .filter(|fs| !fs.is_empty() && *fs != "auto")
    }

    /// Returns a user-friendly display name.
    pub fn display_name(&self) -> String {
        if let Some(label) = self.label.as_ref().filter(|l| !l.is_empty()) {
            return label.clone();
        }
        if let Some(uuid) = self.uuid.as_ref().filter(|u| !u.is_empty()) {
            let prefix: String = uuid.chars().take(UUID_PREFIX_LEN).collect();
            return format!("{}...", prefix);
        }
        self.name.clone()
    }

    /// Returns the directory name used under the mount base.
    ///
    /// Label if present, else a UUID prefix, else the device name, passed
    /// through [`sanitize_mount_name`].
    pub fn mount_dir_name(&self) -> String {
        if let Some(label) = self.label.as_ref().filter(|l| !l.is_empty()) {
            return sanitize_mount_name(label);
        }
        if let Some(uuid) = self.uuid.as_ref().filter(|u| !u.is_empty()) {
            let prefix: String = uuid.chars().take(UUID_PREFIX_LEN).collect();
            return sanitize_mount_name(&prefix);
        }
        sanitize_mount_name(&self.name)
    }

    /// Returns true if `target` names this device by path, name, `/dev/<name>`
    /// or current mount point.
    pub fn matches_target(&self, target: &str) -> bool {
        let target_path = Path::new(target);
        self.path == target_path
            || self.name == target
            || Path::new("/dev").join(&self.name) == target_path
            || self.mount_point.as_deref() == Some(target_path)
    }
}

/// Sanitize a string for use as a mount point directory name.
///
/// Every character outside `[A-Za-z0-9_-]` becomes `_`, a leading `-` is
/// replaced so the name cannot be read as a tool option, and overlong names
/// are truncated. Whenever the result differs from the input, the first 8
/// hex digits of the input's SHA-256 are appended so that distinct labels
/// such as `My Games` and `My/Games` map to distinct directories.
pub fn sanitize_mount_name(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_MOUNT_NAME_LEN)
        .collect();

    if sanitized.starts_with('-') {
        sanitized.replace_range(..1, "_");
    }

    if sanitized.is_empty() {
        sanitized.push_str("device");
    }

    if sanitized != name {
        let digest = Sha256::digest(name.as_bytes());
        sanitized.push('-');
        sanitized.push_str(&hex::encode(&digest[..4]));
    }

    sanitized
}

/// Returns true if `path` is exactly one normal component below `base`.
pub fn is_direct_child(base: &Path, path: &Path) -> bool {
    match path.strip_prefix(base) {
        Ok(rest) => {
            let mut components = rest.components();
            matches!(
                (components.next(), components.next()),
                (Some(Component::Normal(_)), None)
            )
        }
        Err(_) => false,
    }
}

/// Formats a byte count for display (base 1024).
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    match bytes {
        b if b >= TB => format!("{:.2} TB", b as f64 / TB as f64),
        b if b >= GB => format!("{:.2} GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.2} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.2} KB", b as f64 / KB as f64),
        b => format!("{} B", b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition(label: Option<&str>, uuid: Option<&str>) -> Device {
        Device {
            label: label.map(str::to_string),
            uuid: uuid.map(str::to_string),
            is_partition: true,
            is_removable: true,
            ..Device::new("da0p1", Path::new("/dev"))
        }
    }

    #[test]
    fn test_display_name_fallbacks() {
        assert_eq!(partition(Some("USBSTICK"), None).display_name(), "USBSTICK");
        assert_eq!(
            partition(None, Some("12345678-abcd-efgh")).display_name(),
            "12345678..."
        );
        assert_eq!(partition(Some(""), None).display_name(), "da0p1");
    }

    #[test]
    fn test_mount_dir_name_prefers_label_then_uuid() {
        assert_eq!(partition(Some("Backup_2024"), None).mount_dir_name(), "Backup_2024");
        assert_eq!(
            partition(None, Some("12345678-abcd-efgh")).mount_dir_name(),
            "12345678"
        );
        assert_eq!(partition(None, None).mount_dir_name(), "da0p1");
    }

    #[test]
    fn test_sanitize_keeps_safe_names_verbatim() {
        assert_eq!(sanitize_mount_name("Test-Drive_123"), "Test-Drive_123");
    }

    #[test]
    fn test_sanitize_hostile_labels_stay_inside_base() {
        let base = Path::new("/media");
        let hostile = [
            "My Games",
            "Game/Data",
            "..",
            "../../etc",
            ".hidden",
            "-rf",
            "$(reboot)",
            "a;b|c&d`e`",
            "label\nwith\tcontrols",
            "Ürlaub",
            "",
        ];

        for label in hostile {
            let name = sanitize_mount_name(label);
            assert!(!name.is_empty(), "{label:?}");
            assert!(
                name.chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
                "{label:?} -> {name:?}"
            );
            assert!(!name.starts_with('-'), "{label:?} -> {name:?}");
            assert!(!name.starts_with('.'), "{label:?} -> {name:?}");
            assert!(is_direct_child(base, &base.join(&name)), "{label:?}");
        }
    }

    #[test]
    fn test_sanitize_distinguishes_labels_that_collapse_alike() {
        let a = sanitize_mount_name("My Games");
        let b = sanitize_mount_name("My/Games");
        let c = sanitize_mount_name("My_Games");
        assert!(a.starts_with("My_Games-"));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(c, "My_Games");
    }

    #[test]
    fn test_sanitize_truncates_long_labels() {
        let long = "x".repeat(200);
        let name = sanitize_mount_name(&long);
        assert_eq!(name.len(), MAX_MOUNT_NAME_LEN + 9);
    }

    #[test]
    fn test_is_direct_child() {
        let base = Path::new("/media");
        assert!(is_direct_child(base, Path::new("/media/USB")));
        assert!(!is_direct_child(base, Path::new("/media")));
        assert!(!is_direct_child(base, Path::new("/media/a/b")));
        assert!(!is_direct_child(base, Path::new("/media/../etc")));
        assert!(!is_direct_child(base, Path::new("/mnt/USB")));
    }

    #[test]
    fn test_matches_target() {
        let mut device = partition(Some("USB"), None);
        device.set_mounted("/media/USB");
        assert!(device.matches_target("/dev/da0p1"));
        assert!(device.matches_target("da0p1"));
        assert!(device.matches_target("/media/USB"));
        assert!(!device.matches_target("da0p10"));
    }

    #[test]
    fn test_mount_state_helpers_keep_invariant() {
        let mut device = partition(None, None);
        device.set_mounted("/media/da0p1");
        assert!(device.is_mounted);
        device.clear_mount();
        assert!(!device.is_mounted);
        assert!(device.mount_point.is_none());
    }

    #[test]
    fn test_mount_fstype_skips_auto() {
        let mut device = partition(None, None);
        assert_eq!(device.mount_fstype(), None);
        device.fstype = Some("auto".to_string());
        assert_eq!(device.mount_fstype(), None);
        device.fstype = Some("msdosfs".to_string());
        assert_eq!(device.mount_fstype(), Some("msdosfs"));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(8_000_000_000), "7.45 GB");
        assert_eq!(format_size(1536), "1.50 KB");
    }
}

//! YAML configuration.
//!
//! Every field has a default, so an empty or partial file is valid and a
//! missing file yields [`Config::default`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt};

use crate::error::{
    ConfigDirNotFoundSnafu, ConfigParseSnafu, ConfigSerializeSnafu, IoResultExt, Result,
};
use crate::executor::PrivilegeEscalation;
use crate::policy::MountPolicy;

/// Directory name under the per-user config directory.
pub const CONFIG_DIR_NAME: &str = "automount";

/// Config file name.
pub const CONFIG_FILE_NAME: &str = "config.yml";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub automount: bool,
    pub verbose: bool,
    pub quiet: bool,
    /// Directory under which mount points are created.
    pub mount_base: PathBuf,
    /// Program opened on a fresh mount point; empty disables it.
    pub file_manager: String,
    pub poll_interval_secs: u64,
    pub notifications: NotificationConfig,
    #[serde(rename = "device_config")]
    pub devices: Vec<DeviceRule>,
    /// Event name (e.g., `device_mounted`) to command template.
    pub event_hooks: BTreeMap<String, String>,
    pub mount_options: MountOptionsConfig,
    #[serde(alias = "geli")]
    pub encryption: EncryptionConfig,
    pub privilege: PrivilegeEscalation,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            automount: true,
            verbose: false,
            quiet: false,
            mount_base: PathBuf::from("/media"),
            file_manager: "xdg-open".to_string(),
            poll_interval_secs: 2,
            notifications: NotificationConfig::default(),
            devices: Vec::new(),
            event_hooks: BTreeMap::new(),
            mount_options: MountOptionsConfig::default(),
            encryption: EncryptionConfig::default(),
            privilege: PrivilegeEscalation::None,
        }
    }
}

/// Lifecycle events that can raise a desktop notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationEvent {
    DeviceAdded,
    DeviceRemoved,
    DeviceMounted,
    DeviceUnmounted,
    DeviceUnlocked,
    JobFailed,
}

/// Notification settings. Per-event values are seconds; `0` falls back to
/// `timeout` and a negative value disables the event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub timeout: f64,
    pub device_mounted: f64,
    pub device_unmounted: f64,
    pub device_added: f64,
    pub device_removed: f64,
    pub device_unlocked: f64,
    pub job_failed: f64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: 1.5,
            device_mounted: 5.0,
            device_unmounted: -1.0,
            device_added: -1.0,
            device_removed: -1.0,
            device_unlocked: -1.0,
            job_failed: -1.0,
        }
    }
}

impl NotificationConfig {
    /// Display timeout for `event`, or `None` if it should not be shown.
    pub fn timeout_for(&self, event: NotificationEvent) -> Option<Duration> {
        if !self.enabled {
            return None;
        }

        let secs = match event {
            NotificationEvent::DeviceAdded => self.device_added,
            NotificationEvent::DeviceRemoved => self.device_removed,
            NotificationEvent::DeviceMounted => self.device_mounted,
            NotificationEvent::DeviceUnmounted => self.device_unmounted,
            NotificationEvent::DeviceUnlocked => self.device_unlocked,
            NotificationEvent::JobFailed => self.job_failed,
        };

        let secs = if secs == 0.0 { self.timeout } else { secs };
        (secs.is_finite() && secs > 0.0).then(|| Duration::from_secs_f64(secs))
    }
}

/// Per-device override, matched by label, UUID or device path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_path: Option<PathBuf>,
    pub ignore: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automount: Option<bool>,
    pub options: Vec<String>,
}

impl DeviceRule {
    fn matches(&self, label: &str, volume_id: &str, path: &Path) -> bool {
        let eq = |expected: &Option<String>, actual: &str| {
            expected
                .as_deref()
                .is_some_and(|e| !e.is_empty() && e == actual)
        };

        eq(&self.id_label, label)
            || eq(&self.id_uuid, volume_id)
            || self
                .device_path
                .as_deref()
                .is_some_and(|p| !p.as_os_str().is_empty() && p == path)
    }
}

/// Default mount options per filesystem type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptionsConfig {
    pub default: BTreeMap<String, Vec<String>>,
}

impl Default for MountOptionsConfig {
    fn default() -> Self {
        let locale = || "locale=en_US.UTF-8".to_string();
        let longnames = || "longnames".to_string();

        let mut default = BTreeMap::new();
        default.insert("vfat".to_string(), vec![locale(), longnames()]);
        default.insert("msdos".to_string(), vec![locale(), longnames()]);
        default.insert("msdosfs".to_string(), vec![locale(), longnames()]);
        default.insert("ntfs".to_string(), vec![locale()]);
        for fstype in ["ext2", "ext3", "ext4", "ufs", "zfs"] {
            default.insert(fstype.to_string(), Vec::new());
        }
        Self { default }
    }
}

/// Encrypted volume settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub enabled: bool,
    /// Shell command whose stdout is the passphrase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_cmd: Option<String>,
    /// Volume ID to keyfile path.
    pub keyfiles: BTreeMap<String, PathBuf>,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            password_cmd: None,
            keyfiles: BTreeMap::new(),
        }
    }
}

impl EncryptionConfig {
    /// Keyfile registered for `volume_id`.
    pub fn keyfile_for(&self, volume_id: &str) -> Option<&Path> {
        if volume_id.is_empty() {
            return None;
        }
        self.keyfiles.get(volume_id).map(PathBuf::as_path)
    }
}

impl Config {
    /// Reads and parses `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).config_read_context(path)?;
        Self::from_yaml(&content, path)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_yaml(&content, path),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err).config_read_context(path),
        }
    }

    fn from_yaml(content: &str, path: &Path) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).context(ConfigParseSnafu { path })
    }

    /// `<config_dir>/automount/config.yml`.
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().context(ConfigDirNotFoundSnafu)?;
        Ok(dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Writes the configuration as YAML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context(ConfigSerializeSnafu)?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).config_write_context(parent)?;
        }
        std::fs::write(path, yaml).config_write_context(path)
    }

    /// Interval between discovery ticks, never below one second.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// First rule matching the device, in rule order.
    pub fn device_rule(&self, label: &str, volume_id: &str, path: &Path) -> Option<&DeviceRule> {
        self.devices
            .iter()
            .find(|rule| rule.matches(label, volume_id, path))
    }
}

impl MountPolicy for Config {
    fn should_ignore(&self, label: &str, volume_id: &str, path: &Path) -> bool {
        self.device_rule(label, volume_id, path)
            .is_some_and(|rule| rule.ignore)
    }

    fn should_automount(&self, label: &str, volume_id: &str, path: &Path) -> bool {
        self.device_rule(label, volume_id, path)
            .and_then(|rule| rule.automount)
            .unwrap_or(self.automount)
    }

    fn mount_options(
        &self,
        fstype: &str,
        label: &str,
        volume_id: &str,
        path: &Path,
    ) -> Vec<String> {
        if let Some(rule) = self.device_rule(label, volume_id, path)
            && !rule.options.is_empty()
        {
            return rule.options.clone();
        }

        self.mount_options
            .default
            .get(fstype)
            .cloned()
            .unwrap_or_default()
    }
}

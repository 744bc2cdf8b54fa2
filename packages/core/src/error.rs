//! Unified error types for the automount-core library.
//!
//! Uses SNAFU for context-rich error handling, especially useful when the same
//! underlying error type (like `std::io::Error`) appears in different contexts.

use snafu::{ResultExt, Snafu};
use std::path::PathBuf;

/// Result type alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all core library operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Failed to spawn a system command.
    #[snafu(display("failed to execute command '{command}'"))]
    CommandExecution {
        command: String,
        source: std::io::Error,
    },

    /// Command executed but returned non-zero exit code.
    #[snafu(display("command '{command}' exited with code {code}: {output}"))]
    CommandExit {
        command: String,
        code: i32,
        output: String,
    },

    /// User cancelled the privilege escalation dialog.
    #[snafu(display("authentication cancelled by user"))]
    AuthenticationCancelled,

    /// A single discovery method could not be used.
    #[snafu(display("device discovery via {method} failed: {message}"))]
    Discovery { method: String, message: String },

    /// Every discovery method failed; the result is not "no devices".
    #[snafu(display("no device discovery method succeeded: {}", failures.join("; ")))]
    DiscoveryUnavailable { failures: Vec<String> },

    /// Failed to decode structured block device listing.
    #[snafu(display("failed to parse lsblk output"))]
    LsblkParse { source: serde_json::Error },

    /// Neither the mount table file nor the mount command were usable.
    #[snafu(display("failed to read mount table: {message}"))]
    MountTable { message: String },

    /// No device matched the requested target.
    #[snafu(display("device not found: {target}"))]
    DeviceNotFound { target: String },

    /// Device is already mounted.
    #[snafu(display("{} is already mounted at {}", path.display(), mount_point.display()))]
    AlreadyMounted { path: PathBuf, mount_point: PathBuf },

    /// Device is not tracked as mounted.
    #[snafu(display("{} is not mounted", path.display()))]
    NotMounted { path: PathBuf },

    /// Mount point creation failed.
    #[snafu(display("failed to create mount point at {}", path.display()))]
    MountPointCreation {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Mount point exists and already holds files.
    #[snafu(display("mount point {} exists and is not empty", path.display()))]
    MountPointBusy { path: PathBuf },

    /// Computed mount point does not sit directly inside the mount base.
    #[snafu(display("mount point {} escapes base directory {}", path.display(), base.display()))]
    MountPointEscape { path: PathBuf, base: PathBuf },

    /// Mount tool failed.
    #[snafu(display("failed to mount {}: {output}", device.display()))]
    Mount { device: PathBuf, output: String },

    /// Unmount tool failed.
    #[snafu(display("failed to unmount {}: {output}", path.display()))]
    Unmount { path: PathBuf, output: String },

    /// Unlock tool failed (bad passphrase, unusable key).
    #[snafu(display("failed to unlock {}: {output}", device.display()))]
    Unlock { device: PathBuf, output: String },

    /// Encryption support is disabled in the configuration.
    #[snafu(display("encrypted volume support is disabled"))]
    EncryptionDisabled,

    /// A keyfile is configured for the volume but cannot be found.
    #[snafu(display("keyfile {} for volume {volume_id} not found", path.display()))]
    KeyfileMissing { volume_id: String, path: PathBuf },

    /// No passphrase could be obtained.
    #[snafu(display("could not obtain passphrase: {message}"))]
    PassphraseUnavailable { message: String },

    /// Detaching the parent disk failed.
    #[snafu(display("failed to detach {disk}: {output}"))]
    Detach { disk: String, output: String },

    /// Event hook template cannot be tokenized.
    #[snafu(display("invalid hook template for {event}: {message}"))]
    HookTemplate { event: String, message: String },

    /// Notification tool is not installed.
    #[snafu(display("notification tool '{program}' not found in PATH"))]
    NotifierUnavailable { program: String },

    /// Config file cannot be read.
    #[snafu(display("failed to read config at {}", path.display()))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Config file cannot be written.
    #[snafu(display("failed to write config at {}", path.display()))]
    ConfigWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Config file is not valid YAML for the schema.
    #[snafu(display("failed to parse config at {}", path.display()))]
    ConfigParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    /// Config cannot be serialized.
    #[snafu(display("failed to serialize config"))]
    ConfigSerialize { source: serde_yaml::Error },

    /// Per-user config directory not found.
    #[snafu(display("could not determine config directory"))]
    ConfigDirNotFound,

    #[snafu(whatever, display("{message}"))]
    Generic {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error + Send + Sync>, Some)))]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Extension trait for adding context to io::Error results.
pub trait IoResultExt<T> {
    /// Add context for command execution errors.
    fn command_context(self, command: impl Into<String>) -> Result<T>;

    /// Add context for mount point creation errors.
    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for config read errors.
    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for config write errors.
    fn config_write_context(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn command_context(self, command: impl Into<String>) -> Result<T> {
        self.context(CommandExecutionSnafu {
            command: command.into(),
        })
    }

    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(MountPointCreationSnafu { path: path.into() })
    }

    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(ConfigReadSnafu { path: path.into() })
    }

    fn config_write_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(ConfigWriteSnafu { path: path.into() })
    }
}

/// Outcome of a "mount all" / "unmount all" batch.
///
/// Every device is attempted independently; failures are collected instead
/// of aborting the batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Number of devices that reached the target state.
    pub succeeded: usize,
    /// Per-device failures, in the order they were attempted.
    pub failures: Vec<(PathBuf, Error)>,
}

impl BatchReport {
    /// Records one successful device.
    pub fn record_success(&mut self) {
        self.succeeded += 1;
    }

    /// Records one failed device.
    pub fn record_failure(&mut self, path: impl Into<PathBuf>, error: Error) {
        self.failures.push((path.into(), error));
    }

    /// Returns true when no device failed.
    pub fn is_complete_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Total number of devices attempted.
    pub fn attempted(&self) -> usize {
        self.succeeded + self.failures.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_report_counts() {
        let mut report = BatchReport::default();
        report.record_success();
        report.record_failure(
            "/dev/da1p1",
            Error::Mount {
                device: PathBuf::from("/dev/da1p1"),
                output: "bad superblock".to_string(),
            },
        );
        report.record_success();

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.attempted(), 3);
        assert!(!report.is_complete_success());
    }

    #[test]
    fn test_discovery_unavailable_lists_every_method() {
        let err = Error::DiscoveryUnavailable {
            failures: vec!["geom: not found".to_string(), "/dev: denied".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "no device discovery method succeeded: geom: not found; /dev: denied"
        );
    }
}

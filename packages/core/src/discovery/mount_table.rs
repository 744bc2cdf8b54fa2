//! Live mount table lookup.
//!
//! Two textual forms resolve to the same `(device, mount point)` pairs:
//! the fstab-style table file (`/etc/mtab`, `/proc/mounts`) and the output of
//! the bare `mount` command (`<device> on <mount point> (<options>)`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::executor::ExecutionContext;

/// Snapshot of the live mount table, keyed by device path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountTable {
    entries: HashMap<PathBuf, PathBuf>,
}

impl MountTable {
    /// Parses `device mountpoint fstype options ...` lines.
    ///
    /// Mount points use the kernel's octal escapes (`\040` for space).
    pub fn parse_table(content: &str) -> Self {
        let mut entries = HashMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.split_whitespace();
            if let (Some(device), Some(mount_point)) = (fields.next(), fields.next()) {
                entries
                    .entry(PathBuf::from(unescape_octal(device)))
                    .or_insert_with(|| PathBuf::from(unescape_octal(mount_point)));
            }
        }
        Self { entries }
    }

    /// Parses `mount` command output.
    ///
    /// Handles both `/dev/da0p1 on /media/USB (msdosfs, local)` and the
    /// Linux form `/dev/sdb1 on /media/USB type vfat (rw,nosuid)`.
    pub fn parse_mount_output(output: &str) -> Self {
        let mut entries = HashMap::new();
        for line in output.lines() {
            let Some((device, rest)) = line.split_once(" on ") else {
                continue;
            };

            let mut mount_point = rest.trim_end();
            if mount_point.ends_with(')')
                && let Some(idx) = mount_point.rfind(" (")
            {
                mount_point = &mount_point[..idx];
            }
            if let Some(idx) = mount_point.rfind(" type ") {
                mount_point = &mount_point[..idx];
            }

            let device = device.trim();
            let mount_point = mount_point.trim();
            if device.is_empty() || mount_point.is_empty() {
                continue;
            }

            entries
                .entry(PathBuf::from(device))
                .or_insert_with(|| PathBuf::from(mount_point));
        }
        Self { entries }
    }

    /// Returns where `device` is mounted, if anywhere.
    pub fn mount_point_of(&self, device: &Path) -> Option<&Path> {
        self.entries.get(device).map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Loads the table from `table_file`, falling back to the `mount`
    /// command when the file cannot be read.
    pub async fn load(ctx: &ExecutionContext, table_file: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(table_file).await {
            Ok(content) => return Ok(Self::parse_table(&content)),
            Err(err) => {
                debug!(
                    file = %table_file.display(),
                    error = %err,
                    "mount table file unreadable, falling back to mount command"
                );
            }
        }

        let output = ctx
            .run_checked::<&str>("mount", &[])
            .await
            .map_err(|err| Error::MountTable {
                message: format!("{}: {}", table_file.display(), err),
            })?;
        Ok(Self::parse_mount_output(&output.stdout))
    }
}

/// Decodes `\NNN` octal escapes.
fn unescape_octal(input: &str) -> String {
    if !input.contains('\\') {
        return input.to_string();
    }

    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..=i + 3].iter().all(|b| (b'0'..=b'7').contains(b))
            && let Ok(byte) = u8::from_str_radix(&input[i + 1..=i + 3], 8)
        {
            decoded.push(byte);
            i += 4;
            continue;
        }
        decoded.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

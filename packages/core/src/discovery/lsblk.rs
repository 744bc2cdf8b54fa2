//! Linux discovery through `lsblk`, with a sysfs fallback.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use snafu::ResultExt;
use tracing::{debug, warn};

use super::mount_table::MountTable;
use super::{DiscoveryBackend, Platform, finalize, split_trailing_digits};
use crate::device::Device;
use crate::error::{Error, LsblkParseSnafu, Result};
use crate::executor::ExecutionContext;
use crate::unlock::UnlockTool;

const LSBLK_COLUMNS: &str = "NAME,SIZE,TYPE,MOUNTPOINT,FSTYPE,LABEL,UUID,RM,HOTPLUG";
const SECTOR_SIZE: u64 = 512;
const LUKS_FSTYPE: &str = "crypto_LUKS";

/// Raw JSON structure from lsblk output.
#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkEntry>,
}

#[derive(Debug, Deserialize)]
struct LsblkEntry {
    name: String,
    #[serde(default)]
    size: Option<SizeField>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    mountpoint: Option<String>,
    /// util-linux >= 2.37 reports every mount point of a device.
    #[serde(default)]
    mountpoints: Option<Vec<Option<String>>>,
    #[serde(default)]
    fstype: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    rm: Option<Flag>,
    #[serde(default)]
    hotplug: Option<Flag>,
    #[serde(default)]
    children: Option<Vec<LsblkEntry>>,
}

/// Boolean columns differ between util-linux releases: `true`, `1` or `"1"`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Int(u64),
    Text(String),
}

impl Flag {
    fn is_set(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Int(n) => *n != 0,
            Self::Text(s) => matches!(s.trim(), "1" | "true"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SizeField {
    Bytes(u64),
    Text(String),
}

impl SizeField {
    fn bytes(&self) -> u64 {
        match self {
            Self::Bytes(n) => *n,
            Self::Text(s) => parse_size(s).unwrap_or(0),
        }
    }
}

impl LsblkEntry {
    fn is_flagged(&self) -> bool {
        self.rm.as_ref().is_some_and(Flag::is_set)
            || self.hotplug.as_ref().is_some_and(Flag::is_set)
    }

    fn mount_point(&self) -> Option<&str> {
        non_empty(self.mountpoint.as_deref()).or_else(|| {
            self.mountpoints
                .iter()
                .flatten()
                .find_map(|mp| non_empty(mp.as_deref()))
        })
    }

    fn children(&self) -> &[LsblkEntry] {
        self.children.as_deref().unwrap_or_default()
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

fn owned(value: Option<&str>) -> Option<String> {
    non_empty(value).map(str::to_string)
}

/// Parses `lsblk -J` output into removable disk and partition records.
///
/// Removability is inherited by children. A `crypt` child marks its parent
/// unlocked and lends it its mount point.
pub fn parse_lsblk_json(output: &str, dev_dir: &Path) -> Result<Vec<Device>> {
    let parsed: LsblkOutput = serde_json::from_str(output).context(LsblkParseSnafu)?;
    let mut devices = Vec::new();
    collect_devices(&parsed.blockdevices, false, dev_dir, &mut devices);
    Ok(devices)
}

fn collect_devices(
    entries: &[LsblkEntry],
    inherited_removable: bool,
    dev_dir: &Path,
    devices: &mut Vec<Device>,
) {
    for entry in entries {
        let kind = entry.kind.as_deref().unwrap_or_default();
        if kind != "disk" && kind != "part" {
            continue;
        }

        let removable = inherited_removable || entry.is_flagged();
        if removable {
            devices.push(to_device(entry, kind == "part", dev_dir));
        }

        collect_devices(entry.children(), removable, dev_dir, devices);
    }
}

fn to_device(entry: &LsblkEntry, is_partition: bool, dev_dir: &Path) -> Device {
    let mut device = Device {
        label: owned(entry.label.as_deref()),
        uuid: owned(entry.uuid.as_deref()),
        fstype: owned(entry.fstype.as_deref()),
        size: entry.size.as_ref().map_or(0, SizeField::bytes),
        is_partition,
        is_removable: true,
        ..Device::new(&entry.name, dev_dir)
    };
    device.is_encrypted = device.fstype.as_deref() == Some(LUKS_FSTYPE);
    if is_partition {
        device.partition_index = partition_index(&device.name);
    }

    if let Some(mount_point) = entry.mount_point() {
        device.set_mounted(mount_point);
    }

    if let Some(mapping) = entry
        .children()
        .iter()
        .find(|child| child.kind.as_deref() == Some("crypt"))
    {
        device.is_encrypted = true;
        device.is_unlocked = true;
        if let Some(mount_point) = mapping.mount_point() {
            device.set_mounted(mount_point);
        }
    }

    device
}

/// Parses lsblk size strings: plain bytes or `8G`, `1.5M` (base 1024).
pub fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(bytes) = value.parse::<u64>() {
        return Some(bytes);
    }

    let unit = value.chars().last()?;
    let number = &value[..value.len() - unit.len_utf8()];
    let multiplier: u64 = match unit.to_ascii_uppercase() {
        'B' => 1,
        'K' => 1 << 10,
        'M' => 1 << 20,
        'G' => 1 << 30,
        'T' => 1 << 40,
        _ => return None,
    };
    let number: f64 = number.trim().parse().ok()?;
    (number >= 0.0).then(|| (number * multiplier as f64) as u64)
}

/// Extracts `(TYPE, LABEL, UUID)` from `blkid -o export`.
pub fn parse_blkid_export(output: &str) -> (Option<String>, Option<String>, Option<String>) {
    let mut fstype = None;
    let mut label = None;
    let mut uuid = None;

    for line in output.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let value = owned(Some(value));
        match key {
            "TYPE" => fstype = value,
            "LABEL" => label = value,
            "UUID" => uuid = value,
            _ => {}
        }
    }

    (fstype, label, uuid)
}

/// `sdb1` -> 1, `nvme0n1p2` -> 2.
fn partition_index(name: &str) -> Option<u32> {
    split_trailing_digits(name).1.parse().ok()
}

/// Discovery backend for Linux.
#[derive(Debug, Clone)]
pub struct LsblkBackend {
    ctx: ExecutionContext,
    dev_dir: PathBuf,
    sys_block: PathBuf,
    mount_table: PathBuf,
}

impl LsblkBackend {
    pub fn new(ctx: ExecutionContext) -> Self {
        Self {
            ctx,
            dev_dir: PathBuf::from("/dev"),
            sys_block: PathBuf::from("/sys/block"),
            mount_table: PathBuf::from("/proc/mounts"),
        }
    }

    /// Uses alternative sysfs and mount table locations.
    pub fn with_paths(
        ctx: ExecutionContext,
        dev_dir: impl Into<PathBuf>,
        sys_block: impl Into<PathBuf>,
        mount_table: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ctx,
            dev_dir: dev_dir.into(),
            sys_block: sys_block.into(),
            mount_table: mount_table.into(),
        }
    }

    async fn scan_lsblk(&self) -> Result<Vec<Device>> {
        let output = self
            .ctx
            .run_checked("lsblk", &["-J", "-b", "-o", LSBLK_COLUMNS])
            .await?;
        parse_lsblk_json(&output.stdout, &self.dev_dir)
    }

    /// Lower-fidelity scan of `/sys/block` plus `blkid`.
    async fn scan_sysfs(&self) -> Result<Vec<Device>> {
        let sysfs_error = |err: std::io::Error| Error::Discovery {
            method: self.sys_block.display().to_string(),
            message: err.to_string(),
        };
        let mut entries = tokio::fs::read_dir(&self.sys_block)
            .await
            .map_err(sysfs_error)?;

        let mut disks = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(sysfs_error)? {
            if let Some(name) = entry.file_name().to_str() {
                disks.push(name.to_string());
            }
        }
        disks.sort();

        let mounts = match MountTable::load(&self.ctx, &self.mount_table).await {
            Ok(mounts) => mounts,
            Err(err) => {
                warn!(error = %err, "mount table unavailable, treating devices as unmounted");
                MountTable::default()
            }
        };

        let mut devices = Vec::new();
        for name in disks {
            let disk_dir = self.sys_block.join(&name);
            let removable = read_sysfs(&disk_dir.join("removable")).await;
            if removable.as_deref() != Some("1") {
                continue;
            }

            let mut disk = Device::new(&name, &self.dev_dir);
            disk.is_removable = true;
            disk.size = read_sectors(&disk_dir).await;
            self.probe(&mut disk, &mounts).await;
            devices.push(disk);

            for part_name in partition_dirs(&disk_dir, &name).await {
                let mut partition = Device::new(&part_name, &self.dev_dir);
                partition.is_partition = true;
                partition.is_removable = true;
                partition.partition_index = partition_index(&part_name);
                partition.size = read_sectors(&disk_dir.join(&part_name)).await;
                self.probe(&mut partition, &mounts).await;
                devices.push(partition);
            }
        }

        Ok(devices)
    }

    async fn probe(&self, device: &mut Device, mounts: &MountTable) {
        let path = device.path.display().to_string();
        match self
            .ctx
            .run_checked("blkid", &["-o", "export", path.as_str()])
            .await
        {
            Ok(output) => {
                let (fstype, label, uuid) = parse_blkid_export(&output.stdout);
                device.is_encrypted = fstype.as_deref() == Some(LUKS_FSTYPE);
                device.fstype = fstype;
                device.label = label;
                device.uuid = uuid;
            }
            Err(err) => debug!(device = %path, error = %err, "blkid found no signature"),
        }

        if let Some(mount_point) = mounts.mount_point_of(&device.path) {
            device.set_mounted(mount_point);
        }

        if device.is_encrypted {
            let mapped = UnlockTool::Cryptsetup.mapped_path(device);
            device.is_unlocked = tokio::fs::try_exists(&mapped).await.unwrap_or(false);
            if let Some(mount_point) = mounts.mount_point_of(&mapped) {
                device.set_mounted(mount_point);
            }
        }
    }
}

#[async_trait]
impl DiscoveryBackend for LsblkBackend {
    fn platform(&self) -> Platform {
        Platform::Linux
    }

    async fn scan(&self) -> Result<Vec<Device>> {
        let lsblk_err = match self.scan_lsblk().await {
            Ok(devices) => return Ok(finalize(devices)),
            Err(err) => err,
        };
        warn!(error = %lsblk_err, "lsblk discovery failed, reading sysfs");

        match self.scan_sysfs().await {
            Ok(devices) => Ok(finalize(devices)),
            Err(sysfs_err) => Err(Error::DiscoveryUnavailable {
                failures: vec![format!("lsblk: {lsblk_err}"), sysfs_err.to_string()],
            }),
        }
    }

    /// `sdb1` -> `sdb`, `nvme0n1p1` / `mmcblk0p1` -> `nvme0n1` / `mmcblk0`.
    fn parent_disk_name(&self, name: &str) -> Option<String> {
        let (stem, digits) = split_trailing_digits(name);
        if digits.is_empty() || stem.is_empty() {
            return None;
        }
        match stem.strip_suffix('p') {
            Some(disk) if disk.ends_with(|c: char| c.is_ascii_digit()) => Some(disk.to_string()),
            _ => Some(stem.to_string()),
        }
    }
}

async fn read_sysfs(path: &Path) -> Option<String> {
    tokio::fs::read_to_string(path)
        .await
        .ok()
        .map(|s| s.trim().to_string())
}

async fn read_sectors(dir: &Path) -> u64 {
    read_sysfs(&dir.join("size"))
        .await
        .and_then(|s| s.parse::<u64>().ok())
        .map_or(0, |sectors| sectors * SECTOR_SIZE)
}

/// Partition subdirectories of a `/sys/block/<disk>` directory.
async fn partition_dirs(disk_dir: &Path, disk: &str) -> Vec<String> {
    let Ok(mut entries) = tokio::fs::read_dir(disk_dir).await else {
        return Vec::new();
    };

    let mut names = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Some(name) = entry.file_name().to_str()
            && name.starts_with(disk)
            && name != disk
        {
            names.push(name.to_string());
        }
    }
    names.sort();
    names
}

//! FreeBSD discovery through the GEOM tool set.
//!
//! `geom disk list` enumerates disks, `gpart show -p` their partitions,
//! `file -s` identifies filesystems, `glabel status` and `dumpe2fs -h`
//! supply labels and UUIDs, and `camcontrol devlist` settles removability
//! for disks whose name does not give it away.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::mount_table::MountTable;
use super::{DiscoveryBackend, Platform, finalize, split_trailing_digits};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::executor::ExecutionContext;
use crate::unlock::UnlockTool;

const DEFAULT_DEV_DIR: &str = "/dev";
const DEFAULT_MOUNT_TABLE: &str = "/etc/mtab";

/// Name prefixes of USB mass storage disks.
const REMOVABLE_PREFIXES: [&str; 2] = ["da", "umass"];

/// glabel providers that are identifiers rather than human labels.
const SYNTHETIC_LABEL_CLASSES: [&str; 3] = ["gptid", "diskid", "ufsid"];

/// Discovery backend for FreeBSD.
#[derive(Debug, Clone)]
pub struct GeomBackend {
    ctx: ExecutionContext,
    dev_dir: PathBuf,
    mount_table: PathBuf,
}

impl GeomBackend {
    pub fn new(ctx: ExecutionContext) -> Self {
        Self::with_paths(ctx, DEFAULT_DEV_DIR, DEFAULT_MOUNT_TABLE)
    }

    /// Uses alternative device and mount table locations.
    pub fn with_paths(
        ctx: ExecutionContext,
        dev_dir: impl Into<PathBuf>,
        mount_table: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ctx,
            dev_dir: dev_dir.into(),
            mount_table: mount_table.into(),
        }
    }

    async fn scan_geom(&self) -> Result<Vec<Device>> {
        let output = self.ctx.run_checked("geom", &["disk", "list"]).await?;
        let disks = parse_geom_disk_list(&output.stdout, &self.dev_dir);
        let mut probe = ProbeState::default();
        let mounts = self.load_mounts().await;

        let mut devices = Vec::new();
        for mut disk in disks {
            if !self.is_removable(&disk.name, &mut probe).await {
                debug!(disk = %disk.name, "skipping non-removable disk");
                continue;
            }
            disk.is_removable = true;
            apply_mount(&mut disk, &mounts);

            let partitions = self.partitions(&disk.name).await;
            devices.push(disk);
            for mut partition in partitions {
                self.probe_partition(&mut partition, &mounts, &mut probe).await;
                devices.push(partition);
            }
        }

        Ok(devices)
    }

    /// Lower-fidelity scan of `da*` device nodes.
    async fn scan_dev_nodes(&self) -> Result<Vec<Device>> {
        let mut entries = tokio::fs::read_dir(&self.dev_dir)
            .await
            .map_err(|err| Error::Discovery {
                method: self.dev_dir.display().to_string(),
                message: err.to_string(),
            })?;

        let mut names = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(name) = entry.file_name().to_str()
                && name.starts_with("da")
                && !name.contains('.')
            {
                names.push(name.to_string());
            }
        }

        let mounts = self.load_mounts().await;
        let mut probe = ProbeState::default();
        let mut devices = Vec::new();
        for name in names {
            let mut device = Device::new(&name, &self.dev_dir);
            device.is_removable = true;
            if let Some(disk) = parent_disk(&name) {
                device.is_partition = true;
                device.partition_index = partition_index(&disk, &name);
                self.probe_partition(&mut device, &mounts, &mut probe).await;
            } else {
                apply_mount(&mut device, &mounts);
            }
            devices.push(device);
        }

        Ok(devices)
    }

    async fn load_mounts(&self) -> MountTable {
        match MountTable::load(&self.ctx, &self.mount_table).await {
            Ok(mounts) => mounts,
            Err(err) => {
                warn!(error = %err, "mount table unavailable, treating devices as unmounted");
                MountTable::default()
            }
        }
    }

    async fn is_removable(&self, name: &str, probe: &mut ProbeState) -> bool {
        if REMOVABLE_PREFIXES.iter().any(|p| name.starts_with(p)) {
            return true;
        }

        if probe.devlist.is_none() {
            let devlist = match self.ctx.run_checked("camcontrol", &["devlist"]).await {
                Ok(output) => output.stdout,
                Err(err) => {
                    debug!(error = %err, "camcontrol unavailable");
                    String::new()
                }
            };
            probe.devlist = Some(devlist);
        }

        probe
            .devlist
            .as_deref()
            .is_some_and(|devlist| is_usb_attached(devlist, name))
    }

    async fn partitions(&self, disk: &str) -> Vec<Device> {
        match self.ctx.run_checked("gpart", &["show", "-p", disk]).await {
            Ok(output) => parse_gpart_partitions(&output.stdout, disk, &self.dev_dir),
            Err(err) => {
                // Unpartitioned media is common.
                debug!(disk, error = %err, "no partition table");
                Vec::new()
            }
        }
    }

    async fn probe_partition(
        &self,
        device: &mut Device,
        mounts: &MountTable,
        probe: &mut ProbeState,
    ) {
        let path = device.path.display().to_string();
        if let Ok(output) = self.ctx.run_checked("file", &["-s", path.as_str()]).await {
            let (fstype, encrypted) = classify_file_output(&output.stdout);
            device.fstype = fstype.map(str::to_string);
            device.is_encrypted = encrypted;
        }

        if probe.glabel.is_none() {
            let status = self
                .ctx
                .run_checked("glabel", &["status"])
                .await
                .map(|output| output.stdout)
                .unwrap_or_default();
            probe.glabel = Some(status);
        }
        if let Some(status) = probe.glabel.as_deref() {
            device.label = parse_glabel_status(status, &device.name);
        }

        if device.fstype.as_deref().is_some_and(|fs| fs.starts_with("ext"))
            && let Ok(output) = self.ctx.run_checked("dumpe2fs", &["-h", path.as_str()]).await
        {
            let (label, uuid) = parse_dumpe2fs(&output.stdout);
            if label.is_some() {
                device.label = label;
            }
            device.uuid = uuid;
        }

        if device.is_encrypted {
            let mapped = UnlockTool::Geli.mapped_path(device);
            device.is_unlocked = tokio::fs::try_exists(&mapped).await.unwrap_or(false);
            if let Some(mount_point) = mounts.mount_point_of(&mapped) {
                device.set_mounted(mount_point);
                device.is_unlocked = true;
                return;
            }
        }

        apply_mount(device, mounts);
    }
}

#[async_trait]
impl DiscoveryBackend for GeomBackend {
    fn platform(&self) -> Platform {
        Platform::FreeBsd
    }

    async fn scan(&self) -> Result<Vec<Device>> {
        let geom_err = match self.scan_geom().await {
            Ok(devices) => return Ok(finalize(devices)),
            Err(err) => err,
        };
        warn!(error = %geom_err, "geom discovery failed, scanning device nodes");

        match self.scan_dev_nodes().await {
            Ok(devices) => Ok(finalize(devices)),
            Err(dev_err) => Err(Error::DiscoveryUnavailable {
                failures: vec![format!("geom: {geom_err}"), dev_err.to_string()],
            }),
        }
    }

    fn parent_disk_name(&self, name: &str) -> Option<String> {
        parent_disk(name)
    }
}

/// Tool outputs fetched at most once per scan.
#[derive(Debug, Default)]
struct ProbeState {
    devlist: Option<String>,
    glabel: Option<String>,
}

fn apply_mount(device: &mut Device, mounts: &MountTable) {
    if let Some(mount_point) = mounts.mount_point_of(&device.path) {
        device.set_mounted(mount_point);
    }
}

/// Parses `geom disk list` stanzas into whole-disk records.
pub fn parse_geom_disk_list(output: &str, dev_dir: &Path) -> Vec<Device> {
    let mut disks: Vec<Device> = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if let Some(name) = line.strip_prefix("Geom name:") {
            let name = name.trim();
            if !name.is_empty() {
                disks.push(Device::new(name, dev_dir));
            }
        } else if let Some(size) = line.strip_prefix("Mediasize:")
            && let Some(current) = disks.last_mut()
        {
            current.size = size
                .split_whitespace()
                .next()
                .and_then(|bytes| bytes.parse().ok())
                .unwrap_or(0);
        }
    }

    disks
}

/// Parses `gpart show -p <disk>` rows into partition records.
pub fn parse_gpart_partitions(output: &str, disk: &str, dev_dir: &Path) -> Vec<Device> {
    let mut partitions = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.starts_with("=>") {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 || !fields[0].starts_with(|c: char| c.is_ascii_digit()) {
            continue;
        }

        let Some(name) = fields[1..]
            .iter()
            .find(|field| partition_index(disk, field).is_some())
        else {
            continue;
        };

        let mut partition = Device::new(*name, dev_dir);
        partition.is_partition = true;
        partition.is_removable = true;
        partition.partition_index = partition_index(disk, name);
        partitions.push(partition);
    }

    partitions
}

/// Maps `file -s` output to a filesystem type and an encryption flag.
pub fn classify_file_output(output: &str) -> (Option<&'static str>, bool) {
    // Drop the "<path>: " prefix so device names cannot match.
    let description = output.split_once(": ").map_or(output, |(_, rest)| rest);

    let fstype = if description.contains("ext4") {
        Some("ext4")
    } else if description.contains("ext3") {
        Some("ext3")
    } else if description.contains("ext2") {
        Some("ext2")
    } else if description.contains("NTFS") {
        Some("ntfs")
    } else if description.contains("exFAT") {
        Some("exfat")
    } else if description.contains("FAT") {
        Some("msdosfs")
    } else if description.contains("UFS") {
        Some("ufs")
    } else if description.contains("ZFS") {
        Some("zfs")
    } else {
        None
    };

    (fstype, description.contains("GELI"))
}

/// Finds the human label glabel reports for provider `name`.
pub fn parse_glabel_status(output: &str, name: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 || fields.last() != Some(&name) {
            return None;
        }

        let (class, label) = fields[0].split_once('/')?;
        if SYNTHETIC_LABEL_CLASSES.contains(&class) || label.is_empty() {
            return None;
        }
        Some(label.to_string())
    })
}

/// Extracts `(label, uuid)` from `dumpe2fs -h`; `<none>` means no label.
pub fn parse_dumpe2fs(output: &str) -> (Option<String>, Option<String>) {
    let mut label = None;
    let mut uuid = None;

    for line in output.lines() {
        if let Some(value) = line.strip_prefix("Filesystem volume name:") {
            let value = value.trim();
            if !value.is_empty() && value != "<none>" {
                label = Some(value.to_string());
            }
        } else if let Some(value) = line.strip_prefix("Filesystem UUID:") {
            let value = value.trim();
            if !value.is_empty() {
                uuid = Some(value.to_string());
            }
        }
    }

    (label, uuid)
}

/// True if `camcontrol devlist` attaches `name` to a USB / mass storage bus.
fn is_usb_attached(devlist: &str, name: &str) -> bool {
    devlist.lines().any(|line| {
        let attached = line
            .trim_end()
            .rsplit_once('(')
            .and_then(|(_, periphs)| periphs.strip_suffix(')'))
            .is_some_and(|periphs| periphs.split(',').any(|p| p.trim() == name));
        let lower = line.to_lowercase();
        attached && (lower.contains("usb") || lower.contains("mass storage"))
    })
}

/// `<disk>p<N>` or `<disk>s<N>` -> N.
fn partition_index(disk: &str, name: &str) -> Option<u32> {
    let suffix = name.strip_prefix(disk)?;
    let digits = suffix.strip_prefix('p').or_else(|| suffix.strip_prefix('s'))?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// `da0p1` / `da0s1` -> `da0`.
pub(crate) fn parent_disk(name: &str) -> Option<String> {
    let (stem, digits) = split_trailing_digits(name);
    if digits.is_empty() {
        return None;
    }
    let disk = stem.strip_suffix('p').or_else(|| stem.strip_suffix('s'))?;
    disk.ends_with(|c: char| c.is_ascii_digit())
        .then(|| disk.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ToolOutput;
    use crate::executor::testing::{ScriptedRunner, context};

    const GEOM_DISK_LIST: &str = "\
Geom name: ada0
Providers:
1. Name: ada0
   Mediasize: 256060514304 (238G)
   Sectorsize: 512
   descr: Samsung SSD 860

Geom name: da0
Providers:
1. Name: da0
   Mediasize: 8000000000 (7.5G)
   Sectorsize: 512
";

    const GPART_DA0: &str = "\
=>      40  15624920    da0  GPT  (7.5G)
        40  15624880  da0p1  ms-basic-data  (7.5G)
  15624920        40         - free -  (20K)
";

    #[test]
    fn test_parse_geom_disk_list() {
        let disks = parse_geom_disk_list(GEOM_DISK_LIST, Path::new("/dev"));
        assert_eq!(disks.len(), 2);
        assert_eq!(disks[0].name, "ada0");
        assert_eq!(disks[0].size, 256060514304);
        assert_eq!(disks[1].path, PathBuf::from("/dev/da0"));
        assert_eq!(disks[1].size, 8000000000);
    }

    #[test]
    fn test_parse_gpart_skips_headers_and_free_space() {
        let partitions = parse_gpart_partitions(GPART_DA0, "da0", Path::new("/dev"));
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].name, "da0p1");
        assert_eq!(partitions[0].partition_index, Some(1));
        assert!(partitions[0].is_partition);
    }

    #[test]
    fn test_parse_gpart_mbr_slices() {
        let output = "\
=>      63  15633345    da1  MBR  (7.5G)
        63  15633345  da1s1  fat32lba  [active]  (7.5G)
";
        let partitions = parse_gpart_partitions(output, "da1", Path::new("/dev"));
        assert_eq!(partitions[0].name, "da1s1");
        assert_eq!(partitions[0].partition_index, Some(1));
    }

    #[test]
    fn test_classify_file_output() {
        let fat = "/dev/da0p1: DOS/MBR boot sector, OEM-ID \"mkfs.fat\", FAT (32 bit)";
        assert_eq!(classify_file_output(fat), (Some("msdosfs"), false));

        let ext = "/dev/da0p1: Linux rev 1.0 ext4 filesystem data, UUID=abc (extents)";
        assert_eq!(classify_file_output(ext).0, Some("ext4"));

        let ntfs = "/dev/da0p1: DOS/MBR boot sector, OEM-ID \"NTFS    \"";
        assert_eq!(classify_file_output(ntfs).0, Some("ntfs"));

        let geli = "/dev/da0p1: GELI encrypted data";
        assert_eq!(classify_file_output(geli), (None, true));

        // Device names never influence the result.
        assert_eq!(classify_file_output("/dev/ext4disk: data").0, None);
    }

    #[test]
    fn test_parse_glabel_status() {
        let output = "\
                                      Name  Status  Components
                           gpt/efiboot0     N/A  ada0p1
gptid/7b0e2f3c-1111-11ee-8c9a-0800270a8f2e     N/A  da0p1
                         msdosfs/USBSTICK     N/A  da0p1
                         msdosfs/OTHER        N/A  da0p10
";
        assert_eq!(parse_glabel_status(output, "da0p1"), Some("USBSTICK".to_string()));
        assert_eq!(parse_glabel_status(output, "da0p10"), Some("OTHER".to_string()));
        assert_eq!(parse_glabel_status(output, "da1p1"), None);
    }

    #[test]
    fn test_parse_dumpe2fs() {
        let output = "\
dumpe2fs 1.47.0 (5-Feb-2023)
Filesystem volume name:   <none>
Last mounted on:          <not available>
Filesystem UUID:          5b1c6f0e-2f39-4b4e-9f0f-0c1d2e3f4a5b
";
        let (label, uuid) = parse_dumpe2fs(output);
        assert_eq!(label, None);
        assert_eq!(uuid.as_deref(), Some("5b1c6f0e-2f39-4b4e-9f0f-0c1d2e3f4a5b"));
    }

    #[test]
    fn test_usb_attachment_from_camcontrol() {
        let devlist = "\
<ATA Samsung SSD 860 RVT0>          at scbus0 target 0 lun 0 (ada0,pass0)
<Generic USB Flash Disk 8.07>       at scbus1 target 0 lun 0 (pass1,sd0)
";
        assert!(is_usb_attached(devlist, "sd0"));
        assert!(!is_usb_attached(devlist, "ada0"));
        assert!(!is_usb_attached(devlist, "sd"));
    }

    #[test]
    fn test_parent_disk() {
        assert_eq!(parent_disk("da0p1").as_deref(), Some("da0"));
        assert_eq!(parent_disk("da12s3").as_deref(), Some("da12"));
        assert_eq!(parent_disk("da0"), None);
        assert_eq!(parent_disk("umass"), None);
    }

    fn fat_stick_runner() -> std::sync::Arc<ScriptedRunner> {
        let runner = ScriptedRunner::new();
        runner
            .on(
                "geom",
                ToolOutput::ok("Geom name: da0\n   Mediasize: 8000000000 (7.5G)\n"),
            )
            .on("gpart", ToolOutput::ok(GPART_DA0))
            .on(
                "file",
                ToolOutput::ok("/dev/da0p1: DOS/MBR boot sector, FAT (32 bit)\n"),
            )
            .on("glabel", ToolOutput::ok(""))
            .on("mount", ToolOutput::ok(""));
        runner
    }

    #[tokio::test]
    async fn test_scan_fat_stick() {
        let runner = fat_stick_runner();
        let backend =
            GeomBackend::with_paths(context(&runner), "/dev", "/nonexistent/mtab");

        let devices = backend.scan().await.unwrap();
        assert_eq!(devices.len(), 2);

        let partition = &devices[1];
        assert_eq!(partition.name, "da0p1");
        assert_eq!(partition.path, PathBuf::from("/dev/da0p1"));
        assert_eq!(partition.fstype.as_deref(), Some("msdosfs"));
        assert!(partition.is_partition);
        assert!(partition.is_removable);
        assert!(!partition.is_mounted);
    }

    #[tokio::test]
    async fn test_scan_is_idempotent() {
        let runner = fat_stick_runner();
        let backend =
            GeomBackend::with_paths(context(&runner), "/dev", "/nonexistent/mtab");

        let first = backend.scan().await.unwrap();
        let second = backend.scan().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_scan_marks_mounted_partition() {
        let runner = fat_stick_runner();
        let dir = tempfile::tempdir().unwrap();
        let mtab = dir.path().join("mtab");
        std::fs::write(&mtab, "/dev/da0p1 /media/USB msdosfs rw 0 0\n").unwrap();
        let backend = GeomBackend::with_paths(context(&runner), "/dev", &mtab);

        let devices = backend.scan().await.unwrap();
        assert_eq!(devices[1].mount_point, Some(PathBuf::from("/media/USB")));
        assert!(devices[1].is_mounted);
    }

    #[tokio::test]
    async fn test_fallback_scans_device_nodes() {
        let runner = ScriptedRunner::new();
        runner
            .missing("geom")
            .on("file", ToolOutput::ok("/dev/da0p1: data\n"))
            .on("mount", ToolOutput::ok(""));
        let dir = tempfile::tempdir().unwrap();
        for node in ["da0", "da0p1", "ada0", "da0p1.eli"] {
            std::fs::write(dir.path().join(node), "").unwrap();
        }
        let backend =
            GeomBackend::with_paths(context(&runner), dir.path(), "/nonexistent/mtab");

        let devices = backend.scan().await.unwrap();
        let names: Vec<_> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["da0", "da0p1"]);
        assert!(devices[1].is_partition);
    }

    #[tokio::test]
    async fn test_all_methods_failing_is_an_error() {
        let runner = ScriptedRunner::new();
        let backend = GeomBackend::with_paths(
            context(&runner),
            "/nonexistent/dev",
            "/nonexistent/mtab",
        );

        let err = backend.scan().await.unwrap_err();
        match err {
            Error::DiscoveryUnavailable { failures } => assert_eq!(failures.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }
}

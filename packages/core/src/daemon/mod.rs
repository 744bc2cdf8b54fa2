//! The automount daemon.
//!
//! A single poll task scans for devices, diffs each scan against the
//! previous [`Snapshot`] and turns the difference into per-device work:
//! added partitions are unlocked and mounted, removed ones are unmounted.
//! That work runs in tracked tasks so a slow mount never delays removal
//! detection for other devices, and [`Daemon::stop`] waits for all of it.
//!
//! Transitions of one device are serialized by a per-path async mutex.
//! The bookkeeping map (device path to mounted device) is the only state
//! kept across scans.

mod report;
mod snapshot;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{Config, NotificationConfig};
use crate::device::{Device, is_direct_child};
use crate::discovery::{CachedDiscovery, DEFAULT_TTL, DiscoveryBackend, default_backend};
use crate::error::{BatchReport, Error, Result};
use crate::executor::ExecutionContext;
use crate::hooks::{HookDispatcher, HookEvent};
use crate::mount;
use crate::notify::{NotificationSink, Notifier, NullNotifier};
use crate::policy::MountPolicy;
use crate::unlock::{CommandPassphrase, PassphraseSource, TerminalPassphrase, UnlockTool, Unlocker};

pub use report::{Report, ReportKind, Stage};
pub use snapshot::{DeviceEvent, Snapshot, SnapshotStore, diff, snapshot_of};

use report::Reporter;

/// Overrides for a user-requested mount.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountRequest {
    /// Filesystem type passed as `-t` instead of the detected one.
    pub fstype: Option<String>,
    /// Options passed as `-o` instead of the policy's.
    pub options: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
struct Tracked {
    device: Device,
    /// The daemon created the mount point and removes it on unmount.
    owns_mount_point: bool,
}

/// Holds a mount point name until the mount finishes or fails.
struct Reservation<'a> {
    reserved: &'a Mutex<HashSet<PathBuf>>,
    path: PathBuf,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.reserved.lock().remove(&self.path);
    }
}

struct Shared {
    ctx: ExecutionContext,
    discovery: CachedDiscovery,
    policy: Arc<dyn MountPolicy>,
    unlocker: Unlocker,
    hooks: HookDispatcher,
    reporter: Reporter,
    snapshot: SnapshotStore,
    mounted: RwLock<BTreeMap<PathBuf, Tracked>>,
    /// Device path to the path of its decrypted view.
    unlocked: RwLock<BTreeMap<PathBuf, PathBuf>>,
    reserved: Mutex<HashSet<PathBuf>>,
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    mount_base: PathBuf,
    file_manager: Option<String>,
    poll_interval: Duration,
    automount: bool,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Shared {
    fn device_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .clone()
    }

    /// Picks `<base>/<name>`, or `<base>/<name>-N` when that is taken by
    /// another tracked mount, a mount in progress, a mount seen in the last
    /// scan or a directory that is not empty.
    fn reserve_mount_point(&self, device: &Device) -> Reservation<'_> {
        let stem = device.mount_dir_name();
        let scanned = self.snapshot.current();
        let mounted = self.mounted.read();
        let in_use: HashSet<&Path> = mounted
            .values()
            .map(|t| &t.device)
            .chain(scanned.values())
            .filter_map(|d| d.mount_point.as_deref())
            .collect();

        let mut reserved = self.reserved.lock();
        let mut n = 1;
        let path = loop {
            let candidate = if n == 1 {
                self.mount_base.join(&stem)
            } else {
                self.mount_base.join(format!("{stem}-{n}"))
            };
            if !in_use.contains(candidate.as_path())
                && !reserved.contains(&candidate)
                && mount::mount_point_available(&candidate)
            {
                break candidate;
            }
            n += 1;
        };
        reserved.insert(path.clone());

        Reservation {
            reserved: &self.reserved,
            path,
        }
    }

    fn is_ignored(&self, device: &Device) -> bool {
        self.policy
            .should_ignore(device.label_str(), device.volume_id(), &device.path)
    }

    fn tracked(&self, path: &Path) -> Option<Device> {
        self.mounted.read().get(path).map(|t| t.device.clone())
    }

    /// Drops all state for a device that left the system.
    fn forget(&self, path: &Path) {
        self.unlocked.write().remove(path);
        let mut locks = self.locks.lock();
        if locks
            .get(path)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(path);
        }
    }

    /// Tracks mounts found on the system that belong to the daemon.
    fn adopt(&self, devices: &[Device]) {
        let mut mounted = self.mounted.write();
        let mut unlocked = self.unlocked.write();

        for device in devices {
            if device.is_encrypted && device.is_unlocked {
                unlocked
                    .entry(device.path.clone())
                    .or_insert_with(|| self.unlocker.tool().mapped_path(device));
            }

            if let Some(mount_point) = device.mount_point.as_deref()
                && device.is_mounted
                && is_direct_child(&self.mount_base, mount_point)
                && !mounted.contains_key(&device.path)
            {
                debug!(device = %device.path.display(), mount_point = %mount_point.display(), "adopting existing mount");
                mounted.insert(
                    device.path.clone(),
                    Tracked {
                        device: device.clone(),
                        owns_mount_point: true,
                    },
                );
            }
        }
    }
}

/// Cloneable handle to a running or idle daemon.
#[derive(Clone)]
pub struct Daemon {
    shared: Arc<Shared>,
}

impl fmt::Debug for Daemon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Daemon")
            .field("mount_base", &self.shared.mount_base)
            .field("poll_interval", &self.shared.poll_interval)
            .field("automount", &self.shared.automount)
            .field("mounted", &self.shared.mounted.read().len())
            .finish_non_exhaustive()
    }
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: Config) -> DaemonBuilder {
        DaemonBuilder::new(config)
    }

    /// Runs the initial scan and starts the poll task.
    ///
    /// Devices already mounted under the mount base are adopted, and every
    /// device found is handled as newly added. A failed initial scan is
    /// returned; later scan failures only skip a tick.
    pub async fn start(&self) -> Result<()> {
        let devices = self.shared.discovery.scan().await?;
        info!(devices = devices.len(), base = %self.shared.mount_base.display(), "daemon started");

        self.shared.adopt(&devices);
        self.apply(devices);

        let daemon = self.clone();
        self.shared.tracker.spawn(daemon.poll_loop());
        Ok(())
    }

    /// Stops polling and waits for in-flight device work and hooks.
    pub async fn stop(&self) {
        info!("stopping daemon");
        self.shared.cancel.cancel();
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        debug!("daemon stopped");
    }

    /// Token cancelled by [`Daemon::stop`].
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    async fn poll_loop(self) {
        let shared = &self.shared;
        let mut interval =
            tokio::time::interval_at(Instant::now() + shared.poll_interval, shared.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.tick().await {
                Ok(events) if !events.is_empty() => debug!(events = events.len(), "devices changed"),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "device scan failed, keeping previous snapshot"),
            }
        }
        debug!("poll loop stopped");
    }

    /// Scans once and handles the difference to the previous scan.
    ///
    /// On error the previous snapshot is kept.
    pub async fn tick(&self) -> Result<Vec<DeviceEvent>> {
        let devices = self.shared.discovery.scan().await?;
        Ok(self.apply(devices))
    }

    fn apply(&self, devices: Vec<Device>) -> Vec<DeviceEvent> {
        let next = snapshot_of(devices);
        let previous = self.shared.snapshot.replace(next.clone());
        let events = diff(&previous, &next);
        for event in &events {
            match event {
                DeviceEvent::Added(device) => self.on_added(device.clone()),
                DeviceEvent::Removed(device) => self.on_removed(device.clone()),
            }
        }
        events
    }

    fn on_added(&self, device: Device) {
        let shared = &self.shared;
        if shared.is_ignored(&device) {
            debug!(device = %device.path.display(), "ignoring device");
            return;
        }

        info!(device = %device.path.display(), name = %device.display_name(), "device added");
        shared
            .reporter
            .report(&device.path, device.display_name(), ReportKind::Added);
        shared.hooks.dispatch(HookEvent::DeviceAdded, &device);

        let wanted = shared.automount
            && device.is_partition
            && !device.is_mounted
            && shared
                .policy
                .should_automount(device.label_str(), device.volume_id(), &device.path);
        if wanted {
            let daemon = self.clone();
            shared.tracker.spawn(async move { daemon.automount(device).await });
        }
    }

    /// Mounts a device found by a scan, unless it left the system while
    /// this task waited for the device lock.
    async fn automount(&self, device: Device) {
        let lock = self.shared.device_lock(&device.path);
        let _guard = lock.lock().await;

        if self.shared.snapshot.get(&device.path).is_none() {
            debug!(device = %device.path.display(), "device gone before automount");
            return;
        }
        if let Err(err) = self.mount_locked(device, MountRequest::default()).await {
            debug!(error = %err, "automount did not complete");
        }
    }

    fn on_removed(&self, device: Device) {
        let shared = &self.shared;
        let tracked = shared.tracked(&device.path);
        if tracked.is_some() || !shared.is_ignored(&device) {
            let known = tracked.as_ref().unwrap_or(&device);
            info!(device = %device.path.display(), name = %known.display_name(), "device removed");
            shared
                .reporter
                .report(&device.path, known.display_name(), ReportKind::Removed);
            shared.hooks.dispatch(HookEvent::DeviceRemoved, known);
        }

        // A mount of this device may still be running; the cleanup waits
        // for it behind the device lock.
        let daemon = self.clone();
        shared
            .tracker
            .spawn(async move { daemon.cleanup_removed(device).await });
    }

    /// Unmounts a device that disappeared, forcing if the plain unmount
    /// fails, then drops its state. On failure the entry stays tracked so
    /// a manual retry works.
    async fn cleanup_removed(&self, device: Device) {
        let path = device.path;
        let lock = self.shared.device_lock(&path);
        {
            let _guard = lock.lock().await;
            if let Some(tracked) = self.shared.tracked(&path) {
                let result = match self.unmount_locked(&path, false).await {
                    Err(err @ Error::NotMounted { .. }) => Err(err),
                    Err(err) => {
                        debug!(device = %path.display(), error = %err, "unmount failed, forcing");
                        self.unmount_locked(&path, true).await
                    }
                    ok => ok,
                };

                match result {
                    Ok(_) | Err(Error::NotMounted { .. }) => {}
                    Err(err) => {
                        self.fail(&path, tracked.display_name(), Stage::Unmount, err);
                        return;
                    }
                }
            }
        }
        drop(lock);

        // Plugged back in while this task waited.
        if self.shared.snapshot.get(&path).is_none() {
            self.shared.forget(&path);
        }
    }

    /// Mounts `device` with policy-derived type and options.
    pub async fn mount_device(&self, device: Device) -> Result<Device> {
        self.mount_with(device, MountRequest::default()).await
    }

    /// Drives `device` through unlock (if encrypted) and mount.
    ///
    /// A device that is already mounted, or that another caller mounted
    /// while this one waited, yields [`Error::AlreadyMounted`]. Every other
    /// failure is also reported to subscribers.
    pub async fn mount_with(&self, device: Device, request: MountRequest) -> Result<Device> {
        let lock = self.shared.device_lock(&device.path);
        let _guard = lock.lock().await;
        self.mount_locked(device, request).await
    }

    async fn mount_locked(&self, mut device: Device, request: MountRequest) -> Result<Device> {
        let shared = &self.shared;

        let tracked = shared.tracked(&device.path);
        if let Some(tracked) = tracked {
            return Err(Error::AlreadyMounted {
                path: device.path,
                mount_point: tracked.mount_point.unwrap_or_default(),
            });
        }
        if device.is_mounted {
            return Err(Error::AlreadyMounted {
                path: device.path,
                mount_point: device.mount_point.unwrap_or_default(),
            });
        }

        let source = if device.is_encrypted {
            let mapped = self.unlock_for_mount(&device).await?;
            device.is_unlocked = true;
            mapped
        } else {
            device.path.clone()
        };

        // The outer type of an encrypted volume says nothing about the
        // filesystem inside it.
        let fstype = match request.fstype {
            Some(fstype) => Some(fstype),
            None if device.is_encrypted => None,
            None => device.mount_fstype().map(str::to_string),
        };
        let options = match request.options {
            Some(options) => options,
            None => shared.policy.mount_options(
                fstype.as_deref().unwrap_or(""),
                device.label_str(),
                device.volume_id(),
                &device.path,
            ),
        };

        let reservation = shared.reserve_mount_point(&device);
        let mount_point = reservation.path.clone();

        let created = mount::create_mount_point(&shared.mount_base, &mount_point)
            .map_err(|err| self.fail(&device.path, device.display_name(), Stage::Mount, err))?;

        if let Err(err) =
            mount::mount(&shared.ctx, &source, fstype.as_deref(), &options, &mount_point).await
        {
            if created && let Err(rm_err) = mount::remove_mount_point(&mount_point) {
                debug!(mount_point = %mount_point.display(), error = %rm_err, "could not remove mount point");
            }
            return Err(self.fail(&device.path, device.display_name(), Stage::Mount, err));
        }

        device.set_mounted(mount_point.clone());
        shared.mounted.write().insert(
            device.path.clone(),
            Tracked {
                device: device.clone(),
                owns_mount_point: created,
            },
        );
        drop(reservation);
        shared.discovery.invalidate().await;

        info!(device = %device.path.display(), mount_point = %mount_point.display(), "mounted");
        shared.reporter.report(
            &device.path,
            device.display_name(),
            ReportKind::Mounted {
                mount_point: mount_point.clone(),
            },
        );
        shared.hooks.dispatch(HookEvent::DeviceMounted, &device);
        self.open_file_manager(&mount_point);

        Ok(device)
    }

    async fn unlock_for_mount(&self, device: &Device) -> Result<PathBuf> {
        let shared = &self.shared;

        let known = shared.unlocked.read().get(&device.path).cloned();
        if let Some(mapped) = known {
            return Ok(mapped);
        }
        if device.is_unlocked {
            let mapped = shared.unlocker.tool().mapped_path(device);
            shared
                .unlocked
                .write()
                .insert(device.path.clone(), mapped.clone());
            return Ok(mapped);
        }

        info!(device = %device.path.display(), "unlocking encrypted device");
        let mapped = shared
            .unlocker
            .unlock(device)
            .await
            .map_err(|err| self.fail(&device.path, device.display_name(), Stage::Unlock, err))?;

        shared
            .unlocked
            .write()
            .insert(device.path.clone(), mapped.clone());
        shared
            .reporter
            .report(&device.path, device.display_name(), ReportKind::Unlocked);
        shared.hooks.dispatch(HookEvent::DeviceUnlocked, device);
        Ok(mapped)
    }

    /// Unmounts the tracked device at `path`.
    ///
    /// On failure the bookkeeping is left as it was, so the call can be
    /// retried.
    pub async fn unmount_device(&self, path: &Path, force: bool) -> Result<Device> {
        let lock = self.shared.device_lock(path);
        let _guard = lock.lock().await;

        let display_name = self
            .shared
            .tracked(path)
            .map(|d| d.display_name())
            .unwrap_or_else(|| path.display().to_string());

        self.unmount_locked(path, force)
            .await
            .map_err(|err| match err {
                Error::NotMounted { .. } => err,
                err => self.fail(path, display_name, Stage::Unmount, err),
            })
    }

    async fn unmount_locked(&self, path: &Path, force: bool) -> Result<Device> {
        let shared = &self.shared;

        let tracked = shared.mounted.read().get(path).cloned();
        let Some(Tracked {
            mut device,
            owns_mount_point,
        }) = tracked
        else {
            return Err(Error::NotMounted {
                path: path.to_path_buf(),
            });
        };
        let Some(mount_point) = device.mount_point.clone() else {
            shared.mounted.write().remove(path);
            return Err(Error::NotMounted {
                path: path.to_path_buf(),
            });
        };

        mount::unmount(&shared.ctx, &mount_point, force).await?;

        shared.mounted.write().remove(path);
        shared.discovery.invalidate().await;
        if owns_mount_point && let Err(err) = mount::remove_mount_point(&mount_point) {
            warn!(mount_point = %mount_point.display(), error = %err, "could not remove mount point");
        }

        info!(device = %path.display(), mount_point = %mount_point.display(), "unmounted");
        shared.hooks.dispatch(HookEvent::DeviceUnmounted, &device);
        shared
            .reporter
            .report(path, device.display_name(), ReportKind::Unmounted);

        device.clear_mount();
        Ok(device)
    }

    /// Mounts the device named by `target` (path, name or `/dev/<name>`).
    pub async fn mount_path(&self, target: &str, request: MountRequest) -> Result<Device> {
        let device = self.find_device(target).await?;
        self.mount_with(device, request).await
    }

    /// Unmounts the device named by `target` (device or mount point).
    ///
    /// A device mounted outside the daemon is taken over first; its mount
    /// point is only removed if it sits in the mount base.
    pub async fn unmount_path(&self, target: &str, force: bool) -> Result<Device> {
        let tracked = self
            .shared
            .mounted
            .read()
            .values()
            .find(|t| t.device.matches_target(target))
            .map(|t| t.device.path.clone());

        let path = match tracked {
            Some(path) => path,
            None => {
                let device = self.find_device(target).await?;
                let Some(mount_point) = device.mount_point.clone().filter(|_| device.is_mounted)
                else {
                    return Err(Error::NotMounted { path: device.path });
                };
                let path = device.path.clone();
                self.shared.mounted.write().entry(path.clone()).or_insert(Tracked {
                    device,
                    owns_mount_point: is_direct_child(&self.shared.mount_base, &mount_point),
                });
                path
            }
        };

        self.unmount_device(&path, force).await
    }

    /// Mounts every unmounted, non-ignored partition.
    ///
    /// Each device is attempted even if an earlier one failed.
    pub async fn mount_all(&self) -> Result<BatchReport> {
        let devices = self.shared.discovery.scan().await?;
        let mut report = BatchReport::default();

        for device in devices {
            if !device.is_partition
                || device.is_mounted
                || self.shared.is_ignored(&device)
                || self.shared.tracked(&device.path).is_some()
            {
                continue;
            }

            let path = device.path.clone();
            match self.mount_device(device).await {
                Ok(_) => report.record_success(),
                Err(err) => report.record_failure(path, err),
            }
        }

        info!(succeeded = report.succeeded, failed = report.failures.len(), "mount all finished");
        Ok(report)
    }

    /// Unmounts every tracked device and every device mounted in the
    /// mount base.
    pub async fn unmount_all(&self, force: bool) -> BatchReport {
        match self.shared.discovery.scan().await {
            Ok(devices) => self.shared.adopt(&devices),
            Err(err) => warn!(error = %err, "scan failed, unmounting tracked devices only"),
        }

        let paths: Vec<PathBuf> = self.shared.mounted.read().keys().cloned().collect();
        let mut report = BatchReport::default();
        for path in paths {
            match self.unmount_device(&path, force).await {
                Ok(_) => report.record_success(),
                Err(err) => report.record_failure(path, err),
            }
        }

        info!(succeeded = report.succeeded, failed = report.failures.len(), "unmount all finished");
        report
    }

    /// Powers down the disk holding `target` once none of its partitions is
    /// mounted.
    pub async fn detach(&self, target: &str) -> Result<()> {
        let shared = &self.shared;
        let devices = shared.discovery.scan().await?;
        let device = devices
            .iter()
            .find(|d| d.matches_target(target))
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound {
                target: target.to_string(),
            })?;

        let disk_of = |d: &Device| {
            if d.is_partition {
                shared
                    .discovery
                    .parent_disk_name(&d.name)
                    .unwrap_or_else(|| d.name.clone())
            } else {
                d.name.clone()
            }
        };
        let disk = disk_of(&device);

        let tracked: Vec<Device> = shared
            .mounted
            .read()
            .values()
            .map(|t| t.device.clone())
            .collect();
        if let Some(busy) = devices
            .iter()
            .filter(|d| d.is_mounted)
            .chain(tracked.iter())
            .find(|d| disk_of(*d) == disk)
        {
            return Err(Error::AlreadyMounted {
                path: busy.path.clone(),
                mount_point: busy.mount_point.clone().unwrap_or_default(),
            });
        }

        mount::detach(&shared.ctx, shared.discovery.platform(), &disk)
            .await
            .map_err(|err| self.fail(&device.path, device.display_name(), Stage::Detach, err))
    }

    /// Lists removable devices. Concurrent callers share one scan.
    pub async fn devices(&self) -> Result<Vec<Device>> {
        self.shared.discovery.scan().await
    }

    /// Consistent copy of the bookkeeping: device path to mounted device.
    pub fn status(&self) -> BTreeMap<PathBuf, Device> {
        self.shared
            .mounted
            .read()
            .iter()
            .map(|(path, tracked)| (path.clone(), tracked.device.clone()))
            .collect()
    }

    /// Devices from the most recent scan.
    pub fn snapshot(&self) -> Snapshot {
        self.shared.snapshot.current()
    }

    pub fn is_unlocked(&self, path: &Path) -> bool {
        self.shared.unlocked.read().contains_key(path)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Report> {
        self.shared.reporter.subscribe()
    }

    async fn find_device(&self, target: &str) -> Result<Device> {
        self.shared
            .discovery
            .scan()
            .await?
            .into_iter()
            .find(|d| d.matches_target(target))
            .ok_or_else(|| Error::DeviceNotFound {
                target: target.to_string(),
            })
    }

    fn fail(&self, path: &Path, display_name: String, stage: Stage, err: Error) -> Error {
        warn!(device = %path.display(), %stage, error = %err, "device operation failed");
        self.shared.reporter.report(
            path,
            display_name,
            ReportKind::Failed {
                stage,
                message: err.to_string(),
            },
        );
        err
    }

    fn open_file_manager(&self, mount_point: &Path) {
        let Some(program) = self.shared.file_manager.clone() else {
            return;
        };
        let ctx = self.shared.ctx.clone();
        let mount_point = mount_point.display().to_string();

        // Not tracked: shutdown does not wait for the file manager.
        tokio::spawn(async move {
            match ctx.run(&program, &[mount_point]).await {
                Ok(output) if !output.success() => {
                    debug!(%program, output = %output.combined(), "file manager exited with error")
                }
                Ok(_) => {}
                Err(err) => warn!(%program, error = %err, "failed to open file manager"),
            }
        });
    }

    #[cfg(test)]
    async fn settle(&self) {
        while !self.shared.tracker.is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

/// Configures a [`Daemon`]; every collaborator has a default derived from
/// the [`Config`].
pub struct DaemonBuilder {
    config: Config,
    ctx: Option<ExecutionContext>,
    discovery: Option<Arc<dyn DiscoveryBackend>>,
    policy: Option<Arc<dyn MountPolicy>>,
    notifier: Option<Arc<dyn NotificationSink>>,
    passphrases: Option<Arc<dyn PassphraseSource>>,
    automount: Option<bool>,
    poll_interval: Option<Duration>,
    cache_ttl: Duration,
}

impl DaemonBuilder {
    fn new(config: Config) -> Self {
        Self {
            config,
            ctx: None,
            discovery: None,
            policy: None,
            notifier: None,
            passphrases: None,
            automount: None,
            poll_interval: None,
            cache_ttl: DEFAULT_TTL,
        }
    }

    pub fn execution_context(mut self, ctx: ExecutionContext) -> Self {
        self.ctx = Some(ctx);
        self
    }

    pub fn discovery(mut self, discovery: Arc<dyn DiscoveryBackend>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn policy(mut self, policy: Arc<dyn MountPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn passphrase_source(mut self, source: Arc<dyn PassphraseSource>) -> Self {
        self.passphrases = Some(source);
        self
    }

    /// Overrides `automount` from the config.
    pub fn automount(mut self, automount: bool) -> Self {
        self.automount = Some(automount);
        self
    }

    /// Overrides `poll_interval_secs` from the config.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// How long a scan result is shared between callers.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn build(self) -> Daemon {
        let config = self.config;
        let ctx = self
            .ctx
            .unwrap_or_else(|| ExecutionContext::with_escalation(config.privilege));

        let backend: Arc<dyn DiscoveryBackend> = match self.discovery {
            Some(backend) => backend,
            None => default_backend(ctx.clone()),
        };
        let tool = UnlockTool::for_platform(backend.platform());

        let policy: Arc<dyn MountPolicy> = match self.policy {
            Some(policy) => policy,
            None => Arc::new(config.clone()),
        };
        let notifier = match self.notifier {
            Some(notifier) => notifier,
            None => default_notifier(&ctx, &config.notifications),
        };
        let passphrases: Arc<dyn PassphraseSource> = match self.passphrases {
            Some(source) => source,
            None => match config.encryption.password_cmd.as_deref() {
                Some(cmd) if !cmd.trim().is_empty() => {
                    Arc::new(CommandPassphrase::new(ctx.clone(), cmd))
                }
                _ => Arc::new(TerminalPassphrase::new()),
            },
        };

        let tracker = TaskTracker::new();
        let shared = Shared {
            discovery: CachedDiscovery::with_ttl(backend, self.cache_ttl),
            policy,
            unlocker: Unlocker::new(ctx.clone(), tool, config.encryption.clone(), passphrases),
            hooks: HookDispatcher::new(ctx.clone(), config.event_hooks.clone(), tracker.clone()),
            reporter: Reporter::new(notifier, config.notifications.clone()),
            snapshot: SnapshotStore::default(),
            mounted: RwLock::new(BTreeMap::new()),
            unlocked: RwLock::new(BTreeMap::new()),
            reserved: Mutex::new(HashSet::new()),
            locks: Mutex::new(HashMap::new()),
            mount_base: config.mount_base.clone(),
            file_manager: Some(config.file_manager.clone()).filter(|fm| !fm.trim().is_empty()),
            poll_interval: self.poll_interval.unwrap_or_else(|| config.poll_interval()),
            automount: self.automount.unwrap_or(config.automount),
            cancel: CancellationToken::new(),
            tracker,
            ctx,
        };

        Daemon {
            shared: Arc::new(shared),
        }
    }
}

fn default_notifier(
    ctx: &ExecutionContext,
    config: &NotificationConfig,
) -> Arc<dyn NotificationSink> {
    if !config.enabled {
        return Arc::new(NullNotifier);
    }
    match Notifier::init(ctx.clone()) {
        Ok(notifier) => Arc::new(notifier),
        Err(err) => {
            warn!(error = %err, "desktop notifications disabled");
            Arc::new(NullNotifier)
        }
    }
}

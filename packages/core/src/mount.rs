//! Mount, unmount and detach operations.
//!
//! This module builds argument vectors for the platform tools, manages mount
//! point directories under the mount base, and maps tool failures to
//! per-device errors carrying the tool's combined output.

use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::device::is_direct_child;
use crate::discovery::Platform;
use crate::error::{Error, IoResultExt, Result};
use crate::executor::{ExecutionContext, ToolOutput};

/// Builds `mount` arguments: `[-o opts] [-t fstype] <source> <mount point>`.
///
/// `-o` is omitted without options and `-t` without a usable type.
pub fn mount_args(
    fstype: Option<&str>,
    options: &[String],
    source: &Path,
    mount_point: &Path,
) -> Vec<String> {
    let mut args = Vec::with_capacity(6);
    if !options.is_empty() {
        args.push("-o".to_string());
        args.push(options.join(","));
    }
    if let Some(fstype) = fstype.filter(|fs| !fs.is_empty() && *fs != "auto") {
        args.push("-t".to_string());
        args.push(fstype.to_string());
    }
    args.push(source.display().to_string());
    args.push(mount_point.display().to_string());
    args
}

/// Builds `umount` arguments: `[-f] <mount point>`.
pub fn unmount_args(mount_point: &Path, force: bool) -> Vec<String> {
    let mut args = Vec::with_capacity(2);
    if force {
        args.push("-f".to_string());
    }
    args.push(mount_point.display().to_string());
    args
}

/// Creates `mount_point`, which must be a direct child of `base`.
///
/// Returns `true` if the directory was created, `false` if an empty
/// directory already existed.
pub fn create_mount_point(base: &Path, mount_point: &Path) -> Result<bool> {
    if !is_direct_child(base, mount_point) {
        return Err(Error::MountPointEscape {
            path: mount_point.to_path_buf(),
            base: base.to_path_buf(),
        });
    }

    match fs::symlink_metadata(mount_point) {
        Ok(meta) if meta.file_type().is_symlink() => Err(Error::MountPointEscape {
            path: mount_point.to_path_buf(),
            base: base.to_path_buf(),
        }),
        Ok(meta) if meta.is_dir() => {
            let mut entries = fs::read_dir(mount_point).mount_point_context(mount_point)?;
            if entries.next().is_some() {
                return Err(Error::MountPointBusy {
                    path: mount_point.to_path_buf(),
                });
            }
            Ok(false)
        }
        Ok(_) => Err(Error::MountPointBusy {
            path: mount_point.to_path_buf(),
        }),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(base).mount_point_context(base)?;
            fs::create_dir(mount_point).mount_point_context(mount_point)?;
            Ok(true)
        }
        Err(err) => Err(err).mount_point_context(mount_point),
    }
}

/// Returns true if `mount_point` is missing or an empty directory, so
/// [`create_mount_point`] will accept it.
pub fn mount_point_available(mount_point: &Path) -> bool {
    match fs::symlink_metadata(mount_point) {
        Ok(meta) if meta.is_dir() => {
            fs::read_dir(mount_point).is_ok_and(|mut entries| entries.next().is_none())
        }
        Ok(_) => false,
        Err(err) => err.kind() == io::ErrorKind::NotFound,
    }
}

/// Removes an empty mount point directory.
pub fn remove_mount_point(mount_point: &Path) -> io::Result<()> {
    fs::remove_dir(mount_point)
}

/// Mounts `source` on `mount_point`.
pub async fn mount(
    ctx: &ExecutionContext,
    source: &Path,
    fstype: Option<&str>,
    options: &[String],
    mount_point: &Path,
) -> Result<()> {
    let args = mount_args(fstype, options, source, mount_point);
    info!(device = %source.display(), mount_point = %mount_point.display(), ?fstype, "mounting");

    let output = ctx.run_privileged("mount", &args).await?;
    check(ctx, "mount", &output, |output| Error::Mount {
        device: source.to_path_buf(),
        output,
    })
}

/// Unmounts whatever is mounted at `mount_point`.
pub async fn unmount(ctx: &ExecutionContext, mount_point: &Path, force: bool) -> Result<()> {
    let args = unmount_args(mount_point, force);
    info!(mount_point = %mount_point.display(), force, "unmounting");

    let output = ctx.run_privileged("umount", &args).await?;
    check(ctx, "umount", &output, |output| Error::Unmount {
        path: mount_point.to_path_buf(),
        output,
    })
}

/// Powers down or ejects the whole disk `disk` (e.g., "da0", "sdb").
pub async fn detach(ctx: &ExecutionContext, platform: Platform, disk: &str) -> Result<()> {
    info!(disk, %platform, "detaching disk");
    let detach_error = |output| Error::Detach {
        disk: disk.to_string(),
        output,
    };

    match platform {
        Platform::FreeBsd => {
            let output = ctx.run_privileged("camcontrol", &["eject", disk]).await;
            match output {
                Ok(output) if output.success() => return Ok(()),
                Ok(output) => {
                    debug!(disk, output = %output.combined(), "camcontrol eject failed");
                }
                Err(err) => debug!(disk, error = %err, "camcontrol unavailable"),
            }

            let output = ctx
                .run_privileged("usbconfig", &["-d", disk, "power_off"])
                .await?;
            check(ctx, "usbconfig", &output, detach_error)
        }
        Platform::Linux => {
            let node = format!("/dev/{disk}");
            let output = ctx.run_privileged("eject", &[node.as_str()]).await?;
            check(ctx, "eject", &output, detach_error)
        }
    }
}

/// Maps a failed privileged invocation to the operation's error.
///
/// Dismissed authentication stays [`Error::AuthenticationCancelled`].
fn check(
    ctx: &ExecutionContext,
    command: &str,
    output: &ToolOutput,
    to_error: impl FnOnce(String) -> Error,
) -> Result<()> {
    ctx.check_privileged(command, output).map_err(|err| match err {
        Error::CommandExit { output, .. } => {
            warn!(command, output = %output, "command failed");
            to_error(output)
        }
        other => other,
    })
}

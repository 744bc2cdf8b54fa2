//! Subcommand implementations.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use automount_core::device::format_size;
use automount_core::{BatchReport, Config, Daemon, Device, MountRequest, Result};
use snafu::ResultExt;
use tracing::{info, warn};

use crate::{DaemonArgs, InfoArgs, MountArgs, UmountArgs};

pub fn write_default_config(path: Result<PathBuf>) -> Result<ExitCode> {
    let path = path?;
    Config::default().save(&path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(ExitCode::SUCCESS)
}

pub async fn daemon(mut config: Config, args: &DaemonArgs) -> Result<ExitCode> {
    if args.no_notify {
        config.notifications.enabled = false;
    }

    let mut builder = Daemon::builder(config);
    if args.no_automount {
        builder = builder.automount(false);
    }
    if let Some(secs) = args.interval {
        builder = builder.poll_interval(Duration::from_secs(secs.max(1)));
    }
    let daemon = builder.build();

    if args.mount_all {
        let report = daemon.mount_all().await?;
        print_batch("mount", &report);
    }

    daemon.start().await?;
    info!("watching for removable devices");

    wait_for_shutdown().await;
    info!("shutting down");
    daemon.stop().await;
    Ok(ExitCode::SUCCESS)
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(err) => warn!(error = %err, "could not install SIGTERM handler"),
        }
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for Ctrl-C");
    }
}

/// One-shot commands don't open a file manager.
fn one_shot(mut config: Config) -> Daemon {
    config.file_manager.clear();
    Daemon::builder(config).automount(false).build()
}

pub async fn mount(config: Config, args: &MountArgs) -> Result<ExitCode> {
    let daemon = one_shot(config);

    let code = if args.all {
        let report = daemon.mount_all().await;
        match report {
            Ok(report) => {
                print_batch("mount", &report);
                batch_exit_code(&report)
            }
            Err(err) => {
                daemon.stop().await;
                return Err(err);
            }
        }
    } else {
        let target = args.device.as_deref().unwrap_or_default();
        let request = MountRequest {
            fstype: args.fstype.clone(),
            options: args.options.as_deref().map(split_options),
        };
        let result = daemon.mount_path(target, request).await;
        match result {
            Ok(device) => {
                if let Some(mount_point) = &device.mount_point {
                    println!("Mounted {} at {}", device.path.display(), mount_point.display());
                }
                ExitCode::SUCCESS
            }
            Err(err) => {
                daemon.stop().await;
                return Err(err);
            }
        }
    };

    // Wait for hooks.
    daemon.stop().await;
    Ok(code)
}

pub async fn umount(config: Config, args: &UmountArgs) -> Result<ExitCode> {
    let daemon = one_shot(config);

    let result = if args.all {
        let report = daemon.unmount_all(args.force).await;
        print_batch("unmount", &report);
        Ok(batch_exit_code(&report))
    } else {
        unmount_one(&daemon, args).await
    };

    daemon.stop().await;
    result
}

async fn unmount_one(daemon: &Daemon, args: &UmountArgs) -> Result<ExitCode> {
    let target = args.target.as_deref().unwrap_or_default();
    let device = daemon.unmount_path(target, args.force).await?;
    println!("Unmounted {}", device.path.display());

    if args.detach {
        daemon.detach(&device.path.to_string_lossy()).await?;
        println!("Detached {}", device.path.display());
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn info(config: Config, args: &InfoArgs, verbose: bool) -> Result<ExitCode> {
    let daemon = one_shot(config);
    let devices: Vec<Device> = daemon
        .devices()
        .await?
        .into_iter()
        .filter(|d| args.all || d.is_partition)
        .collect();

    if args.json {
        let json = serde_json::to_string_pretty(&devices)
            .whatever_context::<_, automount_core::Error>("failed to encode device list")?;
        println!("{json}");
    } else if devices.is_empty() {
        println!("No removable devices found");
    } else {
        print!("{}", render_table(&devices, verbose));
    }
    Ok(ExitCode::SUCCESS)
}

fn split_options(options: &str) -> Vec<String> {
    options
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect()
}

fn batch_exit_code(report: &BatchReport) -> ExitCode {
    if report.is_complete_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_batch(verb: &str, report: &BatchReport) {
    for (path, err) in &report.failures {
        eprintln!("Failed to {verb} {}: {}", path.display(), snafu::Report::from_error(err));
    }
    if report.attempted() == 0 {
        println!("Nothing to {verb}");
    } else {
        println!("{verb}: {} of {} succeeded", report.succeeded, report.attempted());
    }
}

fn yes_no(value: bool) -> &'static str {
    if value { "Yes" } else { "No" }
}

fn render_table(devices: &[Device], verbose: bool) -> String {
    let headers: &[&str] = if verbose {
        &["DEVICE", "LABEL", "UUID", "FSTYPE", "SIZE", "MOUNTED", "MOUNT POINT", "ENCRYPTED"]
    } else {
        &["DEVICE", "LABEL", "MOUNTED", "MOUNT POINT"]
    };

    let rows: Vec<Vec<String>> = devices
        .iter()
        .map(|d| {
            let mount_point = d
                .mount_point
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            if verbose {
                vec![
                    d.path.display().to_string(),
                    d.label.clone().unwrap_or_default(),
                    d.uuid.as_deref().map(|u| u.chars().take(8).collect::<String>()).unwrap_or_default(),
                    d.fstype.clone().unwrap_or_default(),
                    format_size(d.size),
                    yes_no(d.is_mounted).to_string(),
                    mount_point,
                    yes_no(d.is_encrypted).to_string(),
                ]
            } else {
                vec![
                    d.path.display().to_string(),
                    d.label.clone().unwrap_or_else(|| d.name.clone()),
                    yes_no(d.is_mounted).to_string(),
                    mount_point,
                ]
            }
        })
        .collect();

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    push_row(&mut out, &widths, headers.iter().copied());
    for row in &rows {
        push_row(&mut out, &widths, row.iter().map(String::as_str));
    }
    out
}

fn push_row<'a>(out: &mut String, widths: &[usize], cells: impl Iterator<Item = &'a str>) {
    let line: Vec<String> = cells
        .zip(widths.iter().copied())
        .map(|(cell, width)| format!("{cell:<width$}"))
        .collect();
    out.push_str(line.join("  ").trim_end());
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn usb_stick() -> Device {
        let mut device = Device::new("da0p1", Path::new("/dev"));
        device.label = Some("USB".to_string());
        device.uuid = Some("1234abcd-5678".to_string());
        device.fstype = Some("msdosfs".to_string());
        device.size = 8 * 1024 * 1024 * 1024;
        device.is_partition = true;
        device.set_mounted("/media/USB");
        device
    }

    #[test]
    fn test_split_options() {
        assert_eq!(split_options("ro, noexec,,sync"), ["ro", "noexec", "sync"]);
        assert!(split_options("").is_empty());
    }

    #[test]
    fn test_table_columns() {
        let mut unlabeled = Device::new("da1p1", Path::new("/dev"));
        unlabeled.is_partition = true;

        let table = render_table(&[usb_stick(), unlabeled], false);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("DEVICE"));
        assert!(lines[0].ends_with("MOUNT POINT"));
        assert!(lines[1].contains("USB") && lines[1].contains("Yes") && lines[1].ends_with("/media/USB"));
        assert!(lines[2].contains("da1p1") && lines[2].trim_end().ends_with("No"));
        // Columns line up.
        assert_eq!(lines[0].find("LABEL"), lines[1].find("USB"));
    }

    #[test]
    fn test_verbose_table() {
        let table = render_table(&[usb_stick()], true);
        let row = table.lines().nth(1).unwrap();
        assert!(row.contains("1234abcd "));
        assert!(!row.contains("5678"));
        assert!(row.contains("msdosfs"));
        assert!(row.trim_end().ends_with("No"));
    }
}

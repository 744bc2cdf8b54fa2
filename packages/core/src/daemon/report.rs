//! Lifecycle reports for subscribers and desktop notifications.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;
use tracing::trace;

use crate::config::{NotificationConfig, NotificationEvent};
use crate::notify::NotificationSink;

const CHANNEL_CAPACITY: usize = 256;

/// Step of a device transition that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Unlock,
    Mount,
    Unmount,
    Detach,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unlock => "unlock",
            Self::Mount => "mount",
            Self::Unmount => "unmount",
            Self::Detach => "detach",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportKind {
    Added,
    Removed,
    Unlocked,
    Mounted { mount_point: PathBuf },
    Unmounted,
    Failed { stage: Stage, message: String },
}

impl ReportKind {
    fn notification_event(&self) -> NotificationEvent {
        match self {
            Self::Added => NotificationEvent::DeviceAdded,
            Self::Removed => NotificationEvent::DeviceRemoved,
            Self::Unlocked => NotificationEvent::DeviceUnlocked,
            Self::Mounted { .. } => NotificationEvent::DeviceMounted,
            Self::Unmounted => NotificationEvent::DeviceUnmounted,
            Self::Failed { .. } => NotificationEvent::JobFailed,
        }
    }
}

/// One device transition.
///
/// `generation` increases by one per report over the daemon's lifetime, so
/// a consumer can discard anything older than what it last rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub generation: u64,
    pub path: PathBuf,
    pub display_name: String,
    pub kind: ReportKind,
}

impl Report {
    /// Notification summary and body.
    pub fn notification_text(&self) -> (String, String) {
        let name = &self.display_name;
        match &self.kind {
            ReportKind::Added => ("Device Added".into(), format!("{name} connected")),
            ReportKind::Removed => ("Device Removed".into(), format!("{name} disconnected")),
            ReportKind::Unlocked => ("Device Unlocked".into(), format!("{name} unlocked")),
            ReportKind::Mounted { mount_point } => (
                "Device Mounted".into(),
                format!("{name} mounted at {}", mount_point.display()),
            ),
            ReportKind::Unmounted => ("Device Unmounted".into(), format!("{name} unmounted")),
            ReportKind::Failed { stage, message } => {
                let summary = match stage {
                    Stage::Unlock => "Unlock Failed",
                    Stage::Mount => "Mount Failed",
                    Stage::Unmount => "Unmount Failed",
                    Stage::Detach => "Detach Failed",
                };
                (summary.into(), format!("Failed to {stage} {name}: {message}"))
            }
        }
    }
}

/// Numbers reports, broadcasts them and forwards them as notifications.
pub(crate) struct Reporter {
    sender: broadcast::Sender<Report>,
    generation: AtomicU64,
    notifier: Arc<dyn NotificationSink>,
    notifications: NotificationConfig,
}

impl Reporter {
    pub(crate) fn new(notifier: Arc<dyn NotificationSink>, notifications: NotificationConfig) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            generation: AtomicU64::new(0),
            notifier,
            notifications,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Report> {
        self.sender.subscribe()
    }

    pub(crate) fn report(
        &self,
        path: impl Into<PathBuf>,
        display_name: impl Into<String>,
        kind: ReportKind,
    ) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let report = Report {
            generation,
            path: path.into(),
            display_name: display_name.into(),
            kind,
        };

        if let Some(timeout) = self
            .notifications
            .timeout_for(report.kind.notification_event())
        {
            let (summary, body) = report.notification_text();
            self.notifier.send(&summary, &body, Some(timeout));
        }

        trace!(generation, path = %report.path.display(), kind = ?report.kind, "report");
        // No subscribers is fine.
        let _ = self.sender.send(report);
        generation
    }
}

impl fmt::Debug for Reporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reporter")
            .field("generation", &self.generation)
            .field("notifier", &self.notifier)
            .finish_non_exhaustive()
    }
}

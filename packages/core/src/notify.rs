//! Desktop notifications through `notify-send`.

use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::executor::ExecutionContext;

/// Notification program looked up on `PATH`.
pub const NOTIFY_PROGRAM: &str = "notify-send";

const ICON: &str = "drive-removable-media";

/// Fire-and-forget notification sink.
pub trait NotificationSink: Send + Sync + std::fmt::Debug {
    /// Shows a notification; `timeout` of `None` uses the server default.
    fn send(&self, summary: &str, body: &str, timeout: Option<Duration>);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl NotificationSink for NullNotifier {
    fn send(&self, summary: &str, _body: &str, _timeout: Option<Duration>) {
        debug!(summary, "notification dropped");
    }
}

/// Handle to an available `notify-send`.
///
/// Obtained from [`Notifier::init`]; holding one proves the tool was found.
#[derive(Debug, Clone)]
pub struct Notifier {
    ctx: ExecutionContext,
    program: PathBuf,
}

impl Notifier {
    /// Looks up `notify-send` on `PATH`.
    pub fn init(ctx: ExecutionContext) -> Result<Self> {
        Self::init_with_path(ctx, env::var_os("PATH").as_deref())
    }

    fn init_with_path(ctx: ExecutionContext, path: Option<&OsStr>) -> Result<Self> {
        let program = path
            .and_then(|path| find_program(path, NOTIFY_PROGRAM))
            .ok_or_else(|| Error::NotifierUnavailable {
                program: NOTIFY_PROGRAM.to_string(),
            })?;
        debug!(program = %program.display(), "notifications enabled");
        Ok(Self { ctx, program })
    }

    /// `notify-send` arguments for one notification.
    pub fn args(summary: &str, body: &str, timeout: Option<Duration>) -> Vec<String> {
        let mut args = Vec::with_capacity(6);
        if let Some(timeout) = timeout.filter(|t| !t.is_zero()) {
            args.push("-t".to_string());
            args.push(timeout.as_millis().to_string());
        }
        args.push("-i".to_string());
        args.push(ICON.to_string());
        args.push(summary.to_string());
        args.push(body.to_string());
        args
    }
}

impl NotificationSink for Notifier {
    fn send(&self, summary: &str, body: &str, timeout: Option<Duration>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(summary, "no async runtime, notification dropped");
            return;
        };

        let ctx = self.ctx.clone();
        let program = self.program.display().to_string();
        let args = Self::args(summary, body, timeout);
        runtime.spawn(async move {
            match ctx.run(&program, &args).await {
                Ok(output) if !output.success() => {
                    debug!(output = %output.combined(), "notify-send failed")
                }
                Ok(_) => {}
                Err(err) => debug!(error = %err, "notify-send could not be started"),
            }
        });
    }
}

fn find_program(path: &OsStr, program: &str) -> Option<PathBuf> {
    env::split_paths(path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
pub(crate) mod testing {
    use parking_lot::Mutex;

    use super::*;

    /// Records every notification.
    #[derive(Debug, Default)]
    pub struct RecordingNotifier {
        sent: Mutex<Vec<(String, String, Option<Duration>)>>,
    }

    impl RecordingNotifier {
        pub fn summaries(&self) -> Vec<String> {
            self.sent.lock().iter().map(|(s, _, _)| s.clone()).collect()
        }

        pub fn sent(&self) -> Vec<(String, String, Option<Duration>)> {
            self.sent.lock().clone()
        }
    }

    impl NotificationSink for RecordingNotifier {
        fn send(&self, summary: &str, body: &str, timeout: Option<Duration>) {
            self.sent
                .lock()
                .push((summary.to_string(), body.to_string(), timeout));
        }
    }
}

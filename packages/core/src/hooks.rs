//! Event hooks: user commands run on lifecycle transitions.
//!
//! A template such as `logger -t automount "mounted {label} at {mount_point}"`
//! is split into words once, then each placeholder is replaced inside the
//! word it appears in. The program is executed directly, without a shell,
//! so a device label can never add words or shell syntax.

use std::collections::BTreeMap;
use std::fmt;

use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::error::{Error, Result};
use crate::executor::ExecutionContext;

/// Lifecycle transitions that can trigger a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookEvent {
    DeviceAdded,
    DeviceRemoved,
    DeviceMounted,
    DeviceUnmounted,
    DeviceUnlocked,
}

impl HookEvent {
    /// Key used in the `event_hooks` config map.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeviceAdded => "device_added",
            Self::DeviceRemoved => "device_removed",
            Self::DeviceMounted => "device_mounted",
            Self::DeviceUnmounted => "device_unmounted",
            Self::DeviceUnlocked => "device_unlocked",
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Splits a template into words.
///
/// Whitespace separates words. Single quotes keep their content literally;
/// inside double quotes a backslash escapes `"` and `\`; outside quotes a
/// backslash escapes any character.
pub fn split_template(template: &str) -> std::result::Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err("unterminated single quote".to_string()),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\')) => current.push(c),
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => return Err("unterminated double quote".to_string()),
                        },
                        Some(c) => current.push(c),
                        None => return Err("unterminated double quote".to_string()),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(c) => current.push(c),
                    None => return Err("trailing backslash".to_string()),
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Replaces placeholders inside one word.
fn substitute(word: &str, device: &Device) -> String {
    let mount_point = device
        .mount_point
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let path = device.path.display().to_string();

    [
        ("{device}", path.as_str()),
        ("{label}", device.label_str()),
        ("{uuid}", device.volume_id()),
        ("{mount_point}", mount_point.as_str()),
        ("{name}", device.name.as_str()),
        ("{fstype}", device.fstype.as_deref().unwrap_or("")),
    ]
    .iter()
    .fold(word.to_string(), |word, (placeholder, value)| {
        word.replace(placeholder, value)
    })
}

/// Runs configured hooks in the background.
#[derive(Debug, Clone)]
pub struct HookDispatcher {
    ctx: ExecutionContext,
    hooks: BTreeMap<String, String>,
    tracker: TaskTracker,
}

impl HookDispatcher {
    /// `tracker` lets the owner wait for running hooks on shutdown.
    pub fn new(ctx: ExecutionContext, hooks: BTreeMap<String, String>, tracker: TaskTracker) -> Self {
        Self {
            ctx,
            hooks,
            tracker,
        }
    }

    /// Program and arguments for `event`, or `None` if no hook is set.
    pub fn command_for(&self, event: HookEvent, device: &Device) -> Result<Option<Vec<String>>> {
        let Some(template) = self.hooks.get(event.as_str()) else {
            return Ok(None);
        };

        let words = split_template(template).map_err(|message| Error::HookTemplate {
            event: event.to_string(),
            message,
        })?;
        if words.is_empty() {
            return Ok(None);
        }

        Ok(Some(
            words.iter().map(|word| substitute(word, device)).collect(),
        ))
    }

    /// Starts the hook for `event` without waiting for it.
    ///
    /// Failures are logged only.
    pub fn dispatch(&self, event: HookEvent, device: &Device) -> Option<JoinHandle<()>> {
        let command = match self.command_for(event, device) {
            Ok(Some(command)) => command,
            Ok(None) => return None,
            Err(err) => {
                warn!(%event, error = %err, "skipping event hook");
                return None;
            }
        };

        info!(%event, device = %device.path.display(), program = %command[0], "running event hook");
        let ctx = self.ctx.clone();
        Some(self.tracker.spawn(async move {
            let (program, args) = command.split_at(1);
            match ctx.run(&program[0], args).await {
                Ok(output) if output.success() => debug!(%event, "event hook finished"),
                Ok(output) => warn!(
                    %event,
                    code = output.code.unwrap_or(-1),
                    output = %output.combined(),
                    "event hook failed"
                ),
                Err(err) => warn!(%event, error = %err, "event hook could not be started"),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use super::*;
    use crate::executor::ToolOutput;
    use crate::executor::testing::{ScriptedRunner, context};

    fn stick(label: &str) -> Device {
        let mut device = Device {
            label: Some(label.to_string()),
            uuid: Some("1234-ABCD".to_string()),
            fstype: Some("msdosfs".to_string()),
            is_partition: true,
            ..Device::new("da0p1", Path::new("/dev"))
        };
        device.set_mounted("/media/USB");
        device
    }

    fn dispatcher(runner: &Arc<ScriptedRunner>, event: &str, template: &str) -> HookDispatcher {
        let mut hooks = BTreeMap::new();
        hooks.insert(event.to_string(), template.to_string());
        HookDispatcher::new(context(runner), hooks, TaskTracker::new())
    }

    #[test]
    fn test_split_template() {
        assert_eq!(
            split_template(r#"logger -t 'auto mount' "at {mount_point}" a\ b"#).unwrap(),
            ["logger", "-t", "auto mount", "at {mount_point}", "a b"]
        );
        assert_eq!(split_template(r#"echo "" x"#).unwrap(), ["echo", "", "x"]);
        assert_eq!(split_template(r#"echo "say \"hi\"""#).unwrap(), ["echo", r#"say "hi""#]);
        assert!(split_template("echo 'open").is_err());
        assert!(split_template("   ").unwrap().is_empty());
    }

    #[test]
    fn test_placeholders_substituted_per_word() {
        let runner = ScriptedRunner::new();
        let hooks = dispatcher(
            &runner,
            "device_mounted",
            "notify --title=Mounted {label} {device} {uuid} {mount_point}",
        );

        let command = hooks
            .command_for(HookEvent::DeviceMounted, &stick("My Stick"))
            .unwrap()
            .unwrap();
        assert_eq!(
            command,
            [
                "notify",
                "--title=Mounted",
                "My Stick",
                "/dev/da0p1",
                "1234-ABCD",
                "/media/USB"
            ]
        );
        assert!(hooks
            .command_for(HookEvent::DeviceAdded, &stick("x"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_malicious_label_stays_one_argument() {
        let runner = ScriptedRunner::new();
        let hooks = dispatcher(&runner, "device_mounted", "logger mounted {label}");
        let label = "x; rm -rf ~ `reboot` $(id)";

        let command = hooks
            .command_for(HookEvent::DeviceMounted, &stick(label))
            .unwrap()
            .unwrap();
        assert_eq!(command, ["logger", "mounted", label]);
    }

    #[test]
    fn test_invalid_template_is_reported() {
        let runner = ScriptedRunner::new();
        let hooks = dispatcher(&runner, "device_added", "echo \"unterminated");
        assert!(matches!(
            hooks.command_for(HookEvent::DeviceAdded, &stick("x")),
            Err(Error::HookTemplate { .. })
        ));
        assert!(hooks.dispatch(HookEvent::DeviceAdded, &stick("x")).is_none());
    }

    #[tokio::test]
    async fn test_dispatch_runs_without_shell() {
        let runner = ScriptedRunner::new();
        runner.on("logger", ToolOutput::ok(""));
        let hooks = dispatcher(&runner, "device_unmounted", "logger {label} gone");

        hooks
            .dispatch(HookEvent::DeviceUnmounted, &stick("Back Up"))
            .unwrap()
            .await
            .unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, "logger");
        assert_eq!(calls[0].args, ["Back Up", "gone"]);
    }

    #[tokio::test]
    async fn test_failing_hook_is_swallowed() {
        let runner = ScriptedRunner::new();
        runner.on("false", ToolOutput::failed(1, ""));
        let tracker = TaskTracker::new();
        let mut map = BTreeMap::new();
        map.insert("device_added".to_string(), "false".to_string());
        map.insert("device_removed".to_string(), "missing-tool {device}".to_string());
        let hooks = HookDispatcher::new(context(&runner), map, tracker.clone());

        hooks.dispatch(HookEvent::DeviceAdded, &stick("x"));
        hooks.dispatch(HookEvent::DeviceRemoved, &stick("x"));
        tracker.close();
        tracker.wait().await;

        assert_eq!(runner.calls().len(), 2);
        assert_eq!(
            runner.calls_to("missing-tool")[0].args,
            [PathBuf::from("/dev/da0p1").display().to_string()]
        );
    }
}

//! Encrypted volume unlocking.
//!
//! FreeBSD volumes are attached with `geli`, which exposes `<dev>.eli`;
//! Linux volumes are opened with `cryptsetup` as
//! `/dev/mapper/automount-<name>`. A registered keyfile is used when
//! present, otherwise a passphrase is obtained and piped on stdin.

use std::fmt;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::termios::{self, LocalFlags, SetArg};
use tracing::{debug, info};

use crate::config::EncryptionConfig;
use crate::device::Device;
use crate::discovery::Platform;
use crate::error::{Error, Result};
use crate::executor::{ExecutionContext, ToolOutput};

/// Prefix of device-mapper names created by the Linux unlocker.
pub const MAPPER_PREFIX: &str = "automount-";

/// External unlock tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockTool {
    Geli,
    Cryptsetup,
}

impl UnlockTool {
    pub fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::FreeBsd => Self::Geli,
            Platform::Linux => Self::Cryptsetup,
        }
    }

    pub fn program(self) -> &'static str {
        match self {
            Self::Geli => "geli",
            Self::Cryptsetup => "cryptsetup",
        }
    }

    /// Path of the decrypted view once `device` is unlocked.
    pub fn mapped_path(self, device: &Device) -> PathBuf {
        match self {
            Self::Geli => {
                let mut path = device.path.clone().into_os_string();
                path.push(".eli");
                PathBuf::from(path)
            }
            Self::Cryptsetup => {
                PathBuf::from("/dev/mapper").join(format!("{MAPPER_PREFIX}{}", device.name))
            }
        }
    }

    /// Attach arguments. Without a keyfile the passphrase goes on stdin.
    pub fn attach_args(self, device: &Device, keyfile: Option<&Path>) -> Vec<String> {
        let device_path = device.path.display().to_string();
        let keyfile = keyfile.map(|k| k.display().to_string());

        match self {
            Self::Geli => {
                let mut args = vec!["attach".to_string()];
                match keyfile {
                    Some(keyfile) => args.extend(["-k".to_string(), keyfile]),
                    None => args.extend(["-j".to_string(), "-".to_string()]),
                }
                args.push(device_path);
                args
            }
            Self::Cryptsetup => {
                let mut args = vec!["open".to_string()];
                if let Some(keyfile) = keyfile {
                    args.push("--key-file".to_string());
                    args.push(keyfile);
                }
                args.push(device_path);
                args.push(format!("{MAPPER_PREFIX}{}", device.name));
                args
            }
        }
    }
}

/// Secret bytes, wiped on drop and never printed.
pub struct Passphrase(Vec<u8>);

impl Passphrase {
    /// Takes ownership of `bytes`, dropping one trailing line ending.
    pub fn new(mut bytes: Vec<u8>) -> Self {
        if bytes.last() == Some(&b'\n') {
            bytes.pop();
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
        }
        Self(bytes)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stdin payload for the unlock tool.
    fn to_line(&self) -> Passphrase {
        let mut line = Vec::with_capacity(self.0.len() + 1);
        line.extend_from_slice(&self.0);
        line.push(b'\n');
        Passphrase(line)
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Drop for Passphrase {
    fn drop(&mut self) {
        self.0.fill(0);
        std::hint::black_box(&self.0);
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

/// Supplies passphrases for volumes without a keyfile.
#[async_trait]
pub trait PassphraseSource: Send + Sync + fmt::Debug {
    async fn passphrase(&self, device: &Device) -> Result<Passphrase>;
}

/// Runs a configured shell command; its stdout is the passphrase.
///
/// The device path is passed as `$1`.
#[derive(Debug, Clone)]
pub struct CommandPassphrase {
    ctx: ExecutionContext,
    command: String,
}

impl CommandPassphrase {
    pub fn new(ctx: ExecutionContext, command: impl Into<String>) -> Self {
        Self {
            ctx,
            command: command.into(),
        }
    }
}

#[async_trait]
impl PassphraseSource for CommandPassphrase {
    async fn passphrase(&self, device: &Device) -> Result<Passphrase> {
        let device_path = device.path.display().to_string();
        let args = ["-c", self.command.as_str(), "automount", device_path.as_str()];
        let output = self.ctx.run("sh", &args).await?;
        passphrase_from_output(output)
    }
}

/// Moves stdout into a [`Passphrase`] without copying, so the secret is
/// wiped on every path.
fn passphrase_from_output(output: ToolOutput) -> Result<Passphrase> {
    let code = output.code;
    let passphrase = Passphrase::new(output.stdout.into_bytes());

    if code != Some(0) {
        return Err(Error::PassphraseUnavailable {
            message: format!("password command exited with code {}", code.unwrap_or(-1)),
        });
    }
    if passphrase.is_empty() {
        return Err(Error::PassphraseUnavailable {
            message: "password command printed nothing".to_string(),
        });
    }
    Ok(passphrase)
}

/// Prompts on the controlling terminal with echo disabled.
#[derive(Debug, Clone, Default)]
pub struct TerminalPassphrase {
    tty: Option<PathBuf>,
}

impl TerminalPassphrase {
    pub fn new() -> Self {
        Self::default()
    }

    fn tty(&self) -> &Path {
        self.tty.as_deref().unwrap_or(Path::new("/dev/tty"))
    }
}

#[async_trait]
impl PassphraseSource for TerminalPassphrase {
    async fn passphrase(&self, device: &Device) -> Result<Passphrase> {
        let tty = self.tty().to_path_buf();
        let prompt = format!("Enter passphrase for {}: ", device.display_name());

        let read = tokio::task::spawn_blocking(move || prompt_no_echo(&tty, &prompt))
            .await
            .map_err(|err| Error::PassphraseUnavailable {
                message: err.to_string(),
            })?;

        let passphrase = read.map_err(|err| Error::PassphraseUnavailable {
            message: err.to_string(),
        })?;
        if passphrase.is_empty() {
            return Err(Error::PassphraseUnavailable {
                message: "empty passphrase".to_string(),
            });
        }
        Ok(passphrase)
    }
}

fn prompt_no_echo(tty: &Path, prompt: &str) -> std::io::Result<Passphrase> {
    let mut terminal = OpenOptions::new().read(true).write(true).open(tty)?;
    terminal.write_all(prompt.as_bytes())?;
    terminal.flush()?;

    let original = termios::tcgetattr(&terminal)?;
    let mut silent = original.clone();
    silent.local_flags.remove(LocalFlags::ECHO);
    termios::tcsetattr(&terminal, SetArg::TCSANOW, &silent)?;

    let mut line = Vec::new();
    let read = BufReader::new(&terminal).read_until(b'\n', &mut line);

    termios::tcsetattr(&terminal, SetArg::TCSANOW, &original)?;
    terminal.write_all(b"\n")?;

    let passphrase = Passphrase::new(line);
    read?;
    Ok(passphrase)
}

/// Attaches encrypted volumes.
#[derive(Debug, Clone)]
pub struct Unlocker {
    ctx: ExecutionContext,
    tool: UnlockTool,
    config: EncryptionConfig,
    passphrases: Arc<dyn PassphraseSource>,
}

impl Unlocker {
    pub fn new(
        ctx: ExecutionContext,
        tool: UnlockTool,
        config: EncryptionConfig,
        passphrases: Arc<dyn PassphraseSource>,
    ) -> Self {
        Self {
            ctx,
            tool,
            config,
            passphrases,
        }
    }

    pub fn tool(&self) -> UnlockTool {
        self.tool
    }

    /// Unlocks `device` and returns the path of its decrypted view.
    pub async fn unlock(&self, device: &Device) -> Result<PathBuf> {
        if !self.config.enabled {
            return Err(Error::EncryptionDisabled);
        }

        let program = self.tool.program();
        let output = match self.config.keyfile_for(device.volume_id()) {
            Some(keyfile) => {
                if !tokio::fs::try_exists(keyfile).await.unwrap_or(false) {
                    return Err(Error::KeyfileMissing {
                        volume_id: device.volume_id().to_string(),
                        path: keyfile.to_path_buf(),
                    });
                }
                info!(device = %device.path.display(), keyfile = %keyfile.display(), "unlocking with keyfile");
                let args = self.tool.attach_args(device, Some(keyfile));
                self.ctx.run_privileged(program, &args).await?
            }
            None => {
                let passphrase = self.passphrases.passphrase(device).await?;
                info!(device = %device.path.display(), "unlocking with passphrase");
                let args = self.tool.attach_args(device, None);
                let line = passphrase.to_line();
                drop(passphrase);
                self.ctx
                    .run_privileged_with_stdin(program, &args, line.as_bytes())
                    .await?
            }
        };

        self.ctx
            .check_privileged(program, &output)
            .map_err(|err| match err {
                Error::CommandExit { output, .. } => Error::Unlock {
                    device: device.path.clone(),
                    output,
                },
                other => other,
            })?;

        let mapped = self.tool.mapped_path(device);
        debug!(device = %device.path.display(), mapped = %mapped.display(), "unlocked");
        Ok(mapped)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use parking_lot::Mutex;

    use super::*;

    /// Hands out a fixed passphrase, or fails when none is set.
    #[derive(Debug, Default)]
    pub struct FixedPassphrase {
        secret: Option<&'static str>,
        requests: Mutex<usize>,
    }

    impl FixedPassphrase {
        pub fn new(secret: &'static str) -> Arc<Self> {
            Arc::new(Self {
                secret: Some(secret),
                ..Self::default()
            })
        }

        pub fn unavailable() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn requests(&self) -> usize {
            *self.requests.lock()
        }
    }

    #[async_trait]
    impl PassphraseSource for FixedPassphrase {
        async fn passphrase(&self, _device: &Device) -> Result<Passphrase> {
            *self.requests.lock() += 1;
            match self.secret {
                Some(secret) => Ok(Passphrase::new(secret.as_bytes().to_vec())),
                None => Err(Error::PassphraseUnavailable {
                    message: "no terminal".to_string(),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FixedPassphrase;
    use super::*;
    use crate::executor::testing::{ScriptedRunner, context};

    fn encrypted(name: &str, uuid: &str) -> Device {
        Device {
            uuid: Some(uuid.to_string()),
            is_encrypted: true,
            is_partition: true,
            ..Device::new(name, Path::new("/dev"))
        }
    }

    fn unlocker(
        runner: &Arc<ScriptedRunner>,
        tool: UnlockTool,
        config: EncryptionConfig,
        source: Arc<dyn PassphraseSource>,
    ) -> Unlocker {
        Unlocker::new(context(runner), tool, config, source)
    }

    #[test]
    fn test_attach_args() {
        let device = encrypted("da0p1", "c0ffee");
        assert_eq!(
            UnlockTool::Geli.attach_args(&device, None),
            ["attach", "-j", "-", "/dev/da0p1"]
        );
        assert_eq!(
            UnlockTool::Geli.attach_args(&device, Some(Path::new("/root/usb.key"))),
            ["attach", "-k", "/root/usb.key", "/dev/da0p1"]
        );

        let device = encrypted("sdb1", "c0ffee");
        assert_eq!(
            UnlockTool::Cryptsetup.attach_args(&device, Some(Path::new("/root/usb.key"))),
            ["open", "--key-file", "/root/usb.key", "/dev/sdb1", "automount-sdb1"]
        );
    }

    #[test]
    fn test_mapped_paths() {
        assert_eq!(
            UnlockTool::Geli.mapped_path(&encrypted("da0p1", "x")),
            PathBuf::from("/dev/da0p1.eli")
        );
        assert_eq!(
            UnlockTool::Cryptsetup.mapped_path(&encrypted("sdb1", "x")),
            PathBuf::from("/dev/mapper/automount-sdb1")
        );
    }

    #[test]
    fn test_passphrase_is_redacted_and_trimmed() {
        let passphrase = Passphrase::new(b"hunter2\r\n".to_vec());
        assert_eq!(passphrase.as_bytes(), b"hunter2");
        assert_eq!(format!("{passphrase:?}"), "Passphrase(<redacted>)");
        assert_eq!(passphrase.to_line().as_bytes(), b"hunter2\n");
    }

    #[tokio::test]
    async fn test_passphrase_goes_to_stdin_only() {
        let runner = ScriptedRunner::new();
        runner.on("geli", ToolOutput::ok(""));
        let source = FixedPassphrase::new("hunter2");
        let unlocker = unlocker(
            &runner,
            UnlockTool::Geli,
            EncryptionConfig::default(),
            source.clone(),
        );

        let mapped = unlocker.unlock(&encrypted("da0p1", "c0ffee")).await.unwrap();
        assert_eq!(mapped, PathBuf::from("/dev/da0p1.eli"));

        let call = &runner.calls_to("geli")[0];
        assert_eq!(call.args, ["attach", "-j", "-", "/dev/da0p1"]);
        assert_eq!(call.stdin.as_deref(), Some(&b"hunter2\n"[..]));
        assert!(call.args.iter().all(|a| !a.contains("hunter2")));
        assert_eq!(source.requests(), 1);
    }

    #[tokio::test]
    async fn test_keyfile_skips_passphrase() {
        let keyfile = tempfile::NamedTempFile::new().unwrap();
        let mut config = EncryptionConfig::default();
        config
            .keyfiles
            .insert("c0ffee".to_string(), keyfile.path().to_path_buf());

        let runner = ScriptedRunner::new();
        runner.on("geli", ToolOutput::ok(""));
        let source = FixedPassphrase::new("unused");
        let unlocker = unlocker(&runner, UnlockTool::Geli, config, source.clone());

        unlocker.unlock(&encrypted("da0p1", "c0ffee")).await.unwrap();

        let call = &runner.calls_to("geli")[0];
        assert_eq!(call.args[1], "-k");
        assert_eq!(call.args[2], keyfile.path().display().to_string());
        assert_eq!(call.stdin, None);
        assert_eq!(source.requests(), 0);
    }

    #[tokio::test]
    async fn test_missing_keyfile() {
        let mut config = EncryptionConfig::default();
        config
            .keyfiles
            .insert("c0ffee".to_string(), PathBuf::from("/nonexistent/usb.key"));
        let runner = ScriptedRunner::new();
        let unlocker = unlocker(
            &runner,
            UnlockTool::Geli,
            config,
            FixedPassphrase::new("unused"),
        );

        let err = unlocker.unlock(&encrypted("da0p1", "c0ffee")).await.unwrap_err();
        assert!(matches!(err, Error::KeyfileMissing { .. }));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_passphrase() {
        let runner = ScriptedRunner::new();
        runner.on(
            "cryptsetup",
            ToolOutput::failed(2, "No key available with this passphrase."),
        );
        let unlocker = unlocker(
            &runner,
            UnlockTool::Cryptsetup,
            EncryptionConfig::default(),
            FixedPassphrase::new("wrong"),
        );

        let err = unlocker.unlock(&encrypted("sdb1", "c0ffee")).await.unwrap_err();
        match err {
            Error::Unlock { device, output } => {
                assert_eq!(device, PathBuf::from("/dev/sdb1"));
                assert!(output.contains("No key available"));
                assert!(!output.contains("wrong"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_disabled_encryption() {
        let runner = ScriptedRunner::new();
        let config = EncryptionConfig {
            enabled: false,
            ..EncryptionConfig::default()
        };
        let unlocker = unlocker(
            &runner,
            UnlockTool::Geli,
            config,
            FixedPassphrase::new("unused"),
        );

        let err = unlocker.unlock(&encrypted("da0p1", "c0ffee")).await.unwrap_err();
        assert!(matches!(err, Error::EncryptionDisabled));
    }

    #[tokio::test]
    async fn test_command_passphrase() {
        let runner = ScriptedRunner::new();
        runner.on("sh", ToolOutput::ok("s3cret\n"));
        let source = CommandPassphrase::new(context(&runner), "pass show usb/$1");

        let passphrase = source.passphrase(&encrypted("da0p1", "x")).await.unwrap();
        assert_eq!(passphrase.as_bytes(), b"s3cret");
        assert_eq!(
            runner.calls_to("sh")[0].args,
            ["-c", "pass show usb/$1", "automount", "/dev/da0p1"]
        );
    }

    #[tokio::test]
    async fn test_command_passphrase_failure() {
        let runner = ScriptedRunner::new();
        runner.on("sh", ToolOutput::failed(1, "gpg: decryption failed"));
        let source = CommandPassphrase::new(context(&runner), "pass show usb");

        let err = source.passphrase(&encrypted("da0p1", "x")).await.unwrap_err();
        assert!(matches!(err, Error::PassphraseUnavailable { .. }));
    }

    #[test]
    fn test_command_output_is_moved_not_copied() {
        let output = ToolOutput::ok("s3cret\n");
        let buffer = output.stdout.as_ptr();

        let passphrase = passphrase_from_output(output).unwrap();
        assert_eq!(passphrase.as_bytes().as_ptr(), buffer);
        assert_eq!(passphrase.as_bytes(), b"s3cret");

        let err = passphrase_from_output(ToolOutput {
            code: Some(1),
            stdout: "partial".to_string(),
            stderr: String::new(),
        })
        .unwrap_err();
        assert!(matches!(err, Error::PassphraseUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_terminal_without_tty_fails_cleanly() {
        let source = TerminalPassphrase {
            tty: Some(PathBuf::from("/nonexistent/tty")),
        };
        let err = source.passphrase(&encrypted("da0p1", "x")).await.unwrap_err();
        assert!(matches!(err, Error::PassphraseUnavailable { .. }));
    }
}

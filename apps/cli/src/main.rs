//! automount - command line front-end for the removable storage automounter.
//!
//! `automount daemon` runs the poll loop until SIGINT/SIGTERM; `mount`,
//! `umount` and `info` are one-shot commands built on the same core.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use automount_core::Config;
use clap::{Args, Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Automounter for removable storage.
#[derive(Parser)]
#[command(name = "automount", version)]
#[command(about = "Automounter for removable storage", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, env = "AUTOMOUNT_CONFIG")]
    config: Option<PathBuf>,

    /// Don't use any config file
    #[arg(long, global = true, conflicts_with = "config")]
    no_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "AUTOMOUNT_LOG_LEVEL")]
    log_level: String,

    /// Log as JSON
    #[arg(long, global = true)]
    log_json: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch for removable devices and mount them as they appear.
    Daemon(DaemonArgs),

    /// Mount a device, or all available devices.
    Mount(MountArgs),

    /// Unmount a device by path or mount point, or all mounted devices.
    Umount(UmountArgs),

    /// List removable devices.
    Info(InfoArgs),
}

#[derive(Args)]
struct DaemonArgs {
    /// Disable automounting new devices
    #[arg(long)]
    no_automount: bool,

    /// Mount all available devices before watching
    #[arg(long)]
    mount_all: bool,

    /// Seconds between device scans
    #[arg(long, value_name = "SECS")]
    interval: Option<u64>,

    /// Disable pop-up notifications
    #[arg(long)]
    no_notify: bool,

    /// Write the default configuration to the config path and exit
    #[arg(long)]
    write_default_config: bool,
}

#[derive(Args)]
struct MountArgs {
    /// Mount all available devices
    #[arg(short, long)]
    all: bool,

    /// Filesystem type
    #[arg(short = 't', value_name = "FSTYPE")]
    fstype: Option<String>,

    /// Mount options (comma-separated)
    #[arg(short = 'o', value_name = "OPTIONS")]
    options: Option<String>,

    /// Device path or name
    #[arg(required_unless_present = "all", conflicts_with = "all")]
    device: Option<String>,
}

#[derive(Args)]
struct UmountArgs {
    /// Unmount all mounted devices
    #[arg(short, long)]
    all: bool,

    /// Force unmount
    #[arg(short, long)]
    force: bool,

    /// Also detach/eject the disk after unmounting
    #[arg(long, conflicts_with = "all")]
    detach: bool,

    /// Device path, name or mount point
    #[arg(required_unless_present = "all", conflicts_with = "all")]
    target: Option<String>,
}

#[derive(Args)]
struct InfoArgs {
    /// Show whole disks too
    #[arg(short, long)]
    all: bool,

    /// Print JSON instead of a table
    #[arg(long)]
    json: bool,
}

fn init_logging(cli: &Cli, config: &Config) {
    let level = if cli.quiet || (config.quiet && !cli.verbose) {
        Level::ERROR
    } else if cli.verbose || config.verbose {
        Level::DEBUG
    } else {
        match cli.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    };

    let filter = log_filter(level, std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref());

    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

/// `RUST_LOG`, when set, wins over the level from flags and config.
fn log_filter(level: Level, rust_log: Option<&str>) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(level.into())
        .parse_lossy(rust_log.unwrap_or_default())
}

fn config_path(cli: &Cli) -> automount_core::Result<PathBuf> {
    match &cli.config {
        Some(path) => Ok(path.clone()),
        None => Config::default_path(),
    }
}

fn load_config(cli: &Cli) -> automount_core::Result<Config> {
    if cli.no_config {
        return Ok(Config::default());
    }
    match &cli.config {
        Some(path) => Config::load(path),
        // No config directory (e.g., no HOME) means no config file.
        None => match Config::default_path() {
            Ok(path) => Config::load_or_default(&path),
            Err(_) => Ok(Config::default()),
        },
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("automount: {}", snafu::Report::from_error(err));
            return ExitCode::FAILURE;
        }
    };
    init_logging(&cli, &config);

    let result = match &cli.command {
        Commands::Daemon(args) => {
            if args.write_default_config {
                commands::write_default_config(config_path(&cli))
            } else {
                commands::daemon(config, args).await
            }
        }
        Commands::Mount(args) => commands::mount(config, args).await,
        Commands::Umount(args) => commands::umount(config, args).await,
        Commands::Info(args) => commands::info(config, args, cli.verbose).await,
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            tracing::debug!(error = ?err, "command failed");
            eprintln!("automount: {}", snafu::Report::from_error(err));
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_mount_requires_device_or_all() {
        assert!(Cli::try_parse_from(["automount", "mount"]).is_err());
        assert!(Cli::try_parse_from(["automount", "mount", "-a"]).is_ok());

        let cli = Cli::try_parse_from([
            "automount", "mount", "-t", "msdosfs", "-o", "ro,noexec", "/dev/da0p1",
        ])
        .unwrap();
        let Commands::Mount(args) = cli.command else {
            panic!("expected mount");
        };
        assert_eq!(args.fstype.as_deref(), Some("msdosfs"));
        assert_eq!(args.device.as_deref(), Some("/dev/da0p1"));
    }

    #[test]
    fn test_rust_log_overrides_cli_level() {
        use tracing::level_filters::LevelFilter;

        assert_eq!(log_filter(Level::DEBUG, None).max_level_hint(), Some(LevelFilter::DEBUG));
        assert_eq!(
            log_filter(Level::DEBUG, Some("warn")).max_level_hint(),
            Some(LevelFilter::WARN)
        );
    }

    #[test]
    fn test_umount_flags() {
        let cli = Cli::try_parse_from(["automount", "-q", "umount", "-f", "--detach", "/media/USB"])
            .unwrap();
        assert!(cli.quiet);
        let Commands::Umount(args) = cli.command else {
            panic!("expected umount");
        };
        assert!(args.force && args.detach);

        assert!(Cli::try_parse_from(["automount", "umount", "-a", "--detach"]).is_err());
    }
}

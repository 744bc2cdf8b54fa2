//! automount-core: removable storage automounter.
//!
//! Discovers removable disks and partitions, mounts the ones the
//! configuration allows (unlocking encrypted volumes first), unmounts them
//! when they go away and tells hooks and desktop notifications about it.
//!
//! # Modules
//!
//! - [`device`]: Device records and mount directory naming
//! - [`discovery`]: Platform discovery backends (`geom`/`gpart`, `lsblk`)
//! - [`daemon`]: Poll-diff loop and mount/unmount orchestration
//! - [`mount`]: Mount, unmount and detach tool invocations
//! - [`unlock`]: GELI / LUKS unlocking
//! - [`hooks`]: User event hooks
//! - [`notify`]: Desktop notifications
//! - [`config`]: YAML configuration, which is also the mount policy
//! - [`executor`]: External command execution with privilege escalation
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use automount_core::{Config, Daemon};
//!
//! # async fn run() -> automount_core::Result<()> {
//! let config = Config::load_or_default(&Config::default_path()?)?;
//! let daemon = Daemon::new(config);
//!
//! daemon.start().await?;
//! tokio::signal::ctrl_c().await.ok();
//! daemon.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod daemon;
pub mod device;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod hooks;
pub mod mount;
pub mod notify;
pub mod policy;
pub mod unlock;

// Re-export commonly used types
pub use config::Config;
pub use daemon::{Daemon, MountRequest, Report, ReportKind};
pub use device::Device;
pub use discovery::{DiscoveryBackend, Platform};
pub use error::{BatchReport, Error, Result};
pub use executor::{ExecutionContext, PrivilegeEscalation};
pub use policy::MountPolicy;

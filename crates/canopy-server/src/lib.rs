//! Service front-end and management surface for canopy.
//!
//! The daemon owns the state directory (instance lock, local store
//! database, management socket), registers the configured mount points,
//! and exposes the observable state the management collaborator consumes:
//! status, pid, mount list, option sets, and graceful shutdown.

pub mod config;
pub mod daemon;
pub mod error;
pub mod management;

pub use config::{DaemonConfig, MountEntry};
pub use daemon::Daemon;
pub use error::{ServerError, ServerResult};
pub use management::{ManagementState, MountInfo, ServiceStatus};

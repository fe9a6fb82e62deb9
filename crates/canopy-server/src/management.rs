use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::info;

use canopy_types::{Hash, InodeNumber};

use crate::error::{ServerError, ServerResult};

/// Daemon lifecycle phase reported to the management collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Starting,
    Alive,
    Stopping,
}

impl ServiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Alive => "alive",
            Self::Stopping => "stopping",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(Self::Starting),
            "alive" => Some(Self::Alive),
            "stopping" => Some(Self::Stopping),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One mount point as observed by the management endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountInfo {
    pub ino: InodeNumber,
    pub path: PathBuf,
    pub source: Hash,
}

/// Observable daemon state for the management collaborator.
///
/// Exposes the current status, the process id, and the mount list, and
/// accepts per-option set requests plus graceful shutdown. Shutdown is
/// obeyed only while `honor_stop` is set.
#[derive(Debug)]
pub struct ManagementState {
    pid: u32,
    status: RwLock<ServiceStatus>,
    honor_stop: AtomicBool,
    mounts: RwLock<Vec<MountInfo>>,
    shutdown: Notify,
}

impl ManagementState {
    pub fn new() -> Self {
        Self {
            pid: std::process::id(),
            status: RwLock::new(ServiceStatus::Starting),
            honor_stop: AtomicBool::new(true),
            mounts: RwLock::new(Vec::new()),
            shutdown: Notify::new(),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn status(&self) -> ServiceStatus {
        *self.status.read().expect("lock poisoned")
    }

    pub fn set_status(&self, status: ServiceStatus) {
        *self.status.write().expect("lock poisoned") = status;
    }

    pub fn honor_stop(&self) -> bool {
        self.honor_stop.load(Ordering::Acquire)
    }

    pub fn register_mount(&self, info: MountInfo) {
        self.mounts.write().expect("lock poisoned").push(info);
    }

    pub fn mounts(&self) -> Vec<MountInfo> {
        self.mounts.read().expect("lock poisoned").clone()
    }

    /// Apply a management option. Recognized names: `honor_stop` (bool) and
    /// `status` (`starting` | `alive` | `stopping`).
    pub fn set_option(&self, name: &str, value: &str) -> ServerResult<()> {
        match name {
            "honor_stop" => {
                let parsed: bool =
                    value
                        .parse()
                        .map_err(|_| ServerError::InvalidOptionValue {
                            name: name.to_string(),
                            value: value.to_string(),
                        })?;
                self.honor_stop.store(parsed, Ordering::Release);
                Ok(())
            }
            "status" => {
                let status = ServiceStatus::parse(value).ok_or_else(|| {
                    ServerError::InvalidOptionValue {
                        name: name.to_string(),
                        value: value.to_string(),
                    }
                })?;
                self.set_status(status);
                Ok(())
            }
            _ => Err(ServerError::UnknownOption(name.to_string())),
        }
    }

    /// Graceful-shutdown request. Returns `true` when the request is
    /// obeyed; a daemon with `honor_stop` cleared ignores it.
    pub fn request_stop(&self) -> bool {
        if !self.honor_stop() {
            info!("shutdown request ignored: honor_stop is off");
            return false;
        }
        self.set_status(ServiceStatus::Stopping);
        self.shutdown.notify_waiters();
        true
    }

    /// Resolves when a shutdown request has been obeyed.
    pub async fn wait_for_shutdown(&self) {
        self.shutdown.notified().await;
    }
}

impl Default for ManagementState {
    fn default() -> Self {
        Self::new()
    }
}

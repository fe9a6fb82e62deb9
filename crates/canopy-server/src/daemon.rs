use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::sync::Arc;

use fs2::FileExt;
use tracing::{info, warn};

use canopy_store::SqliteLocalStore;
use canopy_types::InodeNumber;

use crate::config::DaemonConfig;
use crate::error::{ServerError, ServerResult};
use crate::management::{ManagementState, MountInfo, ServiceStatus};

/// The daemon's initialized state: the held instance lock, the opened local
/// store, and the management surface.
#[derive(Debug)]
pub struct Daemon {
    config: DaemonConfig,
    management: Arc<ManagementState>,
    local_store: Arc<SqliteLocalStore>,
    /// Held for the process lifetime; dropping it releases the flock.
    _lock: File,
}

impl Daemon {
    /// Perform every step that can fail at startup: state directory
    /// creation, single-instance locking, stale socket cleanup, local
    /// store opening, and mount registration.
    pub fn init(config: DaemonConfig) -> ServerResult<Self> {
        config.validate()?;
        fs::create_dir_all(&config.state_dir)?;

        let lock_path = config.lock_path();
        let mut lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        lock.try_lock_exclusive()
            .map_err(|_| ServerError::LockContention(lock_path.display().to_string()))?;
        // Record our pid for operators; failure to write is not fatal.
        if let Err(e) = writeln!(lock, "{}", std::process::id()) {
            warn!(error = %e, "could not record pid in lock file");
        }

        let socket_path = config.socket_path();
        if socket_path.exists() {
            fs::remove_file(&socket_path).map_err(|e| {
                ServerError::Config(format!(
                    "cannot remove stale socket {}: {e}",
                    socket_path.display()
                ))
            })?;
        }

        let local_store = Arc::new(SqliteLocalStore::open(&config.local_store_path())?);

        let management = Arc::new(ManagementState::new());
        for mount in &config.mounts {
            management.register_mount(MountInfo {
                ino: InodeNumber::ROOT,
                path: mount.path.clone(),
                source: mount.root_hash()?,
            });
        }

        info!(
            state_dir = %config.state_dir.display(),
            mounts = config.mounts.len(),
            "daemon initialized"
        );
        Ok(Self {
            config,
            management,
            local_store,
            _lock: lock,
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn management(&self) -> &Arc<ManagementState> {
        &self.management
    }

    pub fn local_store(&self) -> &Arc<SqliteLocalStore> {
        &self.local_store
    }

    /// Serve until a shutdown request is obeyed or an interrupt arrives.
    pub async fn run(&self) -> ServerResult<()> {
        self.management.set_status(ServiceStatus::Alive);
        info!(pid = self.management.pid(), "canopyd running");

        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    if self.management.request_stop() {
                        break;
                    }
                    // honor_stop is off; keep serving.
                }
                _ = self.management.wait_for_shutdown() => break,
            }
        }

        info!("canopyd stopping");
        Ok(())
    }
}

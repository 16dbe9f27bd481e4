use std::sync::Arc;

use tokio::select;
use tracing::{debug, info};

use crate::app_config;

mod managed_fuse {
    //! fuser only does a regular unmount when the `BackgroundSession` is dropped. `ManagedFuse`
    //! follows up with a lazy unmount so a busy mount point does not outlive the process.
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use fuser::BackgroundSession;
    use nix::errno::Errno;
    use sort_fuse::fs::SortFs;
    use sort_fuse::fs::backing::LocalBacking;
    use sort_fuse::fs::fuser::FuserAdapter;

    use super::{app_config, debug};
    use tracing::error;

    pub struct FuseCoreScope {
        _session: BackgroundSession,
    }

    impl FuseCoreScope {
        fn spawn(
            config: &app_config::Config,
            fs: Arc<SortFs<LocalBacking>>,
            handle: tokio::runtime::Handle,
        ) -> Result<Self, std::io::Error> {
            let adapter = FuserAdapter::new(fs, config.attr_ttl(), handle);
            let mut mount_opts = vec![
                fuser::MountOption::FSName("sort-fuse".to_owned()),
                fuser::MountOption::RO,
                fuser::MountOption::NoDev,
                fuser::MountOption::NoSuid,
                fuser::MountOption::DefaultPermissions,
            ];
            if config.mount.allow_other {
                mount_opts.push(fuser::MountOption::AllowOther);
                mount_opts.push(fuser::MountOption::AutoUnmount);
            }

            Ok(Self {
                _session: fuser::spawn_mount2(adapter, &config.mount_point, &mount_opts)?,
            })
        }
    }

    pub struct ManagedFuse {
        mount_point: PathBuf,
    }

    impl ManagedFuse {
        pub fn new(config: &app_config::Config) -> Self {
            Self {
                mount_point: config.mount_point.clone(),
            }
        }

        pub fn spawn(
            &self,
            config: &app_config::Config,
            fs: Arc<SortFs<LocalBacking>>,
            handle: tokio::runtime::Handle,
        ) -> Result<FuseCoreScope, std::io::Error> {
            debug!(mount_point = ?self.mount_point, "Spawning FUSE session...");
            FuseCoreScope::spawn(config, fs, handle)
        }
    }

    impl Drop for ManagedFuse {
        fn drop(&mut self) {
            const UMOUNT_ATTEMPT_COUNT: usize = 10;
            const UMOUNT_ATTEMPT_DELAY: Duration = Duration::from_millis(10);

            debug!(mount_point = ?self.mount_point, "Confirming unmount of FUSE filesystem...");

            for i in 0..UMOUNT_ATTEMPT_COUNT {
                let result = {
                    #[cfg(target_os = "macos")]
                    {
                        nix::mount::unmount(&self.mount_point, nix::mount::MntFlags::MNT_FORCE)
                    }

                    #[cfg(target_os = "linux")]
                    {
                        nix::mount::umount2(&self.mount_point, nix::mount::MntFlags::MNT_DETACH)
                    }
                };

                match result {
                    Ok(()) => {
                        debug!(attempt = i + 1, "Unmounted FUSE filesystem.");
                        break;
                    }
                    Err(Errno::EBUSY) => {
                        debug!(attempt = i + 1, "FUSE filesystem still busy, retrying...");
                        std::thread::sleep(UMOUNT_ATTEMPT_DELAY);
                    }
                    Err(Errno::EINVAL | Errno::ENOENT) => {
                        debug!(attempt = i + 1, "FUSE filesystem already unmounted.");
                        break;
                    }
                    Err(e) => {
                        error!(attempt = i + 1, error = %e, "Failed to unmount FUSE filesystem.");
                        break;
                    }
                }
            }
        }
    }
}

/// Prepares the mount point directory.
///
/// - If the directory exists and is non-empty, returns an error.
/// - If the directory does not exist, creates it (including parents) and logs an info message.
/// - If the directory exists and is empty, does nothing.
async fn prepare_mount_point(mount_point: &std::path::Path) -> Result<(), std::io::Error> {
    match tokio::fs::read_dir(mount_point).await {
        Ok(mut entries) => {
            if entries.next_entry().await?.is_some() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!(
                        "Mount point '{}' already exists and is not empty.",
                        mount_point.display()
                    ),
                ));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(mount_point).await?;
            info!(path = %mount_point.display(), "Created mount point directory.");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn wait_for_exit() -> Result<(), std::io::Error> {
    use tokio::signal;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())?;
    select! {
        _ = signal::ctrl_c() => {
            debug!("Received Ctrl+C signal, shutting down...");
        },
        _ = sigterm.recv() => {
            debug!("Received termination signal, shutting down...");
        },
        _ = sighup.recv() => {
            debug!("Received hangup signal, shutting down...");
        },
    }
    Ok(())
}

/// Main entry point for the daemon.
pub async fn run(
    config: app_config::Config,
    handle: tokio::runtime::Handle,
) -> Result<(), std::io::Error> {
    let Some(target) = config.target.clone() else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "no target directory configured",
        ));
    };

    prepare_mount_point(&config.mount_point).await?;

    let sort_config = config.sort_config();
    info!(
        target = %target.display(),
        key = %sort_config.order.key,
        direction = ?sort_config.order.direction,
        "Mounting sorted view at {}.",
        config.mount_point.display()
    );

    let fs = Arc::new(sort_fuse::fs::SortFs::new(
        sort_fuse::fs::backing::LocalBacking::new(target),
        sort_config,
    ));

    let fuse = managed_fuse::ManagedFuse::new(&config);
    {
        let _session = fuse.spawn(&config, Arc::clone(&fs), handle)?;
        info!("sort-fuse is running. Press Ctrl+C to stop.");

        wait_for_exit().await?;
    }
    debug!(
        open_handles = fs.open_handles(),
        snapshots = fs.snapshots().len(),
        "FUSE session closed."
    );
    Ok(())
}

pub fn spawn(config: app_config::Config) -> Result<(), std::io::Error> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("sort-fuse-worker")
        .build()?;
    runtime.block_on(run(config, runtime.handle().clone()))
}

//! Background hot reload of the configuration file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use super::{modified_time, ConfigError, ConfigHandle, ControllerConfig};

/// Result of a single reload poll.
#[derive(Debug)]
pub enum ReloadOutcome {
    /// The file has not been modified since the last successful load.
    Unchanged,
    /// A new snapshot was published.
    Reloaded,
    /// The file changed but could not be used; the previous snapshot stays live.
    Failed(ConfigError),
}

/// Periodically re-reads the configuration file and publishes it.
///
/// Spawns a thread on creation. The thread is stopped and joined on drop.
/// Only a file whose modification time changed is re-read, and a file that
/// fails to parse or validate leaves the live snapshot untouched.
pub struct ConfigReloader {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    reloads: Arc<AtomicUsize>,
}

impl ConfigReloader {
    /// Start polling `path` every `interval`, publishing into `config`.
    ///
    /// Changes are detected against the modification time `config` was
    /// loaded with when it came from `path`, otherwise against the file as it
    /// is now.
    pub fn spawn(path: PathBuf, config: ConfigHandle, interval: Duration) -> Self {
        let baseline = match config.source() {
            Some(source) if source == path.as_path() => config.loaded_modified(),
            _ => modified_time(&path),
        };
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let reloads = Arc::new(AtomicUsize::new(0));
        let reloads_clone = reloads.clone();

        let handle = thread::Builder::new()
            .name("config-reload".into())
            .spawn(move || {
                let mut last_modified = baseline;
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }

                    match poll_once(&path, &mut last_modified, &config) {
                        ReloadOutcome::Unchanged => {}
                        ReloadOutcome::Reloaded => {
                            reloads_clone.fetch_add(1, Ordering::Relaxed);
                            info!("Reloaded configuration from {}", path.display());
                        }
                        ReloadOutcome::Failed(e) => {
                            warn!(
                                "Ignoring configuration change in {}: {e}",
                                path.display()
                            );
                        }
                    }
                }
                debug!("Config reloader for {} stopped", path.display());
            })
            .ok();

        if handle.is_none() {
            warn!("Failed to spawn config reload thread; hot reload disabled");
        }

        Self {
            stop: Some(stop_tx),
            handle,
            reloads,
        }
    }

    /// Number of snapshots published since the reloader started.
    pub fn reload_count(&self) -> usize {
        self.reloads.load(Ordering::Relaxed)
    }
}

impl Drop for ConfigReloader {
    fn drop(&mut self) {
        // Dropping the sender disconnects the channel and wakes the thread
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Check the file once and publish it if it changed.
///
/// A half-written file is retried on the next poll once its mtime moves
/// again. A file that stays missing is only reported once.
pub(crate) fn poll_once(
    path: &Path,
    last_modified: &mut Option<SystemTime>,
    config: &ConfigHandle,
) -> ReloadOutcome {
    let modified = modified_time(path);
    if modified == *last_modified {
        return ReloadOutcome::Unchanged;
    }
    *last_modified = modified;

    match ControllerConfig::load(path).and_then(|c| config.replace(c)) {
        Ok(()) => ReloadOutcome::Reloaded,
        Err(e) => ReloadOutcome::Failed(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Instant;

    fn write_config(path: &Path, config: &ControllerConfig, mtime: SystemTime) {
        config.save(path).unwrap();
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();
    }

    #[test]
    fn test_poll_once_detects_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);

        let config = ControllerConfig::default();
        write_config(&path, &config, t0);
        let handle = ConfigHandle::from_file(&path).unwrap();
        let mut last = modified_time(&path);

        assert!(matches!(
            poll_once(&path, &mut last, &handle),
            ReloadOutcome::Unchanged
        ));

        let mut updated = config.clone();
        updated.thrust.kp = 0.08;
        write_config(&path, &updated, t0 + Duration::from_secs(1));

        assert!(matches!(
            poll_once(&path, &mut last, &handle),
            ReloadOutcome::Reloaded
        ));
        assert_eq!(handle.snapshot().thrust.kp, 0.08);
    }

    #[test]
    fn test_poll_once_keeps_previous_on_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);

        write_config(&path, &ControllerConfig::default(), t0);
        let handle = ConfigHandle::from_file(&path).unwrap();
        let mut last = modified_time(&path);

        std::fs::write(&path, "{ not json").unwrap();
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(t0 + Duration::from_secs(5))
            .unwrap();

        assert!(matches!(
            poll_once(&path, &mut last, &handle),
            ReloadOutcome::Failed(ConfigError::Parse(_))
        ));
        assert_eq!(*handle.snapshot(), ControllerConfig::default());
    }

    #[test]
    fn test_reloader_thread_publishes_update() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);

        write_config(&path, &ControllerConfig::default(), t0);
        let handle = ConfigHandle::from_file(&path).unwrap();
        let reloader =
            ConfigReloader::spawn(path.clone(), handle.clone(), Duration::from_millis(5));

        let mut updated = ControllerConfig::default();
        updated.waypoint_margin = 0.3;
        write_config(&path, &updated, t0 + Duration::from_secs(10));

        let start = Instant::now();
        while handle.snapshot().waypoint_margin != 0.3 && start.elapsed() < Duration::from_secs(2)
        {
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(handle.snapshot().waypoint_margin, 0.3);
        assert!(reloader.reload_count() >= 1);
    }

    #[test]
    fn test_edit_between_load_and_spawn_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);

        write_config(&path, &ControllerConfig::default(), t0);
        let handle = ConfigHandle::from_file(&path).unwrap();

        // Lands before the reload thread has taken a look at the file
        let mut updated = ControllerConfig::default();
        updated.waypoint_margin = 0.3;
        write_config(&path, &updated, t0 + Duration::from_secs(10));

        let reloader =
            ConfigReloader::spawn(path.clone(), handle.clone(), Duration::from_millis(5));
        let start = Instant::now();
        while handle.snapshot().waypoint_margin != 0.3 && start.elapsed() < Duration::from_secs(2)
        {
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(handle.snapshot().waypoint_margin, 0.3);
        assert_eq!(reloader.reload_count(), 1);
    }

    #[test]
    fn test_missing_file_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);

        write_config(&path, &ControllerConfig::default(), t0);
        let handle = ConfigHandle::from_file(&path).unwrap();
        let mut last = handle.loaded_modified();
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(
            poll_once(&path, &mut last, &handle),
            ReloadOutcome::Failed(ConfigError::Io(_))
        ));
        for _ in 0..3 {
            assert!(matches!(
                poll_once(&path, &mut last, &handle),
                ReloadOutcome::Unchanged
            ));
        }

        // Coming back counts as a change
        write_config(&path, &ControllerConfig::default(), t0);
        assert!(matches!(
            poll_once(&path, &mut last, &handle),
            ReloadOutcome::Reloaded
        ));
    }
}

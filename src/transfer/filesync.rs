use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};

use crate::limiter::SpeedLimiter;
use crate::progress::{Progress, ProgressTracker};
use crate::transfer::adapters::Transport;
use crate::transfer::segment::plan;
use crate::transfer::streamer::Streamer;
use crate::transfer::{TransferError, TransferRequest};
use crate::util::{ensure_parent_dir, free_disk_space, timestamp_name};

/// Coordinator for one file: probes the remote, plans segments, spawns one
/// worker per segment and aggregates their state. Its tracker and limiter
/// are children of the owning session's, so per-file activity rolls up
/// into the fleet-wide view automatically.
pub struct FileSync<T: Transport> {
    transport: Arc<T>,
    remote: String,
    local_path: Mutex<PathBuf>,
    parts: u32,
    timeout: Duration,
    keep_remote_name: bool,
    #[allow(dead_code)]
    restart: bool,

    streamers: Mutex<Vec<Arc<Streamer<T>>>>,
    tracker: Arc<ProgressTracker>,
    limiter: Arc<SpeedLimiter>,
    error: Mutex<Option<TransferError>>,
}

impl<T: Transport> FileSync<T> {
    pub fn new(
        transport: Arc<T>,
        request: &TransferRequest,
        parent_tracker: Option<Arc<ProgressTracker>>,
        parent_limiter: Option<Arc<SpeedLimiter>>,
    ) -> Self {
        let tracker = Arc::new(ProgressTracker::with(
            0,
            crate::progress::DEFAULT_WINDOW,
            parent_tracker,
        ));
        let limiter = Arc::new(SpeedLimiter::with(request.speed_limit, parent_limiter));

        Self {
            transport,
            remote: request.url.to_string(),
            local_path: Mutex::new(request.path.clone()),
            parts: request.parts,
            timeout: request.timeout,
            keep_remote_name: request.keep_remote_name,
            restart: request.restart,
            streamers: Mutex::new(Vec::new()),
            tracker,
            limiter,
            error: Mutex::new(None),
        }
    }

    /// Idempotent: a no-op while any worker is alive, otherwise plans and
    /// launches the transfer. Planning failures are recorded rather than
    /// raised, so the owning session can classify this file and move on.
    pub async fn run(&self) {
        if self.is_alive() {
            return;
        }
        if let Err(err) = self.spawn_workers().await {
            warn!("{}: cannot start transfer: {err}", self.remote);
            *self.error.lock().expect("error lock poisoned") = Some(err);
        }
    }

    async fn spawn_workers(&self) -> Result<(), TransferError> {
        self.reset().await;

        let probe = self.transport.probe().await?;
        let remote_size = probe.size.unwrap_or(0);
        // Without an authoritative length there is nothing to split
        let parts = if remote_size == 0 { 1 } else { self.parts };

        let path = self.resolve_destination(probe.filename.as_deref());
        let file = prepare_output_file(&path, remote_size.max(1))?;
        *self.local_path.lock().expect("path lock poisoned") = path.clone();

        debug!(
            "{} -> {:?}: {} bytes in {} part(s)",
            self.remote, path, remote_size, parts
        );

        self.tracker.grow(remote_size);

        let file = Arc::new(file);
        let streamers = {
            let mut streamers = self.streamers.lock().expect("streamer lock poisoned");
            for segment in plan(remote_size, parts) {
                streamers.push(Arc::new(Streamer::new(
                    Arc::clone(&self.transport),
                    Arc::clone(&file),
                    segment,
                    Arc::clone(&self.tracker),
                    Arc::clone(&self.limiter),
                    self.timeout,
                )));
            }
            streamers.clone()
        };

        for worker in &streamers {
            Arc::clone(worker).start();
        }
        Ok(())
    }

    /// Picks the final destination: directories gain a generated timestamp
    /// name, and a server-suggested name wins when `keep_remote_name` is
    /// set.
    fn resolve_destination(&self, remote_name: Option<&str>) -> PathBuf {
        let mut path = self.local_path.lock().expect("path lock poisoned").clone();
        if path.is_dir() {
            path = path.join(timestamp_name());
        }

        let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let local_name = path.file_name().map(OsString::from);
        let name = if self.keep_remote_name {
            remote_name.map(OsString::from).or(local_name)
        } else {
            local_name
        };

        parent.join(name.unwrap_or_else(|| OsString::from(timestamp_name())))
    }

    async fn reset(&self) {
        self.streamers.lock().expect("streamer lock poisoned").clear();
        // Undo any previous planning so a replanned transfer does not
        // inflate this tracker chain's target size
        let prior = self.tracker.size();
        if prior > 0 {
            self.tracker.shrink(prior);
        }
        self.tracker.clear();
        self.limiter.reset().await;
        *self.error.lock().expect("error lock poisoned") = None;
    }

    pub fn is_alive(&self) -> bool {
        self.streamers
            .lock()
            .expect("streamer lock poisoned")
            .iter()
            .any(|worker| worker.is_alive())
    }

    pub fn success(&self) -> bool {
        if self.error.lock().expect("error lock poisoned").is_some() {
            return false;
        }
        let streamers = self.streamers.lock().expect("streamer lock poisoned");
        !streamers.is_empty() && streamers.iter().all(|worker| worker.is_done())
    }

    pub fn stop(&self) {
        for worker in self.streamers.lock().expect("streamer lock poisoned").iter() {
            worker.stop();
        }
    }

    pub fn pause(&self) {
        for worker in self.streamers.lock().expect("streamer lock poisoned").iter() {
            worker.pause();
        }
    }

    pub fn resume(&self) {
        for worker in self.streamers.lock().expect("streamer lock poisoned").iter() {
            worker.resume();
        }
    }

    pub fn get_progress(&self) -> Progress {
        self.tracker.get_progress()
    }

    pub async fn set_speed_limit(&self, bytes_per_second: u64) {
        self.limiter.set_limit(bytes_per_second).await;
    }

    pub fn done(&self) -> bool {
        self.tracker.done()
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn local_path(&self) -> PathBuf {
        self.local_path.lock().expect("path lock poisoned").clone()
    }

    pub fn error_message(&self) -> Option<String> {
        self.error
            .lock()
            .expect("error lock poisoned")
            .as_ref()
            .map(|err| err.to_string())
    }
}

/// Opens the destination and reserves `size` bytes as a sparse file, after
/// checking that the filesystem can actually hold it.
fn prepare_output_file(path: &Path, size: u64) -> Result<File, TransferError> {
    ensure_parent_dir(path)?;

    if let Some(available) = free_disk_space(path) {
        if size >= available {
            return Err(TransferError::InsufficientSpace {
                required: size,
                available,
            });
        }
    }

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .read(true)
        .open(path)?;
    preallocate(&file, size)?;
    Ok(file)
}

#[cfg(target_os = "linux")]
fn preallocate(file: &File, size: u64) -> Result<(), TransferError> {
    use nix::errno::Errno;
    use nix::fcntl::{fallocate, FallocateFlags};
    use std::os::unix::io::AsRawFd;

    if size > 0 {
        if let Err(err) = fallocate(
            file.as_raw_fd(),
            FallocateFlags::FALLOC_FL_KEEP_SIZE,
            0,
            size as i64,
        ) {
            // Not every filesystem supports reservation; the sparse
            // set_len below still produces the right shape
            if err != Errno::ENOTSUP && err != Errno::EINVAL {
                return Err(TransferError::Io(io::Error::from_raw_os_error(err as i32)));
            }
        }
    }
    file.set_len(size)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn preallocate(file: &File, size: u64) -> Result<(), TransferError> {
    file.set_len(size)?;
    Ok(())
}

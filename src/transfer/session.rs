use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{info, warn};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::limiter::SpeedLimiter;
use crate::progress::{Progress, ProgressTracker};
use crate::transfer::adapters::Transport;
use crate::transfer::filesync::FileSync;
use crate::util::STATE_CHECK;

struct Queues<T: Transport> {
    unfinished: VecDeque<Arc<FileSync<T>>>,
    workers: VecDeque<Arc<FileSync<T>>>,
    finished: Vec<Arc<FileSync<T>>>,
    errors: Vec<Arc<FileSync<T>>>,
}

/// Top-level scheduler bounding the number of files in flight. Transfers
/// are admitted from the waiting queue in FIFO order; finished and failed
/// ones are moved to their terminal lists as the rotation reaps them.
///
/// The session's tracker and limiter are the roots of their hierarchies:
/// every enqueued file hangs its own pair off them.
pub struct Session<T: Transport> {
    concurrent: usize,
    tracker: Arc<ProgressTracker>,
    limiter: Arc<SpeedLimiter>,
    running: AtomicBool,
    paused: AtomicBool,
    queues: Mutex<Queues<T>>,
}

impl<T: Transport> Session<T> {
    pub fn new(concurrent: usize, speed_limit: Option<u64>) -> Self {
        Self {
            concurrent: concurrent.max(1),
            tracker: Arc::new(ProgressTracker::new()),
            limiter: Arc::new(SpeedLimiter::new(speed_limit)),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            queues: Mutex::new(Queues {
                unfinished: VecDeque::new(),
                workers: VecDeque::new(),
                finished: Vec::new(),
                errors: Vec::new(),
            }),
        }
    }

    pub fn tracker(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn limiter(&self) -> Arc<SpeedLimiter> {
        Arc::clone(&self.limiter)
    }

    /// Adds a transfer to the waiting queue. It starts once the rotation
    /// has room.
    pub fn enqueue(&self, sync: Arc<FileSync<T>>) {
        self.lock_queues().unfinished.push_back(sync);
    }

    /// Launches the scheduler loop. Returns `None` when it is already
    /// running. In forever mode the loop keeps polling after the queues
    /// drain, waiting for more work.
    pub fn run(self: Arc<Self>, forever: bool) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(tokio::spawn(self.scheduler(forever)))
    }

    async fn scheduler(self: Arc<Self>, forever: bool) {
        loop {
            sleep(STATE_CHECK).await;

            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if self.paused.load(Ordering::SeqCst) {
                continue;
            }

            let (kick, drained) = {
                let mut queues = self.lock_queues();

                // One full pass over the rotation: settle finished workers,
                // keep live ones moving to the back
                for _ in 0..queues.workers.len() {
                    let settled = queues
                        .workers
                        .front()
                        .map(|worker| !worker.is_alive())
                        .unwrap_or(false);
                    if !settled {
                        queues.workers.rotate_left(1);
                        continue;
                    }
                    let worker = queues.workers.pop_front().expect("rotation underflow");
                    if worker.success() {
                        info!("{} saved to {:?}", worker.remote(), worker.local_path());
                        queues.finished.push(worker);
                    } else {
                        warn!(
                            "{} failed{}",
                            worker.remote(),
                            worker
                                .error_message()
                                .map(|msg| format!(": {msg}"))
                                .unwrap_or_default()
                        );
                        queues.errors.push(worker);
                    }
                }

                // Admit waiting transfers in arrival order
                while queues.workers.len() < self.concurrent {
                    match queues.unfinished.pop_front() {
                        Some(worker) => queues.workers.push_back(worker),
                        None => break,
                    }
                }

                let kick: Vec<_> = queues
                    .workers
                    .iter()
                    .filter(|worker| !worker.is_alive())
                    .cloned()
                    .collect();
                let drained = queues.unfinished.is_empty() && queues.workers.is_empty();
                (kick, drained)
            };

            for worker in kick {
                worker.run().await;
            }

            if !forever && drained {
                break;
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }

    /// Stops the scheduler and every active worker; both observe the flag
    /// at their next poll.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for worker in self.lock_queues().workers.iter() {
            worker.stop();
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether the waiting queue is empty.
    pub fn done(&self) -> bool {
        self.lock_queues().unfinished.is_empty()
    }

    pub fn get_progress(&self) -> Progress {
        self.tracker.get_progress()
    }

    pub fn finished(&self) -> Vec<Arc<FileSync<T>>> {
        self.lock_queues().finished.clone()
    }

    pub fn errors(&self) -> Vec<Arc<FileSync<T>>> {
        self.lock_queues().errors.clone()
    }

    fn lock_queues(&self) -> std::sync::MutexGuard<'_, Queues<T>> {
        self.queues.lock().expect("queue lock poisoned")
    }
}

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

use crate::util::{format_bytes, seconds_to_eta_string};

/// Sliding window used for throughput estimation, in seconds.
pub const DEFAULT_WINDOW: u32 = 10;

const PROGRESS_TICK: Duration = Duration::from_millis(100);

/// Monotonic byte counter owned by a single worker. It records the last
/// tracker total the worker observed, so the worker's stall gate can tell
/// "no progress anywhere" apart from "my connection is slow".
#[derive(Debug, Default)]
pub struct Counter {
    total: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// A windowed progress measurement, as returned by
/// [`ProgressTracker::get_progress`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub bps: f64,
    pub eta: f64,
    pub total: u64,
    pub size: u64,
}

struct TrackerState {
    size: u64,
    total: u64,
    window: u32,
    finished: bool,
    // millisecond offset from `origin` -> bytes credited at that instant;
    // sorted keys double as the ordered timestamp sequence
    samples: BTreeMap<u64, u64>,
}

/// Hierarchical sliding-window progress accountant.
///
/// Every credit is forwarded to the optional parent before the local lock
/// is taken, so no two tracker locks are ever held at once and a session's
/// root tracker always aggregates the whole fleet.
pub struct ProgressTracker {
    parent: Option<Arc<ProgressTracker>>,
    origin: Instant,
    state: Mutex<TrackerState>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::with(0, DEFAULT_WINDOW, None)
    }

    pub fn with_parent(parent: Arc<ProgressTracker>) -> Self {
        Self::with(0, DEFAULT_WINDOW, Some(parent))
    }

    pub fn with(size: u64, window: u32, parent: Option<Arc<ProgressTracker>>) -> Self {
        Self {
            parent,
            origin: Instant::now(),
            state: Mutex::new(TrackerState {
                size,
                total: 0,
                window: window.max(1),
                finished: false,
                samples: BTreeMap::new(),
            }),
        }
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().expect("tracker lock poisoned")
    }

    /// Credits `units` bytes at the current instant. Credits landing on the
    /// same millisecond coalesce into one sample.
    pub fn add(&self, units: u64) {
        if let Some(parent) = &self.parent {
            parent.add(units);
        }
        let now = self.now_ms();
        let mut state = self.lock();
        *state.samples.entry(now).or_insert(0) += units;
        state.total += units;
    }

    /// Takes back previously credited bytes whose content turned out not to
    /// be the requested range. The rate samples are left alone; only the
    /// completion total moves.
    pub fn remove(&self, units: u64) {
        if let Some(parent) = &self.parent {
            parent.remove(units);
        }
        let mut state = self.lock();
        state.total = state.total.saturating_sub(units);
    }

    pub fn grow(&self, size: u64) {
        if let Some(parent) = &self.parent {
            parent.grow(size);
        }
        let mut state = self.lock();
        state.size += size;
    }

    pub fn shrink(&self, size: u64) {
        if let Some(parent) = &self.parent {
            parent.shrink(size);
        }
        let mut state = self.lock();
        state.size = state.size.saturating_sub(size);
    }

    /// Current `(bytes/s, eta, total, size)`. Samples older than the window
    /// are purged lazily here. The rate divides by the fixed window rather
    /// than the observed span, which damps bursts into stable numbers.
    pub fn get_progress(&self) -> Progress {
        let now = self.now_ms();
        let mut state = self.lock();

        let cutoff = now.saturating_sub(state.window as u64 * 1000);
        let recent = state.samples.split_off(&cutoff);
        state.samples = recent;

        if state.samples.is_empty() {
            return Progress {
                bps: 0.0,
                eta: 0.0,
                total: state.total,
                size: state.size,
            };
        }

        let windowed: u64 = state.samples.values().sum();
        let bps = windowed as f64 / state.window as f64;
        let eta = if state.size == 0 || bps <= 0.0 {
            0.0
        } else {
            state.size.saturating_sub(state.total) as f64 / bps
        };

        Progress {
            bps,
            eta,
            total: state.total,
            size: state.size,
        }
    }

    pub fn total(&self) -> u64 {
        self.lock().total
    }

    pub fn size(&self) -> u64 {
        self.lock().size
    }

    pub fn window(&self) -> u32 {
        self.lock().window
    }

    pub fn set_window(&self, window: u32) {
        self.lock().window = window.max(1);
    }

    pub fn finish(&self) {
        self.lock().finished = true;
    }

    pub fn done(&self) -> bool {
        let state = self.lock();
        state.finished || (state.size > 0 && state.total >= state.size)
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.total = 0;
        state.finished = false;
        state.samples.clear();
    }

    #[cfg(test)]
    fn sample_count(&self) -> usize {
        self.lock().samples.len()
    }

    #[cfg(test)]
    fn sample_sum(&self) -> u64 {
        self.lock().samples.values().sum()
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    Quiet,
    Text,
    Json,
}

#[derive(Debug, Clone, Copy)]
pub enum ProgressFinish {
    Success,
    Failure,
}

/// Background task rendering a tracker's aggregate view, either as an
/// interactive bar or as newline-delimited JSON events.
pub struct ProgressReporter {
    stop_tx: Option<oneshot::Sender<ProgressFinish>>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    pub fn spawn(mode: ProgressMode, tracker: Arc<ProgressTracker>) -> Option<Self> {
        match mode {
            ProgressMode::Quiet => None,
            ProgressMode::Text => Some(Self::spawn_text(tracker)),
            ProgressMode::Json => Some(Self::spawn_json(tracker)),
        }
    }

    pub async fn finish(mut self, finish: ProgressFinish) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(finish);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    fn spawn_text(tracker: Arc<ProgressTracker>) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(PROGRESS_TICK);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let bar = ProgressBar::new(0);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template(
                        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
                    )
                    .expect("progress template")
                    .progress_chars("#>-"),
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        render_bar(&bar, &tracker, None);
                    }
                    result = &mut stop_rx => {
                        let finish = result.unwrap_or(ProgressFinish::Failure);
                        render_bar(&bar, &tracker, Some(finish));
                        break;
                    }
                }
            }
        });

        Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    fn spawn_json(tracker: Arc<ProgressTracker>) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(PROGRESS_TICK);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        emit_json_event(&tracker, None);
                    }
                    result = &mut stop_rx => {
                        let finish = result.unwrap_or(ProgressFinish::Failure);
                        emit_json_event(&tracker, Some(finish));
                        break;
                    }
                }
            }
        });

        Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn render_bar(bar: &ProgressBar, tracker: &ProgressTracker, finish: Option<ProgressFinish>) {
    let progress = tracker.get_progress();
    if progress.size > 0 && bar.length() != Some(progress.size) {
        bar.set_length(progress.size);
    }
    bar.set_position(progress.total);
    bar.set_message(format!(
        "({}/s, {})",
        format_bytes(progress.bps as u64),
        seconds_to_eta_string(progress.eta)
    ));

    match finish {
        Some(ProgressFinish::Success) => {
            bar.finish_with_message("Transfer complete".green().to_string());
        }
        Some(ProgressFinish::Failure) => {
            bar.finish_with_message("Transfer failed".red().to_string());
        }
        None => {}
    }
}

#[derive(Serialize)]
struct JsonProgressEvent {
    event: &'static str,
    timestamp_ms: u128,
    bytes_transferred: u64,
    total_bytes: u64,
    fraction: Option<f64>,
    bytes_per_second: f64,
    eta_seconds: f64,
}

fn emit_json_event(tracker: &ProgressTracker, finish: Option<ProgressFinish>) {
    let progress = tracker.get_progress();
    let event = match finish {
        None => "progress",
        Some(ProgressFinish::Success) => "complete",
        Some(ProgressFinish::Failure) => "failed",
    };
    let fraction = (progress.size > 0).then(|| progress.total as f64 / progress.size as f64);

    let payload = JsonProgressEvent {
        event,
        timestamp_ms: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis(),
        bytes_transferred: progress.total,
        total_bytes: progress.size,
        fraction,
        bytes_per_second: progress.bps,
        eta_seconds: progress.eta,
    };

    if let Ok(serialized) = serde_json::to_string(&payload) {
        println!("{serialized}");
        let _ = std::io::stdout().flush();
    }
}

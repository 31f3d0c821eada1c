use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use tokio::time::{sleep, Instant};

use crate::limiter::SpeedLimiter;
use crate::progress::{Counter, ProgressTracker};
use crate::transfer::adapters::{ByteRange, FileWriter, RangedReader, Transport};
use crate::transfer::segment::Segment;
use crate::util::STATE_CHECK;

/// Worker that pumps the bytes of one segment from a transport into the
/// shared local file, reconnecting and narrowing its range until the
/// segment is exhausted or progress stops everywhere.
///
/// The worker never raises out of its task: every failure is classified
/// into its observable state (`is_done`, `is_alive`, `is_connected`).
pub struct Streamer<T: Transport> {
    transport: Arc<T>,
    file: Arc<File>,
    segment: Mutex<Segment>,
    tracker: Arc<ProgressTracker>,
    limiter: Arc<SpeedLimiter>,
    counter: Counter,
    timeout: Duration,

    // Control variables
    running: AtomicBool,
    paused: AtomicBool,

    // Uncontrolled state
    alive: AtomicBool,
    done: AtomicBool,
    connected: AtomicBool,
}

impl<T: Transport> Streamer<T> {
    pub fn new(
        transport: Arc<T>,
        file: Arc<File>,
        segment: Segment,
        tracker: Arc<ProgressTracker>,
        limiter: Arc<SpeedLimiter>,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            file,
            segment: Mutex::new(segment),
            tracker,
            limiter,
            counter: Counter::new(),
            timeout,
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            alive: AtomicBool::new(false),
            done: AtomicBool::new(false),
            connected: AtomicBool::new(true),
        }
    }

    /// Spawns the worker task unless it is already running or finished.
    pub fn start(self: Arc<Self>) {
        if !self.is_alive() && !self.is_done() {
            self.alive.store(true, Ordering::SeqCst);
            tokio::spawn(self.run());
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn segment(&self) -> Segment {
        self.segment.lock().expect("segment lock poisoned").clone()
    }

    async fn run(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);

        loop {
            // Connection attempt: rebuild reader and writer from the
            // segment's current shape so a reconnect resumes mid-range.
            let (range, offset, size) = {
                let segment = self.segment.lock().expect("segment lock poisoned");
                let range = if segment.end == 0 {
                    None
                } else {
                    Some(ByteRange {
                        start: segment.start,
                        end: segment.end,
                    })
                };
                (range, segment.start, segment.size)
            };

            let mut attempt = match self.transport.open(range).await {
                Ok(reader) => {
                    self.connected.store(true, Ordering::SeqCst);
                    Some((reader, FileWriter::new(Arc::clone(&self.file), offset)))
                }
                Err(err) => {
                    debug!("connection attempt failed: {err}");
                    self.connected.store(false, Ordering::SeqCst);
                    None
                }
            };

            let mut bytes_consumed = 0u64;
            let attempt_started = Instant::now();

            if let Some((reader, writer)) = attempt.as_mut() {
                loop {
                    // State controlled by the owning coordinator
                    if !self.running.load(Ordering::SeqCst) {
                        self.finish();
                        return;
                    }
                    if self.paused.load(Ordering::SeqCst) {
                        sleep(STATE_CHECK).await;
                        continue;
                    }

                    // With a cap configured this blocks until the limiter
                    // is ready to serve more bytes.
                    let request = self.limiter.get().await as usize;

                    let chunk = match reader.read(request).await {
                        Ok(chunk) => chunk,
                        Err(err) => {
                            debug!("read failed after {bytes_consumed} bytes: {err}");
                            self.connected.store(false, Ordering::SeqCst);
                            break;
                        }
                    };

                    if chunk.is_empty() {
                        // End of this attempt's stream. A link that was
                        // already down stays down.
                        if !self.connected.load(Ordering::SeqCst) {
                            break;
                        }
                        self.connected.store(true, Ordering::SeqCst);
                        break;
                    }

                    let length = chunk.len() as u64;

                    // The peer may disregard the range header and send the
                    // whole resource; keep only the bytes this segment owns.
                    if size > 0 && bytes_consumed + length > size {
                        let keep = (size - bytes_consumed) as usize;
                        if writer.write(&chunk[..keep]).is_err() {
                            self.connected.store(false, Ordering::SeqCst);
                            break;
                        }
                        self.tracker.add(keep as u64);
                        bytes_consumed += keep as u64;
                        break;
                    }

                    if writer.write(&chunk).is_err() {
                        self.connected.store(false, Ordering::SeqCst);
                        break;
                    }
                    self.tracker.add(length);
                    bytes_consumed += length;
                }
            }
            drop(attempt);

            if size > 0 {
                if bytes_consumed == size {
                    let mut segment = self.segment.lock().expect("segment lock poisoned");
                    segment.size -= bytes_consumed;
                    drop(segment);
                    self.done.store(true, Ordering::SeqCst);
                    break;
                }

                if !self.connected.load(Ordering::SeqCst) {
                    // Connection was lost mid-range. Bank the progress so
                    // the next attempt requests only the suffix.
                    let mut segment = self.segment.lock().expect("segment lock poisoned");
                    segment.start += bytes_consumed;
                    segment.size -= bytes_consumed;
                } else {
                    // Connected but short: the server answered with
                    // something other than the requested range (redirect
                    // body, empty response). Whatever was read is suspect;
                    // uncredit it and retry from the original offset.
                    self.tracker.remove(bytes_consumed);
                }
            } else if self.connected.load(Ordering::SeqCst) {
                // No reference size; a clean end-of-stream is completion.
                self.done.store(true, Ordering::SeqCst);
                break;
            }

            // Stall gate: as long as the tracker moved anywhere in the
            // file since our last look, keep retrying immediately. Peer
            // segments making progress buy a struggling one more time.
            if self.tracker.total() > self.counter.get() {
                self.counter.set(self.tracker.total());
                continue;
            }
            if self.timeout.is_zero() || attempt_started.elapsed() < self.timeout {
                continue;
            }
            warn!(
                "segment at offset {} stalled for {:?}; giving up",
                offset, self.timeout
            );
            break;
        }

        self.finish();
    }

    fn finish(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::testing::{payload, scratch_file, wait_for, MockTransport, Script};
    use std::time::Duration;

    fn spawn_streamer(
        transport: Arc<MockTransport>,
        path: &std::path::Path,
        segment: Segment,
        timeout: Duration,
    ) -> (Arc<Streamer<MockTransport>>, Arc<ProgressTracker>) {
        let file = Arc::new(
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .unwrap(),
        );
        let tracker = Arc::new(ProgressTracker::new());
        let limiter = Arc::new(SpeedLimiter::new(None));
        let streamer = Arc::new(Streamer::new(
            transport,
            file,
            segment,
            Arc::clone(&tracker),
            limiter,
            timeout,
        ));
        Arc::clone(&streamer).start();
        (streamer, tracker)
    }

    async fn wait_done(streamer: &Arc<Streamer<MockTransport>>) {
        let worker = Arc::clone(streamer);
        assert!(
            wait_for(move || !worker.is_alive(), Duration::from_secs(10)).await,
            "worker did not settle"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pumps_its_range_to_completion() {
        let data = payload(10_000);
        let transport = MockTransport::serving(data.clone());
        let path = scratch_file(10_000);

        let (streamer, tracker) = spawn_streamer(
            Arc::clone(&transport),
            &path,
            Segment::new(2_500, 4_999, 2_500),
            Duration::from_secs(5),
        );
        wait_done(&streamer).await;

        assert!(streamer.is_done());
        assert_eq!(tracker.total(), 2_500);
        assert_eq!(streamer.segment().size, 0);
        assert_eq!(
            transport.recorded_opens(),
            vec![Some(ByteRange { start: 2_500, end: 4_999 })]
        );

        let written = std::fs::read(&path).unwrap();
        assert_eq!(&written[2_500..5_000], &data[2_500..5_000]);
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn narrows_range_after_disconnect() {
        let data = payload(10_000);
        let transport = MockTransport::serving(data.clone());
        transport.script_at(2_500, Script::ServeThenFail(1_000));
        let path = scratch_file(10_000);

        let (streamer, tracker) = spawn_streamer(
            Arc::clone(&transport),
            &path,
            Segment::new(2_500, 4_999, 2_500),
            Duration::from_secs(5),
        );
        wait_done(&streamer).await;

        assert!(streamer.is_done());
        // banked bytes are never rolled back
        assert_eq!(tracker.total(), 2_500);
        assert_eq!(
            transport.recorded_opens(),
            vec![
                Some(ByteRange { start: 2_500, end: 4_999 }),
                Some(ByteRange { start: 3_500, end: 4_999 }),
            ]
        );

        let written = std::fs::read(&path).unwrap();
        assert_eq!(&written[2_500..5_000], &data[2_500..5_000]);
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rolls_back_credit_when_connected_but_short() {
        let data = payload(4_000);
        let transport = MockTransport::serving(data.clone());
        // first attempt ends cleanly after 1000 bytes while connected:
        // the content is suspect and must be uncredited
        transport.script_at(0, Script::ServeShort(1_000));
        let path = scratch_file(4_000);

        let (streamer, tracker) = spawn_streamer(
            Arc::clone(&transport),
            &path,
            Segment::new(0, 3_999, 4_000),
            Duration::from_secs(5),
        );
        wait_done(&streamer).await;

        assert!(streamer.is_done());
        // 1000 credited then removed, then the full 4000 on the retry
        assert_eq!(tracker.total(), 4_000);
        // the retry starts from the original offset
        assert_eq!(
            transport.recorded_opens(),
            vec![
                Some(ByteRange { start: 0, end: 3_999 }),
                Some(ByteRange { start: 0, end: 3_999 }),
            ]
        );
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn truncates_when_server_ignores_the_range() {
        let data = payload(10_000);
        let transport = MockTransport::serving(data.clone());
        transport.script_at(2_500, Script::IgnoreRange);
        let path = scratch_file(10_000);

        let (streamer, tracker) = spawn_streamer(
            Arc::clone(&transport),
            &path,
            Segment::new(2_500, 4_999, 2_500),
            Duration::from_secs(5),
        );
        wait_done(&streamer).await;

        assert!(streamer.is_done());
        // credited exactly the segment's share, not the whole body
        assert_eq!(tracker.total(), 2_500);
        assert_eq!(transport.recorded_opens().len(), 1);
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_size_finishes_on_clean_eof() {
        let data = payload(3_000);
        let transport = MockTransport::without_size(data.clone());
        let path = scratch_file(1);

        let (streamer, tracker) = spawn_streamer(
            Arc::clone(&transport),
            &path,
            Segment::new(0, 0, 0),
            Duration::from_secs(5),
        );
        wait_done(&streamer).await;

        assert!(streamer.is_done());
        assert_eq!(tracker.total(), 3_000);
        // no range header for an unsized segment
        assert_eq!(transport.recorded_opens(), vec![None]);
        assert_eq!(std::fs::read(&path).unwrap(), data);
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn gives_up_once_nothing_progresses() {
        let transport = MockTransport::unreachable(payload(100));
        let path = scratch_file(100);

        let (streamer, _tracker) = spawn_streamer(
            Arc::clone(&transport),
            &path,
            Segment::new(0, 99, 100),
            Duration::from_millis(200),
        );
        wait_done(&streamer).await;

        assert!(!streamer.is_done());
        assert!(!streamer.is_alive());
        assert!(!streamer.is_connected());
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_is_observed_at_the_next_poll() {
        let transport = MockTransport::serving(payload(100));
        let path = scratch_file(100);

        let (streamer, _tracker) = spawn_streamer(
            Arc::clone(&transport),
            &path,
            Segment::new(0, 99, 100),
            Duration::from_secs(30),
        );
        streamer.pause();
        tokio::time::sleep(Duration::from_millis(50)).await;
        streamer.stop();
        wait_done(&streamer).await;

        assert!(!streamer.is_alive());
        std::fs::remove_file(&path).ok();
    }
}

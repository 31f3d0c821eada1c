use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};

use crate::util::CHUNK_SIZE;

/// Hierarchical byte-quota gate. Workers call [`SpeedLimiter::get`] before
/// every read to learn how many bytes they may request next.
///
/// Limiters form a tree: a child delegates every `get` to the root, so one
/// configured cap applies to the whole fleet while each level still carries
/// its own configuration defaults. Accounting is a per-second reservation
/// window rather than a continuous token bucket, which keeps the arithmetic
/// auditable: within any one-second window the granted bytes never exceed
/// the limit.
pub struct SpeedLimiter {
    parent: Option<Arc<SpeedLimiter>>,
    priority: AtomicBool,
    state: Mutex<LimiterState>,
}

struct LimiterState {
    limit: Option<u64>,
    request_size: u32,
    requested: u64,
    window_start: Instant,
}

impl SpeedLimiter {
    pub fn new(limit: Option<u64>) -> Self {
        Self::with(limit, None)
    }

    pub fn with_parent(parent: Arc<SpeedLimiter>) -> Self {
        Self::with(None, Some(parent))
    }

    pub fn with(limit: Option<u64>, parent: Option<Arc<SpeedLimiter>>) -> Self {
        Self {
            parent,
            priority: AtomicBool::new(false),
            state: Mutex::new(LimiterState {
                limit: limit.filter(|l| *l > 0),
                request_size: CHUNK_SIZE,
                requested: 0,
                window_start: Instant::now(),
            }),
        }
    }

    /// Returns the number of bytes the caller may request next, blocking
    /// until the next window when the current one is exhausted. The cap
    /// lives at the root of the hierarchy; child limiters delegate.
    pub async fn get(&self) -> u32 {
        let mut node = self;
        while let Some(parent) = node.parent.as_deref() {
            node = parent;
        }
        node.acquire().await
    }

    async fn acquire(&self) -> u32 {
        let mut state = self.state.lock().await;

        let limit = match state.limit {
            Some(limit) => limit,
            None => return state.request_size,
        };

        let remaining = limit.saturating_sub(state.requested);
        let grant = if remaining > 0 {
            remaining.min(state.request_size as u64)
        } else {
            // Quota exhausted: hold the gate shut until the window turns
            // over, then hand out a fresh reservation.
            let elapsed = state.window_start.elapsed();
            if elapsed < Duration::from_secs(1) {
                sleep(Duration::from_secs(1) - elapsed).await;
            }
            state.requested = 0;
            state.window_start = Instant::now();
            (state.request_size as u64).min(limit)
        };

        state.requested += grant;
        grant as u32
    }

    /// Sets the cap in bytes per second; zero removes it.
    pub async fn set_limit(&self, limit: u64) {
        let mut state = self.state.lock().await;
        state.limit = (limit > 0).then_some(limit);
    }

    pub async fn set_request_size(&self, size: u32) {
        let mut state = self.state.lock().await;
        state.request_size = size.max(1);
    }

    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.requested = 0;
        state.window_start = Instant::now();
    }

    pub fn promote(&self) {
        self.priority.store(true, Ordering::Relaxed);
    }

    pub fn demote(&self) {
        self.priority.store(false, Ordering::Relaxed);
    }

    pub fn is_priority(&self) -> bool {
        self.priority.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_returns_default_request_size() {
        let limiter = SpeedLimiter::new(None);
        assert_eq!(limiter.get().await, CHUNK_SIZE);
    }

    #[tokio::test]
    async fn zero_limit_means_unlimited() {
        let limiter = SpeedLimiter::new(Some(0));
        assert_eq!(limiter.get().await, CHUNK_SIZE);
        limiter.set_limit(0).await;
        assert_eq!(limiter.get().await, CHUNK_SIZE);
    }

    #[tokio::test(start_paused = true)]
    async fn grants_never_exceed_limit_within_window() {
        let limiter = SpeedLimiter::new(Some(10_000));
        limiter.set_request_size(4_000).await;

        let start = Instant::now();
        let mut granted = 0u64;
        // first window: 4000 + 4000 + 2000, with no waiting
        for _ in 0..3 {
            granted += limiter.get().await as u64;
        }
        assert_eq!(granted, 10_000);
        assert_eq!(start.elapsed(), Duration::ZERO);

        // next request straddles into the following window
        let next = limiter.get().await;
        assert_eq!(next, 4_000);
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn limit_below_request_size_caps_grant() {
        let limiter = SpeedLimiter::new(Some(100));
        assert_eq!(limiter.get().await, 100);
        let start = Instant::now();
        assert_eq!(limiter.get().await, 100);
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_rate_matches_limit() {
        // 100 KiB/s cap, 1 MiB of requests: ten full windows
        let limit = 100 * 1024u64;
        let limiter = SpeedLimiter::new(Some(limit));

        let start = Instant::now();
        let mut total = 0u64;
        while total < 1024 * 1024 {
            total += limiter.get().await as u64;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(9), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_secs(11), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn child_delegates_to_root() {
        let root = Arc::new(SpeedLimiter::new(Some(5_000)));
        root.set_request_size(2_000).await;
        let child = SpeedLimiter::with_parent(Arc::clone(&root));

        // the child's own configuration does not matter once a parent is set
        child.set_limit(1).await;
        assert_eq!(child.get().await, 2_000);
        assert_eq!(child.get().await, 2_000);
        assert_eq!(child.get().await, 1_000);
    }

    #[tokio::test]
    async fn reset_reopens_the_window() {
        let limiter = SpeedLimiter::new(Some(1_000));
        assert_eq!(limiter.get().await, 1_000);
        limiter.reset().await;
        assert_eq!(limiter.get().await, 1_000);
    }

    #[test]
    fn priority_flag_toggles() {
        let limiter = SpeedLimiter::new(None);
        assert!(!limiter.is_priority());
        limiter.promote();
        assert!(limiter.is_priority());
        limiter.demote();
        assert!(!limiter.is_priority());
    }
}

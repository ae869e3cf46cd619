use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};

const REFILL_INTERVAL: Duration = Duration::from_millis(100);

/// Token-bucket throttle gate over byte acquisitions.
///
/// Capacity equals the configured bytes-per-second limit and tokens refill
/// continuously at that rate, observed at 100 ms ticks. A limit of 0 means
/// unlimited; the overload is deliberate (0 doubles as "no limit configured")
/// and `acquire` is a no-op in that mode.
///
/// Acquisitions are served in arrival order: each caller holds the bucket
/// lock for the duration of its acquisition, and requests larger than the
/// bucket capacity drain in capacity-sized slices so they make progress in
/// bounded time instead of deadlocking.
pub struct BandwidthLimiter {
    max_bps: AtomicU64,
    bucket: Mutex<Bucket>,
    reconfigured: Notify,
}

struct Bucket {
    tokens: u64,
    last_refill: Instant,
}

impl BandwidthLimiter {
    pub fn new(max_bps: u64) -> Self {
        Self {
            max_bps: AtomicU64::new(max_bps),
            bucket: Mutex::new(Bucket {
                tokens: max_bps,
                last_refill: Instant::now(),
            }),
            reconfigured: Notify::new(),
        }
    }

    /// Unlimited gate.
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn limit(&self) -> u64 {
        self.max_bps.load(Ordering::Relaxed)
    }

    /// Live reconfiguration. Raising the limit releases waiters immediately;
    /// lowering shrinks capacity without revoking tokens already granted.
    pub fn set_limit(&self, max_bps: u64) {
        self.max_bps.store(max_bps, Ordering::Relaxed);
        self.reconfigured.notify_waiters();
    }

    /// Consume `n` tokens, suspending until they are available.
    pub async fn acquire(&self, n: usize) {
        if self.limit() == 0 || n == 0 {
            return;
        }

        let mut remaining = n as u64;
        let mut bucket = self.bucket.lock().await;

        while remaining > 0 {
            let limit = self.limit();
            if limit == 0 {
                // Limiter was disabled while we waited.
                return;
            }

            self.refill(&mut bucket, limit);

            // Requests above capacity drain slice by slice.
            let slice = remaining.min(limit);
            if bucket.tokens >= slice {
                bucket.tokens -= slice;
                remaining -= slice;
                continue;
            }

            let notified = self.reconfigured.notified();
            tokio::select! {
                _ = tokio::time::sleep(REFILL_INTERVAL) => {}
                _ = notified => {}
            }
        }
    }

    fn refill(&self, bucket: &mut Bucket, limit: u64) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let added = (limit as f64 * elapsed.as_secs_f64()) as u64;
        if added > 0 {
            bucket.tokens = bucket.tokens.saturating_add(added).min(limit);
            bucket.last_refill = now;
        }
    }
}

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Token-bucket pacing for compaction writes, shared by every builder
/// across all workers. A budget of zero disables pacing.
#[derive(Debug)]
pub struct RateLimiter {
    bytes_per_sec: usize,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    available: f64,
    refilled_at: Instant,
}

impl RateLimiter {
    pub fn new(bytes_per_sec: usize) -> Self {
        Self {
            bytes_per_sec,
            bucket: Mutex::new(Bucket {
                available: bytes_per_sec as f64,
                refilled_at: Instant::now(),
            }),
        }
    }

    pub(crate) async fn acquire(&self, bytes: usize) {
        if self.bytes_per_sec == 0 {
            return;
        }
        let rate = self.bytes_per_sec as f64;
        loop {
            let mut bucket = self.bucket.lock().await;
            let now = Instant::now();
            let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
            bucket.available = (bucket.available + elapsed * rate).min(rate);
            bucket.refilled_at = now;
            if bucket.available >= bytes as f64 {
                bucket.available -= bytes as f64;
                return;
            }
            let deficit = bytes as f64 - bucket.available;
            drop(bucket);
            tokio::time::sleep(Duration::from_secs_f64(deficit / rate)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_never_blocks() {
        let limiter = RateLimiter::new(0);
        limiter.acquire(usize::MAX).await;
    }

    #[tokio::test]
    async fn paced_acquire_spends_budget() {
        let limiter = RateLimiter::new(1 << 20);
        limiter.acquire(1 << 19).await;
        let bucket = limiter.bucket.lock().await;
        assert!(bucket.available <= (1 << 19) as f64 + 1024.0);
    }
}

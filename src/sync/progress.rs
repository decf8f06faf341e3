use std::{collections::VecDeque, time::Duration};

use tokio::time::Instant;
use tracing::info;

use super::BlockHeight;

const SAMPLES: usize = 20;
const LOG_EVERY: Duration = Duration::from_secs(10);

/// Receives the height of every block the fetcher emits
pub trait ProgressSink: Send {
    fn report(&mut self, height: BlockHeight, target: BlockHeight);
}

/// Discards progress reports
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&mut self, _: BlockHeight, _: BlockHeight) {}
}

/// Logs a blocks per second rate smoothed over the last samples, with the time left to reach the
/// target height
pub struct RollingProgress {
    samples: VecDeque<(Instant, BlockHeight)>,
    last_log: Option<Instant>,
}

impl Default for RollingProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl RollingProgress {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(SAMPLES),
            last_log: None,
        }
    }

    /// Blocks per second across the kept samples, `None` until two samples at distinct times
    pub fn rate(&self) -> Option<f64> {
        let (first_at, first_height) = self.samples.front()?;
        let (last_at, last_height) = self.samples.back()?;

        let elapsed = last_at.duration_since(*first_at).as_secs_f64();

        if elapsed <= 0.0 {
            return None;
        }

        Some(last_height.saturating_sub(*first_height) as f64 / elapsed)
    }
}

impl ProgressSink for RollingProgress {
    fn report(&mut self, height: BlockHeight, target: BlockHeight) {
        let now = Instant::now();

        if self.samples.len() == SAMPLES {
            self.samples.pop_front();
        }

        self.samples.push_back((now, height));

        if self.last_log.is_some_and(|at| now.duration_since(at) < LOG_EVERY) {
            return;
        }

        self.last_log = Some(now);

        let remaining = target.saturating_sub(height);

        match self.rate() {
            Some(rate) if rate > 0.0 => {
                let eta = Duration::from_secs_f64(remaining as f64 / rate);

                info!(
                    height,
                    target,
                    rate = format!("{rate:.2} blocks/s"),
                    eta = ?eta,
                    "fetching blocks"
                );
            }
            _ => info!(height, target, "fetching blocks"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rate_is_smoothed_over_samples() {
        let mut progress = RollingProgress::new();

        assert_eq!(progress.rate(), None);

        for height in 0..10 {
            progress.report(height, 100);
            tokio::time::advance(Duration::from_millis(500)).await;
        }

        // 9 blocks over 4.5 seconds
        let rate = progress.rate().unwrap();
        assert!((rate - 2.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn only_recent_samples_are_kept() {
        let mut progress = RollingProgress::new();

        for height in 0..SAMPLES as u64 {
            progress.report(height, 1_000);
            tokio::time::advance(Duration::from_secs(10)).await;
        }

        // jump in speed, the old slow samples age out
        for height in SAMPLES as u64..(SAMPLES as u64 * 3) {
            progress.report(height * 10, 1_000);
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        assert_eq!(progress.samples.len(), SAMPLES);
        assert!(progress.rate().unwrap() > 9.0);
    }
}

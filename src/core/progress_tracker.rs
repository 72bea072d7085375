//! Per-task progress aggregation
//!
//! One tracker per running pipeline. Collects byte and segment counts,
//! smooths the speed with an exponential moving average, estimates an ETA,
//! and forwards throttled `ProgressUpdate`s to the orchestrator. The
//! reported percentage is clamped monotonic non-decreasing for the lifetime
//! of the tracker, so the UI never sees progress move backwards even when a
//! later-indexed segment finishes decoding first.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::core::models::ProgressUpdate;

/// Smoothing factor for the speed EMA
const EMA_ALPHA: f64 = 0.3;
/// Minimum interval between emitted updates (final update always goes out)
const EMIT_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug)]
struct Inner {
    bytes_done: u64,
    bytes_total: Option<u64>,
    units_done: usize,
    units_total: usize,
    percent: f64,
    smoothed_speed: f64,
    started: Instant,
    last_record: Instant,
    last_emit: Option<Instant>,
}

/// Progress aggregator for one task.
pub struct TaskProgress {
    task_id: String,
    tx: mpsc::UnboundedSender<ProgressUpdate>,
    inner: Mutex<Inner>,
}

impl TaskProgress {
    pub fn new(task_id: impl Into<String>, tx: mpsc::UnboundedSender<ProgressUpdate>) -> Self {
        let now = Instant::now();
        Self {
            task_id: task_id.into(),
            tx,
            inner: Mutex::new(Inner {
                bytes_done: 0,
                bytes_total: None,
                units_done: 0,
                units_total: 0,
                percent: 0.0,
                smoothed_speed: 0.0,
                started: now,
                last_record: now,
                last_emit: None,
            }),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Declare the number of work units (segments) driving the percentage.
    pub fn set_total_units(&self, total: usize) {
        let mut inner = self.inner.lock();
        inner.units_total = total;
    }

    pub fn set_bytes_total(&self, total: Option<u64>) {
        let mut inner = self.inner.lock();
        inner.bytes_total = total;
    }

    /// Seed the tracker with work completed by a previous (resumed) attempt.
    pub fn seed(&self, units_done: usize, bytes_done: u64) {
        let mut inner = self.inner.lock();
        inner.units_done = units_done;
        inner.bytes_done = bytes_done;
        if inner.units_total > 0 {
            inner.percent = (units_done as f64 / inner.units_total as f64 * 100.0).min(100.0);
        }
    }

    /// One more segment fully assembled, `bytes` of it written out.
    pub fn record_segment(&self, bytes: u64) {
        let mut inner = self.inner.lock();
        inner.units_done += 1;
        self.account_bytes(&mut inner, bytes);

        if inner.units_total > 0 {
            let pct = inner.units_done as f64 / inner.units_total as f64 * 100.0;
            inner.percent = inner.percent.max(pct.min(100.0));
        }
        self.maybe_emit(&mut inner, false);
    }

    /// Raw byte progress (external downloader path).
    pub fn record_bytes(&self, delta: u64) {
        let mut inner = self.inner.lock();
        self.account_bytes(&mut inner, delta);
        if let Some(total) = inner.bytes_total {
            if total > 0 {
                let pct = inner.bytes_done as f64 / total as f64 * 100.0;
                inner.percent = inner.percent.max(pct.min(100.0));
            }
        }
        self.maybe_emit(&mut inner, false);
    }

    /// Externally reported percentage, clamped monotonic.
    pub fn set_percent(&self, percent: f64) {
        let mut inner = self.inner.lock();
        inner.percent = inner.percent.max(percent.clamp(0.0, 100.0));
        self.maybe_emit(&mut inner, false);
    }

    /// Force the terminal 100% update out.
    pub fn complete(&self) {
        let mut inner = self.inner.lock();
        inner.percent = 100.0;
        self.maybe_emit(&mut inner, true);
    }

    /// Flush whatever state we have (pause/failure paths).
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        self.maybe_emit(&mut inner, true);
    }

    pub fn snapshot(&self) -> ProgressUpdate {
        let inner = self.inner.lock();
        self.build_update(&inner)
    }

    fn account_bytes(&self, inner: &mut Inner, delta: u64) {
        let now = Instant::now();
        let dt = now.duration_since(inner.last_record).as_secs_f64();
        inner.last_record = now;

        if delta > 0 && dt > 0.0 {
            let instant_speed = delta as f64 / dt.max(0.001);
            inner.smoothed_speed = if inner.smoothed_speed == 0.0 {
                instant_speed
            } else {
                EMA_ALPHA * instant_speed + (1.0 - EMA_ALPHA) * inner.smoothed_speed
            };
        }
        inner.bytes_done += delta;
    }

    fn maybe_emit(&self, inner: &mut Inner, force: bool) {
        let due = match inner.last_emit {
            None => true,
            Some(at) => at.elapsed() >= EMIT_INTERVAL,
        };
        if !force && !due {
            return;
        }
        inner.last_emit = Some(Instant::now());

        let update = self.build_update(inner);
        trace!(task_id = %self.task_id, percent = update.progress_percent, "progress");
        let _ = self.tx.send(update);
    }

    fn build_update(&self, inner: &Inner) -> ProgressUpdate {
        let eta = self.estimate_eta(inner);
        ProgressUpdate {
            task_id: self.task_id.clone(),
            progress_percent: inner.percent,
            bytes_done: inner.bytes_done,
            bytes_total: inner.bytes_total,
            speed: inner.smoothed_speed,
            eta,
        }
    }

    fn estimate_eta(&self, inner: &Inner) -> Option<u64> {
        if inner.percent >= 100.0 {
            return Some(0);
        }
        if let Some(total) = inner.bytes_total {
            if inner.smoothed_speed > 0.0 && total > inner.bytes_done {
                return Some(((total - inner.bytes_done) as f64 / inner.smoothed_speed) as u64);
            }
        }
        if inner.percent > 0.0 {
            let elapsed = inner.started.elapsed().as_secs_f64();
            return Some((elapsed * (100.0 - inner.percent) / inner.percent) as u64);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> (TaskProgress, mpsc::UnboundedReceiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TaskProgress::new("t1", tx), rx)
    }

    #[test]
    fn percent_follows_segment_count() {
        let (progress, _rx) = tracker();
        progress.set_total_units(4);

        progress.record_segment(100);
        assert!((progress.snapshot().progress_percent - 25.0).abs() < 1e-9);

        progress.record_segment(100);
        progress.record_segment(100);
        progress.record_segment(100);
        let snap = progress.snapshot();
        assert!((snap.progress_percent - 100.0).abs() < 1e-9);
        assert_eq!(snap.bytes_done, 400);
    }

    #[test]
    fn percent_never_regresses() {
        let (progress, _rx) = tracker();
        progress.set_percent(40.0);
        progress.set_percent(30.0);
        assert!((progress.snapshot().progress_percent - 40.0).abs() < 1e-9);

        progress.set_percent(140.0);
        assert!((progress.snapshot().progress_percent - 100.0).abs() < 1e-9);
    }

    #[test]
    fn seeded_resume_starts_from_prior_percent() {
        let (progress, _rx) = tracker();
        progress.set_total_units(10);
        progress.seed(6, 6000);

        let snap = progress.snapshot();
        assert!((snap.progress_percent - 60.0).abs() < 1e-9);
        assert_eq!(snap.bytes_done, 6000);
    }

    #[test]
    fn complete_always_emits_final_update() {
        let (progress, mut rx) = tracker();
        progress.set_total_units(1);
        progress.record_segment(10);
        progress.complete();

        let mut last = None;
        while let Ok(update) = rx.try_recv() {
            last = Some(update);
        }
        let last = last.expect("at least one update");
        assert!((last.progress_percent - 100.0).abs() < 1e-9);
        assert_eq!(last.eta, Some(0));
    }
}

//! Bake progress reporting
//!
//! The sampling phase keeps an exponential moving average of the cost of one
//! sample and turns it into a remaining-time estimate.

use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Exponential moving average. The first sample initializes the average.
#[derive(Clone, Copy, Debug)]
pub struct Ema {
    alpha: f64,
    value: Option<f64>,
}

impl Ema {
    pub fn new(alpha: f32) -> Self {
        Self {
            alpha: f64::from(alpha.clamp(f32::EPSILON, 1.0)),
            value: None,
        }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            None => sample,
            Some(avg) => avg + self.alpha * (sample - avg),
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Snapshot reported to a [`ProgressSink`].
#[derive(Clone, Debug, PartialEq)]
pub struct BakeProgress {
    pub title: String,
    pub info: String,
    /// 0.0 ..= 1.0
    pub fraction: f32,
    pub completed_samples: usize,
    pub total_samples: usize,
    pub estimated_remaining: Option<Duration>,
}

/// Receives progress updates from the orchestrator.
pub trait ProgressSink {
    fn report(&mut self, progress: &BakeProgress);
    /// Called once when a bake ends, successfully or not.
    fn clear(&mut self);
}

/// Reports through `log`, rate limited to every `every` percent.
#[derive(Debug)]
pub struct LogProgressSink {
    every: u32,
    last_percent: Option<u32>,
}

impl LogProgressSink {
    pub fn new(every_percent: u32) -> Self {
        Self {
            every: every_percent.max(1),
            last_percent: None,
        }
    }
}

impl Default for LogProgressSink {
    fn default() -> Self {
        Self::new(10)
    }
}

impl ProgressSink for LogProgressSink {
    fn report(&mut self, progress: &BakeProgress) {
        let percent = (progress.fraction * 100.0).floor() as u32;
        let bucket = percent / self.every;
        if self.last_percent == Some(bucket) {
            return;
        }
        self.last_percent = Some(bucket);
        match progress.estimated_remaining {
            Some(eta) => log::info!(
                "[Bake] {} {:>3}% {} ({:.1}s remaining)",
                progress.title,
                percent,
                progress.info,
                eta.as_secs_f32()
            ),
            None => log::info!("[Bake] {} {:>3}% {}", progress.title, percent, progress.info),
        }
    }

    fn clear(&mut self) {
        self.last_percent = None;
    }
}

/// Keeps every report; handy for tests and for UI polling.
#[derive(Clone, Debug, Default)]
pub struct RecordingProgressSink {
    inner: Arc<Mutex<RecordedProgress>>,
}

#[derive(Debug, Default)]
pub struct RecordedProgress {
    pub reports: Vec<BakeProgress>,
    pub cleared: usize,
}

impl RecordingProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<BakeProgress> {
        self.inner
            .lock()
            .map(|r| r.reports.clone())
            .unwrap_or_default()
    }

    pub fn cleared(&self) -> usize {
        self.inner.lock().map(|r| r.cleared).unwrap_or(0)
    }
}

impl ProgressSink for RecordingProgressSink {
    fn report(&mut self, progress: &BakeProgress) {
        if let Ok(mut r) = self.inner.lock() {
            r.reports.push(progress.clone());
        }
    }

    fn clear(&mut self) {
        if let Ok(mut r) = self.inner.lock() {
            r.cleared += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ema_first_sample_initializes() {
        let mut ema = Ema::new(0.5);
        assert_eq!(ema.value(), None);
        assert_eq!(ema.update(10.0), 10.0);
        assert_eq!(ema.update(20.0), 15.0);
        assert_eq!(ema.update(15.0), 15.0);
    }

    #[test]
    fn test_ema_small_alpha_is_smooth() {
        let mut ema = Ema::new(0.005);
        ema.update(1.0);
        let v = ema.update(1001.0);
        assert!((v - 6.0).abs() < 1e-4);
    }

    #[test]
    fn test_recording_sink_shares_state() {
        let sink = RecordingProgressSink::new();
        let mut handle = sink.clone();
        handle.report(&BakeProgress {
            title: "t".into(),
            info: String::new(),
            fraction: 0.5,
            completed_samples: 1,
            total_samples: 2,
            estimated_remaining: None,
        });
        handle.clear();
        assert_eq!(sink.reports().len(), 1);
        assert_eq!(sink.cleared(), 1);
    }
}

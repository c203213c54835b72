//! Latest-sample slot and per-channel history
use std::sync::Mutex;
use tokio::sync::watch;

use crate::models::DecodedSample;

/// Append-only record of every successfully decoded sample, one sequence
/// per channel family. Kept for audit and inspection, not control flow;
/// grows for the lifetime of the process.
#[derive(Debug, Clone, Default)]
pub struct SampleHistory {
    pub motion: Vec<(f64, f64, f64)>,
    pub primary: Vec<f64>,
    pub secondary: Vec<f64>,
}

impl SampleHistory {
    fn append(&mut self, sample: &DecodedSample) {
        self.motion
            .push((sample.motion_x, sample.motion_y, sample.motion_z));
        self.primary.push(sample.primary);
        self.secondary.extend_from_slice(&sample.secondary);
    }
}

/// Holds the most recent decoded sample and the session history.
///
/// Written only by the acquisition session; readers subscribe to change
/// notifications instead of polling. A reader sees each published sample
/// whole, but two separate reads may straddle a publish.
pub struct SampleStore {
    current: watch::Sender<Option<DecodedSample>>,
    history: Mutex<SampleHistory>,
}

impl SampleStore {
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        SampleStore {
            current,
            history: Mutex::new(SampleHistory::default()),
        }
    }

    /// Record one decoded sample: append every history family and replace
    /// the current slot. The only mutator.
    pub fn publish(&self, sample: DecodedSample) {
        self.history
            .lock()
            .expect("sample history lock poisoned")
            .append(&sample);
        self.current.send_replace(Some(sample));
    }

    pub fn latest(&self) -> Option<DecodedSample> {
        self.current.borrow().clone()
    }

    /// Change-notified view of the current slot.
    pub fn subscribe(&self) -> watch::Receiver<Option<DecodedSample>> {
        self.current.subscribe()
    }

    /// Snapshot of the full history taken under the store lock.
    pub fn history(&self) -> SampleHistory {
        self.history
            .lock()
            .expect("sample history lock poisoned")
            .clone()
    }

    /// Number of samples published so far.
    pub fn sample_count(&self) -> usize {
        self.history
            .lock()
            .expect("sample history lock poisoned")
            .primary
            .len()
    }
}

impl Default for SampleStore {
    fn default() -> Self {
        Self::new()
    }
}

//! Observation hooks for intermediate feature maps
//!
//! The forward pass is pure; observers receive read-only taps of the
//! intermediate maps and can never change what the backbone computes.
//! Debug dumps, logging and visualization all hang off this seam.

use crate::model::FeatureMap;

/// Receives named intermediate feature maps during an observed forward pass
pub trait FeatureObserver {
    /// Called once per tap point, in pipeline order
    fn record(&mut self, name: &str, map: &FeatureMap);
}

/// Observer that discards every tap
pub struct NullObserver;

impl FeatureObserver for NullObserver {
    fn record(&mut self, _name: &str, _map: &FeatureMap) {}
}

/// Observer that keeps the name and shape of every tap, in order
#[derive(Debug, Default)]
pub struct RecordingObserver {
    /// Recorded (name, shape) pairs
    pub taps: Vec<(String, Vec<usize>)>,
}

impl RecordingObserver {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }
}

impl FeatureObserver for RecordingObserver {
    fn record(&mut self, name: &str, map: &FeatureMap) {
        self.taps.push((name.to_string(), map.shape().to_vec()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn test_recording_observer_keeps_order() {
        let mut observer = RecordingObserver::new();
        observer.record("first", &Array4::zeros((1, 2, 3, 3)));
        observer.record("second", &Array4::zeros((1, 4, 2, 2)));

        assert_eq!(observer.taps.len(), 2);
        assert_eq!(observer.taps[0], ("first".to_string(), vec![1, 2, 3, 3]));
        assert_eq!(observer.taps[1].0, "second");
    }
}

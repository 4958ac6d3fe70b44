//! The multidimensional event type.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Coordinate vector of an event. Inline storage covers the common
/// 2-4 dimensional workspaces without a heap allocation.
pub type Coords = SmallVec<[f64; 4]>;

/// A single measured event: an N-dimensional coordinate plus signal and
/// error. Events are immutable and owned by their containing box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MdEvent {
    pub coords: Coords,
    pub signal: f64,
    pub error: f64,
}

impl MdEvent {
    pub fn new(coords: impl Into<Coords>, signal: f64, error: f64) -> Self {
        MdEvent {
            coords: coords.into(),
            signal,
            error,
        }
    }

    /// Number of dimensions of this event.
    pub fn ndim(&self) -> usize {
        self.coords.len()
    }

    /// Coordinate along one dimension.
    pub fn coord(&self, dim: usize) -> f64 {
        self.coords[dim]
    }

    /// Approximate resident footprint of one event in bytes.
    pub fn footprint(ndim: usize) -> usize {
        ndim * std::mem::size_of::<f64>() + 2 * std::mem::size_of::<f64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_new() {
        let e = MdEvent::new(vec![1.0, 2.0], 3.0, 0.5);
        assert_eq!(e.ndim(), 2);
        assert_eq!(e.coord(0), 1.0);
        assert_eq!(e.coord(1), 2.0);
        assert_eq!(e.signal, 3.0);
        assert_eq!(e.error, 0.5);
    }

    #[test]
    fn test_event_footprint_scales_with_ndim() {
        assert_eq!(MdEvent::footprint(2), 32);
        assert_eq!(MdEvent::footprint(3), 40);
        assert!(MdEvent::footprint(4) > MdEvent::footprint(2));
    }
}

//! Bounding regions for box-tree nodes.
//!
//! A region is a per-dimension interval `[min, max)`. The upper edge is
//! half-open everywhere except on the last child along a dimension, which
//! stays closed so the workspace extent itself remains covered. The
//! child-slot arithmetic used to route events on split is derived from the
//! same edges, so routing and containment can never disagree.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::dimension::Dimension;
use crate::errors::{MdError, MdResult};

type Edges = SmallVec<[f64; 4]>;
type Flags = SmallVec<[bool; 4]>;

/// An axis-aligned region of N-dimensional space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    lo: Edges,
    hi: Edges,
    /// Whether the upper edge is closed along each dimension.
    closed_hi: Flags,
}

impl Region {
    /// Builds the full-extent region of a workspace; all upper edges are
    /// closed so every in-extent coordinate is contained.
    pub fn from_dimensions(dims: &[Dimension]) -> Self {
        Region {
            lo: dims.iter().map(|d| d.min).collect(),
            hi: dims.iter().map(|d| d.max).collect(),
            closed_hi: dims.iter().map(|_| true).collect(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.lo.len()
    }

    pub fn lo(&self, dim: usize) -> f64 {
        self.lo[dim]
    }

    pub fn hi(&self, dim: usize) -> f64 {
        self.hi[dim]
    }

    /// True if the coordinate vector lies inside the region, honoring the
    /// half-open upper edges.
    pub fn contains(&self, coords: &[f64]) -> bool {
        if coords.len() != self.ndim() {
            return false;
        }
        coords.iter().enumerate().all(|(d, &x)| {
            x >= self.lo[d] && (x < self.hi[d] || (self.closed_hi[d] && x <= self.hi[d]))
        })
    }

    /// Flattened `[min, max]` pairs per dimension, the order used in the
    /// on-disk box record.
    pub fn bounds_flat(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(2 * self.ndim());
        for d in 0..self.ndim() {
            out.push(self.lo[d]);
            out.push(self.hi[d]);
        }
        out
    }

    /// Subdivides into `factor^ndim` child regions. Children are ordered
    /// with dimension 0 varying fastest; the child index of a slot vector
    /// `k` is `sum_d k[d] * factor^d`, matching [`Region::child_slot`].
    pub fn subdivide(&self, factor: usize) -> Vec<Region> {
        let ndim = self.ndim();
        let total = factor.pow(ndim as u32);
        let mut children = Vec::with_capacity(total);

        for index in 0..total {
            let mut lo = Edges::with_capacity(ndim);
            let mut hi = Edges::with_capacity(ndim);
            let mut closed = Flags::with_capacity(ndim);
            let mut rem = index;
            for d in 0..ndim {
                let k = rem % factor;
                rem /= factor;
                let width = (self.hi[d] - self.lo[d]) / factor as f64;
                let last = k == factor - 1;
                lo.push(self.lo[d] + k as f64 * width);
                // The last child ends exactly at the parent edge; interior
                // edges stay half-open.
                hi.push(if last {
                    self.hi[d]
                } else {
                    self.lo[d] + (k + 1) as f64 * width
                });
                closed.push(last && self.closed_hi[d]);
            }
            children.push(Region {
                lo,
                hi,
                closed_hi: closed,
            });
        }
        children
    }

    /// Deterministic child slot for a coordinate vector under a `factor`
    /// subdivision. Coordinates exactly on an interior boundary go to the
    /// upper child (half-open intervals); the parent's upper edge maps to
    /// the last child.
    pub fn child_slot(&self, factor: usize, coords: &[f64]) -> MdResult<usize> {
        if coords.len() != self.ndim() {
            return Err(MdError::Configuration(format!(
                "event has {} coordinates, region has {} dimensions",
                coords.len(),
                self.ndim()
            )));
        }
        let mut index = 0usize;
        let mut stride = 1usize;
        for d in 0..self.ndim() {
            let width = (self.hi[d] - self.lo[d]) / factor as f64;
            let mut k = ((coords[d] - self.lo[d]) / width) as usize;
            if k >= factor {
                k = factor - 1;
            }
            index += k * stride;
            stride *= factor;
        }
        Ok(index)
    }
}

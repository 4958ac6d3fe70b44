//! Per-axis dimension metadata.
//!
//! Dimensions are fixed once a workspace is initialized; every event
//! coordinate vector has one entry per registered dimension.

use serde::{Deserialize, Serialize};

use crate::errors::{MdError, MdResult};

/// Static metadata for one workspace axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    /// Human-readable name, unique within a workspace.
    pub name: String,
    /// Stable axis identifier.
    pub id: String,
    /// Unit label, informational only.
    pub units: String,
    /// Lower edge of the axis extent.
    pub min: f64,
    /// Upper edge of the axis extent.
    pub max: f64,
    /// Number of bins along the axis.
    pub bins: usize,
}

impl Dimension {
    /// Creates a dimension, validating its extent.
    pub fn new(
        name: impl Into<String>,
        id: impl Into<String>,
        units: impl Into<String>,
        min: f64,
        max: f64,
        bins: usize,
    ) -> MdResult<Self> {
        let name = name.into();
        if !min.is_finite() || !max.is_finite() || min >= max {
            return Err(MdError::Configuration(format!(
                "dimension '{}' has invalid extent [{}, {}]",
                name, min, max
            )));
        }
        if bins == 0 {
            return Err(MdError::Configuration(format!(
                "dimension '{}' must have at least one bin",
                name
            )));
        }
        Ok(Dimension {
            name,
            id: id.into(),
            units: units.into(),
            min,
            max,
            bins,
        })
    }

    /// Width of the full extent.
    pub fn width(&self) -> f64 {
        self.max - self.min
    }
}

//! Solver adapters wrapping the three numerical back-ends.
//!
//! All adapters consume the [crate::Objective] over the unit cube and report
//! their results in physical units, ordered like the sorted active-parameter
//! names, so consumers can zip adapter output against that name list.

pub mod ensemble;
pub use ensemble::{EnsembleOptions, EnsembleSampler};

pub mod nested;
pub use nested::{NestedOptions, NestedResults, NestedSampler};

pub mod point;
pub use point::PointOptions;

#![doc = include_str!("../README.md")]


mod error;
pub use error::FitError;

mod fit;
pub use fit::{Fit, FitOutput, RunOptions, Solver};

mod model;
pub use model::SkyModel;

mod objective;
pub use objective::Objective;

pub mod range;

pub mod solver;
pub use solver::{
    EnsembleOptions, EnsembleSampler, NestedOptions, NestedResults, NestedSampler, PointOptions,
};

mod statistic;
pub use statistic::Statistic;

pub mod vectorize;

pub use ndarray;

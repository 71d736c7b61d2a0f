//! Objective core mapping unit-cube points to likelihood or chi-square
//! values.

use crate::error::FitError;
use crate::model::SkyModel;
use crate::range::unit_to_physical;
use crate::statistic::{CHI2_CEILING, LN_LIKE_FLOOR, Statistic};

use ndarray::{Array2, Array4};
use std::collections::BTreeMap;

/// Likelihood/chi-square evaluator over the unit cube of active parameters.
///
/// Built by [crate::Fit::run] for the duration of one solver invocation; it
/// borrows the orchestrator's tensors and statistic, and holds mutable access
/// to the attached models. Every evaluation pushes parameter updates into the
/// models through their stateful `reset`, so an `Objective` is **not**
/// reentrant across concurrent evaluations sharing the same model instances:
/// parallel likelihood calls must either serialize access or use independent
/// model instances per worker.
pub struct Objective<'a> {
    names: &'a [String],
    ranges: Vec<(f64, f64)>,
    // the explicit 'static bound keeps the trait-object lifetime out of 'a,
    // which &mut would otherwise pin to the models' own borrows
    foreground: Option<&'a mut (dyn SkyModel + 'static)>,
    background: Option<&'a mut (dyn SkyModel + 'static)>,
    statistic: &'a Statistic,
    data: &'a Array4<f64>,
    fiducial: &'a Array4<f64>,
    noise: &'a Array4<f64>,
    covariance: &'a Array2<f64>,
}

impl<'a> Objective<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        names: &'a [String],
        ranges: Vec<(f64, f64)>,
        foreground: Option<&'a mut (dyn SkyModel + 'static)>,
        background: Option<&'a mut (dyn SkyModel + 'static)>,
        statistic: &'a Statistic,
        data: &'a Array4<f64>,
        fiducial: &'a Array4<f64>,
        noise: &'a Array4<f64>,
        covariance: &'a Array2<f64>,
    ) -> Self {
        debug_assert_eq!(names.len(), ranges.len());
        debug_assert!(foreground.is_some() || background.is_some());
        Self {
            names,
            ranges,
            foreground,
            background,
            statistic,
            data,
            fiducial,
            noise,
            covariance,
        }
    }

    /// Number of active parameters, the dimension of the unit cube.
    pub fn ndim(&self) -> usize {
        self.names.len()
    }

    /// Physical `[low, high]` ranges in the same alphabetical order the cube
    /// coordinates are assigned.
    pub fn ranges(&self) -> &[(f64, f64)] {
        &self.ranges
    }

    /// Push a cube point into the models and collect the summed band-power
    /// prediction. `None` when any coordinate falls outside `[0, 1]`; the
    /// models are not invoked in that case.
    fn predict(&mut self, cube: &[f64]) -> Result<Option<Array4<f64>>, FitError> {
        debug_assert_eq!(cube.len(), self.names.len());
        if cube.iter().any(|&u| !(0.0..=1.0).contains(&u)) {
            return Ok(None);
        }
        for (i, name) in self.names.iter().enumerate() {
            let value = unit_to_physical(cube[i], self.ranges[i]);
            let delta = BTreeMap::from([(name.clone(), value)]);
            if let Some(foreground) = self.foreground.as_deref_mut() {
                foreground.reset(&delta);
            }
            if let Some(background) = self.background.as_deref_mut() {
                background.reset(&delta);
            }
        }
        let predicted = match (self.foreground.as_deref(), self.background.as_deref()) {
            (Some(fg), Some(bg)) => fg.bandpower() + bg.bandpower(),
            (Some(fg), None) => fg.bandpower(),
            (None, Some(bg)) => bg.bandpower(),
            // at least one model is guaranteed attached by Fit construction
            (None, None) => return Err(FitError::NoModelAttached),
        };
        Ok(Some(predicted))
    }

    /// Log-likelihood at a cube point, for the sampling solvers. Out-of-cube
    /// points return the finite floor standing in for `-inf`.
    pub fn log_likelihood(&mut self, cube: &[f64]) -> Result<f64, FitError> {
        match self.predict(cube)? {
            Some(predicted) => self.statistic.log_likelihood(
                &predicted,
                self.data,
                self.fiducial,
                self.noise,
                self.covariance,
            ),
            None => Ok(LN_LIKE_FLOOR),
        }
    }

    /// Chi-square at a cube point, for the point optimizer. Out-of-cube
    /// points return the finite ceiling standing in for `+inf`.
    pub fn chi_square(&mut self, cube: &[f64]) -> Result<f64, FitError> {
        match self.predict(cube)? {
            Some(predicted) => self.statistic.chi_square(
                &predicted,
                self.data,
                self.fiducial,
                self.noise,
                self.covariance,
            ),
            None => Ok(CHI2_CEILING),
        }
    }
}

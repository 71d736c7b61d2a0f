//! Fit orchestrator: owns the band-power data, merges model parameter
//! state, and dispatches `run` to the selected solver adapter.

use crate::error::FitError;
use crate::model::SkyModel;
use crate::objective::Objective;
use crate::solver::ensemble::{self, EnsembleOptions};
use crate::solver::nested::{self, NestedOptions, NestedResults};
use crate::solver::point::{self, PointOptions};
use crate::statistic::Statistic;

use ndarray::{Array1, Array2, Array4};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Closed set of solver back-ends.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Solver {
    /// Bounded chi-square minimization with profile errors.
    Optimizer,
    /// Affine-invariant ensemble MCMC.
    EnsembleSampler,
    /// Nested sampling with evidence estimation.
    NestedSampler,
}

/// Per-solver configuration consumed by [Fit::run]. Only the section for the
/// selected solver is read.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RunOptions {
    #[serde(default)]
    pub point: PointOptions,
    #[serde(default)]
    pub ensemble: EnsembleOptions,
    #[serde(default)]
    pub nested: NestedOptions,
}

/// Result of a [Fit::run], one variant per solver path.
#[derive(Clone, Debug)]
pub enum FitOutput {
    /// Best-fit values and error estimates, physical units, alphabetical
    /// active-parameter order.
    Point {
        best: Array1<f64>,
        errors: Array1<f64>,
    },
    /// Flat posterior samples `(nsamples, nparams)`, physical units.
    Samples(Array2<f64>),
    /// Full nested-sampling results with physical-unit samples.
    Nested(NestedResults),
}

/// Top-level fitting object.
///
/// Owns the measured/fiducial/noise band-power tensors and the covariance
/// matrix (moved in at construction, never aliased with caller buffers), the
/// statistic strategy, and up to two sky models. At least one model must be
/// attached. `run` recomputes the active-parameter set on every call and is
/// re-entrant with respect to the owned parameter dictionaries; only the
/// models' internal state changes per call.
pub struct Fit {
    data: Array4<f64>,
    fiducial: Array4<f64>,
    noise: Array4<f64>,
    covariance: Array2<f64>,
    statistic: Statistic,
    background: Option<Box<dyn SkyModel>>,
    foreground: Option<Box<dyn SkyModel>>,
    params: BTreeMap<String, f64>,
    param_ranges: BTreeMap<String, (f64, f64)>,
    solver: Solver,
}

impl Fit {
    /// Construct a Gaussian-statistic fit.
    pub fn gaussian(
        data: Array4<f64>,
        fiducial: Array4<f64>,
        noise: Array4<f64>,
        covariance: Array2<f64>,
        background: Option<Box<dyn SkyModel>>,
        foreground: Option<Box<dyn SkyModel>>,
        solver: Solver,
    ) -> Result<Self, FitError> {
        Self::with_statistic(
            data,
            fiducial,
            noise,
            covariance,
            background,
            foreground,
            solver,
            Statistic::Gaussian,
        )
    }

    /// Construct a Hamimeche-Lewis fit with an optional offset bias
    /// correction; a missing offset defaults to a zero tensor shaped like
    /// the noise tensor.
    #[allow(clippy::too_many_arguments)]
    pub fn hamimeche_lewis(
        data: Array4<f64>,
        fiducial: Array4<f64>,
        noise: Array4<f64>,
        covariance: Array2<f64>,
        background: Option<Box<dyn SkyModel>>,
        foreground: Option<Box<dyn SkyModel>>,
        solver: Solver,
        offset: Option<Array4<f64>>,
    ) -> Result<Self, FitError> {
        let offset = match offset {
            Some(offset) => {
                if offset.raw_dim() != noise.raw_dim() {
                    return Err(FitError::shape_mismatch(
                        "offset tensor",
                        noise.shape(),
                        offset.shape(),
                    ));
                }
                check_no_nan("offset tensor", offset.iter())?;
                offset
            }
            None => Array4::zeros(noise.raw_dim()),
        };
        Self::with_statistic(
            data,
            fiducial,
            noise,
            covariance,
            background,
            foreground,
            solver,
            Statistic::HamimecheLewis { offset },
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn with_statistic(
        data: Array4<f64>,
        fiducial: Array4<f64>,
        noise: Array4<f64>,
        covariance: Array2<f64>,
        background: Option<Box<dyn SkyModel>>,
        foreground: Option<Box<dyn SkyModel>>,
        solver: Solver,
        statistic: Statistic,
    ) -> Result<Self, FitError> {
        if background.is_none() && foreground.is_none() {
            return Err(FitError::NoModelAttached);
        }
        check_no_nan("data tensor", data.iter())?;
        check_band_power_shape("fiducial tensor", &fiducial, &data)?;
        check_no_nan("fiducial tensor", fiducial.iter())?;
        check_band_power_shape("noise tensor", &noise, &data)?;
        check_no_nan("noise tensor", noise.iter())?;
        check_covariance(&covariance, data.len())?;

        let mut fit = Self {
            data,
            fiducial,
            noise,
            covariance,
            statistic,
            background: None,
            foreground: None,
            params: BTreeMap::new(),
            param_ranges: BTreeMap::new(),
            solver,
        };
        if let Some(background) = background {
            fit.set_background(background);
        }
        if let Some(foreground) = foreground {
            fit.set_foreground(foreground);
        }
        Ok(fit)
    }

    /// Attach or replace the background model, then re-derive the merged
    /// parameter and range dictionaries from both attached models.
    pub fn set_background(&mut self, model: Box<dyn SkyModel>) {
        self.background = Some(model);
        self.merge_model_state();
    }

    /// Attach or replace the foreground model, then re-derive the merged
    /// parameter and range dictionaries from both attached models.
    pub fn set_foreground(&mut self, model: Box<dyn SkyModel>) {
        self.foreground = Some(model);
        self.merge_model_state();
    }

    fn merge_model_state(&mut self) {
        for model in [self.background.as_deref(), self.foreground.as_deref()]
            .into_iter()
            .flatten()
        {
            self.params.extend(
                model
                    .params()
                    .iter()
                    .map(|(name, &value)| (name.clone(), value)),
            );
            self.param_ranges.extend(
                model
                    .param_ranges()
                    .iter()
                    .map(|(name, &range)| (name.clone(), range)),
            );
        }
    }

    /// Replace the measured band-power tensor; validated like at
    /// construction.
    pub fn set_data(&mut self, data: Array4<f64>) -> Result<(), FitError> {
        check_band_power_shape("data tensor", &data, &self.noise)?;
        check_no_nan("data tensor", data.iter())?;
        self.data = data;
        Ok(())
    }

    /// Replace the fiducial band-power tensor.
    pub fn set_fiducial(&mut self, fiducial: Array4<f64>) -> Result<(), FitError> {
        check_band_power_shape("fiducial tensor", &fiducial, &self.data)?;
        check_no_nan("fiducial tensor", fiducial.iter())?;
        self.fiducial = fiducial;
        Ok(())
    }

    /// Replace the covariance matrix.
    pub fn set_covariance(&mut self, covariance: Array2<f64>) -> Result<(), FitError> {
        check_covariance(&covariance, self.data.len())?;
        self.covariance = covariance;
        Ok(())
    }

    /// Narrow parameter ranges. Only keys already present are updated,
    /// unknown names are silently ignored.
    pub fn rerange(&mut self, ranges: &BTreeMap<String, (f64, f64)>) {
        for (name, &range) in ranges {
            if let Some(current) = self.param_ranges.get_mut(name) {
                *current = range;
            }
        }
    }

    /// Merged parameter dictionary.
    pub fn params(&self) -> &BTreeMap<String, f64> {
        &self.params
    }

    /// Merged parameter-range dictionary.
    pub fn param_ranges(&self) -> &BTreeMap<String, (f64, f64)> {
        &self.param_ranges
    }

    pub fn solver(&self) -> Solver {
        self.solver
    }

    /// Active parameters for the next run: the merged parameter names minus
    /// both attached models' blacklists, in alphabetical order.
    fn active_names(&self) -> Vec<String> {
        let mut active: BTreeSet<&String> = self.params.keys().collect();
        for model in [self.background.as_deref(), self.foreground.as_deref()]
            .into_iter()
            .flatten()
        {
            for name in model.blacklist() {
                active.remove(name);
            }
        }
        active.into_iter().cloned().collect()
    }

    /// Run the configured solver. The active-parameter set is recomputed
    /// here, immediately before the solver starts.
    pub fn run(&mut self, options: &RunOptions) -> Result<FitOutput, FitError> {
        let names = self.active_names();
        let ranges = names
            .iter()
            .map(|name| {
                self.param_ranges
                    .get(name)
                    .copied()
                    .ok_or_else(|| FitError::MissingParameterRange(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let solver = self.solver;
        let mut objective = Objective::new(
            &names,
            ranges,
            self.foreground.as_deref_mut(),
            self.background.as_deref_mut(),
            &self.statistic,
            &self.data,
            &self.fiducial,
            &self.noise,
            &self.covariance,
        );
        match solver {
            Solver::Optimizer => {
                let (best, errors) = point::run_point(&mut objective, &options.point)?;
                Ok(FitOutput::Point { best, errors })
            }
            Solver::EnsembleSampler => {
                let samples = ensemble::run_ensemble(&mut objective, &options.ensemble)?;
                Ok(FitOutput::Samples(samples))
            }
            Solver::NestedSampler => {
                let results = nested::run_nested(&mut objective, &options.nested)?;
                Ok(FitOutput::Nested(results))
            }
        }
    }
}

// models are opaque trait objects, so Debug reports attachment only
impl fmt::Debug for Fit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fit")
            .field("statistic", &self.statistic)
            .field("solver", &self.solver)
            .field("background", &self.background.is_some())
            .field("foreground", &self.foreground.is_some())
            .field("params", &self.params)
            .field("param_ranges", &self.param_ranges)
            .finish_non_exhaustive()
    }
}

fn check_no_nan<'a>(
    context: &'static str,
    mut values: impl Iterator<Item = &'a f64>,
) -> Result<(), FitError> {
    if values.any(|x| x.is_nan()) {
        Err(FitError::NanEncountered(context))
    } else {
        Ok(())
    }
}

fn check_band_power_shape(
    context: &'static str,
    tensor: &Array4<f64>,
    reference: &Array4<f64>,
) -> Result<(), FitError> {
    if tensor.raw_dim() != reference.raw_dim() {
        Err(FitError::shape_mismatch(
            context,
            reference.shape(),
            tensor.shape(),
        ))
    } else {
        Ok(())
    }
}

fn check_covariance(covariance: &Array2<f64>, expected_side: usize) -> Result<(), FitError> {
    let (rows, cols) = covariance.dim();
    if rows != cols || rows != expected_side {
        return Err(FitError::shape_mismatch(
            "covariance matrix",
            [expected_side, expected_side],
            covariance.shape(),
        ));
    }
    check_no_nan("covariance matrix", covariance.iter())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::tests::CountingModel;

    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, Array4};

    const SHAPE: (usize, usize, usize, usize) = (1, 1, 2, 2);

    fn amplitude_model(range: (f64, f64)) -> Box<dyn SkyModel> {
        Box::new(CountingModel::amplitude(
            "amp",
            range,
            Array4::from_elem(SHAPE, 1.0),
        ))
    }

    fn tensors() -> (Array4<f64>, Array4<f64>, Array4<f64>, Array2<f64>) {
        let fiducial = Array4::from_elem(SHAPE, 1.0);
        let noise = Array4::from_elem(SHAPE, 0.1);
        let data = &fiducial + &noise;
        (data, fiducial, noise, Array2::eye(4))
    }

    fn gaussian_fit(solver: Solver) -> Fit {
        let (data, fiducial, noise, covariance) = tensors();
        Fit::gaussian(
            data,
            fiducial,
            noise,
            covariance,
            None,
            Some(amplitude_model((0.0, 2.0))),
            solver,
        )
        .unwrap()
    }

    #[test]
    fn construction_without_models_fails() {
        let (data, fiducial, noise, covariance) = tensors();
        let err =
            Fit::gaussian(data, fiducial, noise, covariance, None, None, Solver::Optimizer)
                .unwrap_err();
        assert_eq!(err, FitError::NoModelAttached);
    }

    #[test]
    fn nan_in_data_fails_at_construction() {
        let (mut data, fiducial, noise, covariance) = tensors();
        data[[0, 0, 0, 0]] = f64::NAN;
        let err = Fit::gaussian(
            data,
            fiducial,
            noise,
            covariance,
            None,
            Some(amplitude_model((0.0, 2.0))),
            Solver::Optimizer,
        )
        .unwrap_err();
        assert_eq!(err, FitError::NanEncountered("data tensor"));
    }

    #[test]
    fn covariance_side_must_match_band_power_length() {
        let (data, fiducial, noise, _) = tensors();
        let err = Fit::gaussian(
            data,
            fiducial,
            noise,
            Array2::eye(3),
            None,
            Some(amplitude_model((0.0, 2.0))),
            Solver::Optimizer,
        )
        .unwrap_err();
        assert!(matches!(err, FitError::ShapeMismatch { .. }));
    }

    #[test]
    fn offset_shape_is_checked_at_construction() {
        let (data, fiducial, noise, covariance) = tensors();
        let offset = Array4::zeros((1, 1, 2, 3));
        let err = Fit::hamimeche_lewis(
            data,
            fiducial,
            noise,
            covariance,
            None,
            Some(amplitude_model((0.0, 2.0))),
            Solver::Optimizer,
            Some(offset),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            FitError::ShapeMismatch {
                context: "offset tensor",
                ..
            }
        ));
    }

    #[test]
    fn rerange_ignores_unknown_names() {
        let mut fit = gaussian_fit(Solver::Optimizer);
        let before = fit.param_ranges().clone();
        fit.rerange(&BTreeMap::from([
            ("unknown_param".to_string(), (0.0, 1.0)),
        ]));
        assert_eq!(fit.param_ranges(), &before);

        fit.rerange(&BTreeMap::from([("amp".to_string(), (0.5, 1.5))]));
        assert_eq!(fit.param_ranges()["amp"], (0.5, 1.5));
    }

    #[test]
    fn blacklisted_names_are_excluded_from_active_set() {
        let (data, fiducial, noise, covariance) = tensors();
        let mut fg = CountingModel::amplitude("amp", (0.0, 2.0), Array4::from_elem(SHAPE, 1.0));
        fg.declare("beta_dust", 1.5, (1.0, 2.0));
        fg.blacklist_name("beta_dust");
        let mut bg = CountingModel::amplitude("r_tensor", (0.0, 1.0), Array4::zeros(SHAPE));
        bg.declare("amp", 1.0, (0.0, 2.0));
        bg.blacklist_name("amp");

        let fit = Fit::gaussian(
            data,
            fiducial,
            noise,
            covariance,
            Some(Box::new(bg)),
            Some(Box::new(fg)),
            Solver::Optimizer,
        )
        .unwrap();
        // both blacklists apply, and the result is alphabetically sorted
        assert_eq!(fit.active_names(), vec!["r_tensor".to_string()]);
    }

    #[test]
    fn optimizer_recovers_amplitude_with_profile_errors() {
        // data = fiducial + noise and prediction = amp * fiducial, so the
        // chi-square minimum sits at amp = 1 (cube coordinate 0.5)
        let mut fit = gaussian_fit(Solver::Optimizer);
        let output = fit.run(&RunOptions::default()).unwrap();
        let FitOutput::Point { best, errors } = output else {
            panic!("optimizer path must return a point estimate");
        };
        assert_eq!(best.len(), 1);
        assert_abs_diff_eq!(best[0], 1.0, epsilon = 1e-3);
        // chi2(amp) = 4 (amp - 1)^2: the chi2_min + 1 crossing is 0.5 away,
        // and the cube half-width 0.25 passes through the range map
        assert_abs_diff_eq!(errors[0], 0.5, epsilon = 0.05);
    }

    #[test]
    fn optimizer_accepts_a_start_already_at_the_minimum() {
        // with the range [0.5, 1.5] the cube midpoint is amp = 1, the exact
        // chi-square zero; COBYLA then stops roundoff-limited and the result
        // must still be reported, not turned into a failure
        let (data, fiducial, noise, covariance) = tensors();
        let mut fit = Fit::gaussian(
            data,
            fiducial,
            noise,
            covariance,
            None,
            Some(amplitude_model((0.5, 1.5))),
            Solver::Optimizer,
        )
        .unwrap();
        let FitOutput::Point { best, .. } = fit.run(&RunOptions::default()).unwrap() else {
            panic!("optimizer path must return a point estimate");
        };
        assert_abs_diff_eq!(best[0], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn run_can_be_repeated_on_the_same_fit() {
        // each run borrows the models and the freshly computed name list for
        // its own duration only
        let mut fit = gaussian_fit(Solver::Optimizer);
        let FitOutput::Point { best: first, .. } = fit.run(&RunOptions::default()).unwrap() else {
            panic!("optimizer path must return a point estimate");
        };
        let FitOutput::Point { best: second, .. } = fit.run(&RunOptions::default()).unwrap()
        else {
            panic!("optimizer path must return a point estimate");
        };
        assert_abs_diff_eq!(first[0], second[0], epsilon = 1e-6);
    }

    #[test]
    fn debug_output_reports_model_attachment() {
        let fit = gaussian_fit(Solver::Optimizer);
        let debug = format!("{fit:?}");
        assert!(debug.contains("background: false"), "{debug}");
        assert!(debug.contains("foreground: true"), "{debug}");
        assert!(debug.contains("amp"), "{debug}");
    }

    #[test]
    fn ensemble_samples_concentrate_near_truth() {
        let mut fit = gaussian_fit(Solver::EnsembleSampler);
        let options = RunOptions {
            ensemble: EnsembleOptions::new(20, 600, Some(13)),
            ..Default::default()
        };
        let output = fit.run(&options).unwrap();
        let FitOutput::Samples(samples) = output else {
            panic!("ensemble path must return samples");
        };
        assert_eq!(samples.ncols(), 1);
        let mean = samples.column(0).mean().unwrap();
        // posterior sigma is 0.35, the sample mean lands near amp = 1
        assert_abs_diff_eq!(mean, 1.0, epsilon = 0.2);
    }

    #[test]
    fn short_ensemble_run_is_extended_to_convergence() {
        let mut fit = gaussian_fit(Solver::EnsembleSampler);
        let options = RunOptions {
            // nsteps far below 50 tau for any tau >= 1 forces the re-run
            ensemble: EnsembleOptions::new(10, 40, Some(2)),
            ..Default::default()
        };
        let output = fit.run(&options).unwrap();
        let FitOutput::Samples(samples) = output else {
            panic!("ensemble path must return samples");
        };
        // the corrective run is 100 tau steps with a 10 tau discard, which
        // always exceeds what the requested 40 steps could have produced
        assert!(samples.nrows() > 40 * 10, "nrows = {}", samples.nrows());
    }

    #[test]
    fn nested_run_remaps_samples_to_physical_units() {
        let mut fit = gaussian_fit(Solver::NestedSampler);
        let options = RunOptions {
            nested: NestedOptions::new(50, 0.05, 10_000, 10, Some(3)),
            ..Default::default()
        };
        let output = fit.run(&options).unwrap();
        let FitOutput::Nested(results) = output else {
            panic!("nested path must return nested results");
        };
        assert_eq!(results.samples.ncols(), 1);
        // physical units: amp lives in [0, 2], and late dead points cluster
        // near the maximum-likelihood amplitude
        assert!(results.samples.iter().all(|&v| (0.0..=2.0).contains(&v)));
        let last = results.samples[[results.samples.nrows() - 1, 0]];
        assert_abs_diff_eq!(last, 1.0, epsilon = 0.5);
        assert!(results.logz.is_finite());
    }

    #[test]
    fn hamimeche_lewis_fit_runs_end_to_end() {
        let (data, fiducial, noise, covariance) = tensors();
        let mut fit = Fit::hamimeche_lewis(
            data,
            fiducial,
            noise,
            covariance,
            None,
            Some(amplitude_model((0.5, 1.5))),
            Solver::Optimizer,
            None,
        )
        .unwrap();
        let output = fit.run(&RunOptions::default()).unwrap();
        let FitOutput::Point { best, .. } = output else {
            panic!("optimizer path must return a point estimate");
        };
        assert_abs_diff_eq!(best[0], 1.0, epsilon = 1e-2);
    }

    #[test]
    fn attaching_a_model_remerges_parameters() {
        let mut fit = gaussian_fit(Solver::Optimizer);
        assert!(!fit.params().contains_key("r_tensor"));
        let mut bg = CountingModel::amplitude("r_tensor", (0.0, 0.5), Array4::zeros(SHAPE));
        bg.declare("amp", 1.0, (0.0, 2.0));
        fit.set_background(Box::new(bg));
        assert!(fit.params().contains_key("r_tensor"));
        assert_eq!(fit.param_ranges()["r_tensor"], (0.0, 0.5));
    }
}

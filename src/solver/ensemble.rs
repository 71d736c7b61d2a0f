//! Affine-invariant ensemble MCMC engine and its fit adapter.
//!
//! The engine implements the Goodman & Weare (2010) stretch move with an
//! emcee-like surface: run/reset/flat-chain retrieval plus integrated
//! autocorrelation-time estimation, which the adapter uses to decide whether
//! the chain is converged enough or needs an extension re-run.

use crate::error::FitError;
use crate::objective::Objective;
use crate::range::unit_to_physical;

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Ensemble-sampler configuration.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename = "Ensemble")]
pub struct EnsembleOptions {
    #[serde(default = "EnsembleOptions::default_nwalkers")]
    pub nwalkers: usize,
    #[serde(default = "EnsembleOptions::default_nsteps")]
    pub nsteps: usize,
    /// Seed for the walker initialization and proposal stream; `None` draws
    /// one from the OS.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl EnsembleOptions {
    /// Create a new [EnsembleOptions].
    ///
    /// # Arguments
    /// - `nwalkers`: ensemble size, even and at least 4 (the stretch move
    ///   splits the ensemble into two halves)
    /// - `nsteps`: length of the main sampling run
    /// - `seed`: optional RNG seed for reproducibility
    pub fn new(nwalkers: usize, nsteps: usize, seed: Option<u64>) -> Self {
        assert!(nwalkers >= 4, "nwalkers must be at least 4");
        assert!(nwalkers % 2 == 0, "nwalkers must be even");
        assert!(nsteps >= 10, "nsteps must be at least 10");
        Self {
            nwalkers,
            nsteps,
            seed,
        }
    }

    #[inline]
    pub fn default_nwalkers() -> usize {
        100
    }

    #[inline]
    pub fn default_nsteps() -> usize {
        10000
    }
}

impl Default for EnsembleOptions {
    fn default() -> Self {
        Self::new(Self::default_nwalkers(), Self::default_nsteps(), None)
    }
}

/// Goodman-Weare stretch-move ensemble sampler.
///
/// The log-probability callback may fail; a failure aborts the run and
/// propagates to the caller (a NaN residual is a data problem, not a bad
/// sample).
pub struct EnsembleSampler<F>
where
    F: FnMut(&[f64]) -> Result<f64, FitError>,
{
    nwalkers: usize,
    ndim: usize,
    ln_prob: F,
    /// Stretch-move scale parameter, 2.0 per Goodman & Weare.
    a: f64,
    rng: StdRng,
    chain: Vec<Array2<f64>>,
}

impl<F> EnsembleSampler<F>
where
    F: FnMut(&[f64]) -> Result<f64, FitError>,
{
    pub fn new(nwalkers: usize, ndim: usize, ln_prob: F, seed: u64) -> Self {
        assert!(nwalkers >= 4, "nwalkers must be at least 4");
        assert!(nwalkers % 2 == 0, "nwalkers must be even");
        assert!(ndim >= 1, "ndim must be positive");
        Self {
            nwalkers,
            ndim,
            ln_prob,
            a: 2.0,
            rng: StdRng::seed_from_u64(seed),
            chain: Vec::new(),
        }
    }

    /// Number of stored steps.
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Discard the stored chain, keeping the sampler ready to continue from
    /// externally held walker positions.
    pub fn reset(&mut self) {
        self.chain.clear();
    }

    /// Advance all walkers by `nsteps` from `start`, appending every step to
    /// the stored chain. Returns the final walker positions.
    pub fn run_mcmc(
        &mut self,
        start: &Array2<f64>,
        nsteps: usize,
    ) -> Result<Array2<f64>, FitError> {
        if start.dim() != (self.nwalkers, self.ndim) {
            return Err(FitError::shape_mismatch(
                "walker start positions",
                [self.nwalkers, self.ndim],
                start.shape(),
            ));
        }
        let mut pos = start.clone();
        let mut ln_probs = Vec::with_capacity(self.nwalkers);
        for k in 0..self.nwalkers {
            ln_probs.push((self.ln_prob)(&pos.row(k).to_vec())?);
        }

        let half = self.nwalkers / 2;
        for _ in 0..nsteps {
            for group in 0..2 {
                let (begin, end) = if group == 0 { (0, half) } else { (half, self.nwalkers) };
                let (comp_begin, comp_end) = if group == 0 {
                    (half, self.nwalkers)
                } else {
                    (0, half)
                };
                for k in begin..end {
                    // z ~ g(z) = 1/sqrt(z) on [1/a, a]
                    let u: f64 = self.rng.random();
                    let z = ((self.a - 1.0) * u + 1.0).powi(2) / self.a;
                    let j = self.rng.random_range(comp_begin..comp_end);

                    let proposal: Vec<f64> = (0..self.ndim)
                        .map(|d| pos[[j, d]] + z * (pos[[k, d]] - pos[[j, d]]))
                        .collect();
                    let ln_new = (self.ln_prob)(&proposal)?;

                    let ln_ratio = (self.ndim as f64 - 1.0) * z.ln() + (ln_new - ln_probs[k]);
                    if ln_ratio >= 0.0 || self.rng.random::<f64>().ln() < ln_ratio {
                        for (d, &value) in proposal.iter().enumerate() {
                            pos[[k, d]] = value;
                        }
                        ln_probs[k] = ln_new;
                    }
                }
            }
            self.chain.push(pos.clone());
        }
        Ok(pos)
    }

    /// Stored chain with the first `discard` steps dropped, flattened across
    /// walkers into a `(steps * nwalkers, ndim)` array.
    pub fn flat_samples(&self, discard: usize) -> Array2<f64> {
        let kept = self.chain.len().saturating_sub(discard);
        let mut flat = Vec::with_capacity(kept * self.nwalkers * self.ndim);
        for step in self.chain.iter().skip(discard) {
            flat.extend(step.iter().copied());
        }
        Array2::from_shape_vec((kept * self.nwalkers, self.ndim), flat)
            .expect("chain steps share one shape")
    }

    /// Integrated autocorrelation time per parameter, `tau = 1 + 2 sum rho(k)`
    /// over the initial positive sequence of the walker-averaged
    /// autocorrelation.
    pub fn autocorr_time(&self) -> Array1<f64> {
        let nsteps = self.chain.len();
        let mut tau = Array1::ones(self.ndim);
        if nsteps < 4 {
            return tau;
        }
        let max_lag = (nsteps / 2).min(100);
        for d in 0..self.ndim {
            let mut averaged = vec![0.0; max_lag];
            for k in 0..self.nwalkers {
                let walker: Vec<f64> = self.chain.iter().map(|step| step[[k, d]]).collect();
                for (lag, rho) in autocorrelation(&walker, max_lag).into_iter().enumerate() {
                    averaged[lag] += rho / self.nwalkers as f64;
                }
            }
            let mut sum = 0.0;
            for &rho in &averaged {
                if rho <= 0.0 {
                    break;
                }
                sum += rho;
            }
            tau[d] = 1.0 + 2.0 * sum;
        }
        tau
    }
}

/// Normalized autocorrelation at lags `1..=max_lag`.
fn autocorrelation(chain: &[f64], max_lag: usize) -> Vec<f64> {
    let n = chain.len();
    let mean = chain.iter().sum::<f64>() / n as f64;
    let variance = chain.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / n as f64;
    if variance == 0.0 {
        return vec![0.0; max_lag];
    }
    (1..=max_lag)
        .map(|lag| {
            if lag >= n {
                return 0.0;
            }
            let covariance = (0..n - lag)
                .map(|i| (chain[i] - mean) * (chain[i + lag] - mean))
                .sum::<f64>()
                / (n - lag) as f64;
            covariance / variance
        })
        .collect()
}

/// Ensemble-sampler adapter: burn-in, main run, convergence check with an
/// extension re-run when the chain is too short for its autocorrelation
/// time, and unit-to-physical remapping of the returned samples.
pub(crate) fn run_ensemble(
    objective: &mut Objective<'_>,
    options: &EnsembleOptions,
) -> Result<Array2<f64>, FitError> {
    let ndim = objective.ndim();
    let ranges = objective.ranges().to_vec();
    let seed = options
        .seed
        .unwrap_or_else(|| StdRng::from_os_rng().random());
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1));

    let mut sampler =
        EnsembleSampler::new(options.nwalkers, ndim, |cube| objective.log_likelihood(cube), seed);

    // burn-in from uniform-random cube positions, chain discarded but final
    // walker positions kept
    let start = Array2::from_shape_fn((options.nwalkers, ndim), |_| rng.random::<f64>());
    let state = sampler.run_mcmc(&start, (options.nsteps / 10).max(1))?;
    sampler.reset();

    let state = sampler.run_mcmc(&state, options.nsteps)?;
    let tau = sampler.autocorr_time();
    let tau = (tau.mean().unwrap_or(1.0).round() as usize).max(1);
    if options.nsteps < 50 * tau {
        // under-converged: discard and re-run longer from the last state
        sampler.reset();
        sampler.run_mcmc(&state, 100 * tau)?;
    }

    let discard = (10 * tau).min(sampler.len().saturating_sub(1));
    let mut samples = sampler.flat_samples(discard);
    for (d, &range) in ranges.iter().enumerate() {
        samples
            .column_mut(d)
            .mapv_inplace(|u| unit_to_physical(u, range));
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;

    #[test]
    fn recovers_gaussian_target_mean() {
        let ln_prob = |x: &[f64]| -> Result<f64, FitError> {
            Ok(-0.5 * ((x[0] - 0.4) / 0.05).powi(2))
        };
        let mut sampler = EnsembleSampler::new(20, 1, ln_prob, 7);
        let start = Array2::from_shape_fn((20, 1), |(k, _)| 0.3 + 0.01 * k as f64 / 20.0);
        sampler.run_mcmc(&start, 800).unwrap();
        let samples = sampler.flat_samples(200);
        let mean = samples.column(0).mean().unwrap();
        assert_abs_diff_eq!(mean, 0.4, epsilon = 0.02);
    }

    #[test]
    fn reset_discards_chain_but_not_state() {
        let ln_prob = |_: &[f64]| -> Result<f64, FitError> { Ok(0.0) };
        let mut sampler = EnsembleSampler::new(4, 2, ln_prob, 0);
        let start = Array2::from_elem((4, 2), 0.5);
        let state = sampler.run_mcmc(&start, 10).unwrap();
        assert_eq!(sampler.len(), 10);
        sampler.reset();
        assert!(sampler.is_empty());
        sampler.run_mcmc(&state, 5).unwrap();
        assert_eq!(sampler.len(), 5);
    }

    #[test]
    fn wrong_start_shape_is_rejected() {
        let ln_prob = |_: &[f64]| -> Result<f64, FitError> { Ok(0.0) };
        let mut sampler = EnsembleSampler::new(4, 2, ln_prob, 0);
        let start = Array2::from_elem((4, 3), 0.5);
        let err = sampler.run_mcmc(&start, 1).unwrap_err();
        assert!(matches!(err, FitError::ShapeMismatch { .. }));
    }

    #[test]
    fn callback_failure_aborts_the_run() {
        let ln_prob = |_: &[f64]| -> Result<f64, FitError> {
            Err(FitError::NanEncountered("residual"))
        };
        let mut sampler = EnsembleSampler::new(4, 1, ln_prob, 0);
        let start = Array2::from_elem((4, 1), 0.5);
        assert_eq!(
            sampler.run_mcmc(&start, 1).unwrap_err(),
            FitError::NanEncountered("residual")
        );
    }

    #[test]
    fn autocorr_time_is_short_for_white_noise() {
        let ln_prob = |_: &[f64]| -> Result<f64, FitError> { Ok(0.0) };
        let mut sampler = EnsembleSampler::new(4, 1, ln_prob, 3);
        // inject an independent chain directly
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..500 {
            sampler
                .chain
                .push(Array2::from_shape_fn((4, 1), |_| rng.random::<f64>()));
        }
        let tau = sampler.autocorr_time();
        assert!(tau[0] < 3.0, "white noise should decorrelate fast, tau = {}", tau[0]);
    }
}

//! Nested-sampling engine and its fit adapter.
//!
//! Classic Skilling (2004) nested sampling over the unit cube: the prior
//! transform is the identity (uniform priors in cube space by construction),
//! physical-range mapping happens inside the likelihood evaluator. Live
//! points are replaced by a constrained random walk started from a surviving
//! live point.

use crate::error::FitError;
use crate::objective::Objective;
use crate::range::unit_to_physical;

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Nested-sampler configuration, passed through to the engine.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename = "Nested")]
pub struct NestedOptions {
    /// Number of live points.
    #[serde(default = "NestedOptions::default_nlive")]
    pub nlive: usize,
    /// Termination threshold on the remaining log-evidence contribution.
    #[serde(default = "NestedOptions::default_dlogz")]
    pub dlogz: f64,
    /// Hard cap on the number of likelihood-contour iterations.
    #[serde(default = "NestedOptions::default_maxiter")]
    pub maxiter: usize,
    /// Random-walk proposals per live-point replacement.
    #[serde(default = "NestedOptions::default_walk_steps")]
    pub walk_steps: usize,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl NestedOptions {
    /// Create a new [NestedOptions].
    pub fn new(
        nlive: usize,
        dlogz: f64,
        maxiter: usize,
        walk_steps: usize,
        seed: Option<u64>,
    ) -> Self {
        assert!(nlive >= 2, "nlive must be at least 2");
        assert!(dlogz > 0.0, "dlogz must be positive");
        assert!(dlogz.is_finite(), "dlogz must be finite");
        assert!(maxiter > 0, "maxiter must be positive");
        assert!(walk_steps > 0, "walk_steps must be positive");
        Self {
            nlive,
            dlogz,
            maxiter,
            walk_steps,
            seed,
        }
    }

    #[inline]
    pub fn default_nlive() -> usize {
        500
    }

    #[inline]
    pub fn default_dlogz() -> f64 {
        0.05
    }

    #[inline]
    pub fn default_maxiter() -> usize {
        50_000
    }

    #[inline]
    pub fn default_walk_steps() -> usize {
        25
    }
}

impl Default for NestedOptions {
    fn default() -> Self {
        Self::new(
            Self::default_nlive(),
            Self::default_dlogz(),
            Self::default_maxiter(),
            Self::default_walk_steps(),
            None,
        )
    }
}

/// Full nested-sampling result.
///
/// `samples` rows are the dead points in death order followed by the final
/// live points; `logwt` are the matching unnormalized log importance
/// weights.
#[derive(Clone, Debug, Serialize)]
pub struct NestedResults {
    pub samples: Array2<f64>,
    pub logwt: Array1<f64>,
    pub logl: Array1<f64>,
    pub logz: f64,
    pub logzerr: f64,
    pub niter: usize,
    pub ncall: usize,
}

/// Skilling nested sampler over the unit cube.
pub struct NestedSampler<F>
where
    F: FnMut(&[f64]) -> Result<f64, FitError>,
{
    ndim: usize,
    ln_like: F,
    options: NestedOptions,
    rng: StdRng,
    ncall: usize,
}

impl<F> NestedSampler<F>
where
    F: FnMut(&[f64]) -> Result<f64, FitError>,
{
    pub fn new(ndim: usize, ln_like: F, options: NestedOptions) -> Self {
        assert!(ndim >= 1, "ndim must be positive");
        let seed = options.seed.unwrap_or_else(|| StdRng::from_os_rng().random());
        Self {
            ndim,
            ln_like,
            options,
            rng: StdRng::seed_from_u64(seed),
            ncall: 0,
        }
    }

    /// Run to convergence and return the accumulated results.
    pub fn run(&mut self) -> Result<NestedResults, FitError> {
        let nlive = self.options.nlive;
        let mut live = Array2::from_shape_fn((nlive, self.ndim), |_| self.rng.random::<f64>());
        let mut live_logl = Vec::with_capacity(nlive);
        for k in 0..nlive {
            live_logl.push(self.evaluate(&live.row(k).to_vec())?);
        }

        let mut dead_points: Vec<f64> = Vec::new();
        let mut dead_logl: Vec<f64> = Vec::new();
        let mut dead_logwt: Vec<f64> = Vec::new();

        let mut logz = f64::NEG_INFINITY;
        let mut info = 0.0;
        let mut logvol = 0.0;
        // per-iteration shrinkage X_i = exp(-i / nlive)
        let ln_shrink = -1.0 / nlive as f64;
        let ln_dvol_factor = (1.0 - ln_shrink.exp()).ln();

        let mut niter = 0;
        while niter < self.options.maxiter {
            let worst = argmin(&live_logl);
            let threshold = live_logl[worst];

            let logwt = threshold + logvol + ln_dvol_factor;
            let logz_new = ln_add_exp(logz, logwt);
            info = update_info(info, logz, logz_new, logwt, threshold);
            logz = logz_new;

            dead_points.extend(live.row(worst).iter().copied());
            dead_logl.push(threshold);
            dead_logwt.push(logwt);

            logvol += ln_shrink;
            niter += 1;

            // remaining evidence upper bound from the best live point
            let max_live = live_logl.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            if ln_add_exp(logz, max_live + logvol) - logz < self.options.dlogz {
                break;
            }

            let (position, logl) = self.replace(&live, &live_logl, worst, threshold)?;
            for (d, &value) in position.iter().enumerate() {
                live[[worst, d]] = value;
            }
            live_logl[worst] = logl;
        }

        // surviving live points enter with the final remaining volume split
        // evenly among them
        let ln_final = logvol - (nlive as f64).ln();
        for k in 0..nlive {
            let logwt = live_logl[k] + ln_final;
            let logz_new = ln_add_exp(logz, logwt);
            info = update_info(info, logz, logz_new, logwt, live_logl[k]);
            logz = logz_new;
            dead_points.extend(live.row(k).iter().copied());
            dead_logl.push(live_logl[k]);
            dead_logwt.push(logwt);
        }

        let nsamples = dead_logl.len();
        let samples = Array2::from_shape_vec((nsamples, self.ndim), dead_points)
            .expect("dead points share one dimension");
        Ok(NestedResults {
            samples,
            logwt: Array1::from_vec(dead_logwt),
            logl: Array1::from_vec(dead_logl),
            logz,
            logzerr: (info.max(0.0) / nlive as f64).sqrt(),
            niter,
            ncall: self.ncall,
        })
    }

    fn evaluate(&mut self, cube: &[f64]) -> Result<f64, FitError> {
        self.ncall += 1;
        (self.ln_like)(cube)
    }

    /// Draw a replacement point with `logl > threshold` by a random walk
    /// started from a random surviving live point. If every proposal is
    /// rejected the start point is duplicated, which keeps the run alive at
    /// the cost of some correlation.
    fn replace(
        &mut self,
        live: &Array2<f64>,
        live_logl: &[f64],
        worst: usize,
        threshold: f64,
    ) -> Result<(Vec<f64>, f64), FitError> {
        let nlive = live.nrows();
        let start = loop {
            let k = self.rng.random_range(0..nlive);
            if k != worst || nlive == 1 {
                break k;
            }
        };
        let mut position = live.row(start).to_vec();
        let mut logl = live_logl[start];
        let mut scale = 0.1;
        for _ in 0..self.options.walk_steps {
            let proposal: Vec<f64> = position
                .iter()
                .map(|&x| {
                    let step: f64 = self.rng.sample(StandardNormal);
                    x + scale * step
                })
                .collect();
            if proposal.iter().any(|&u| !(0.0..=1.0).contains(&u)) {
                scale *= 0.9;
                continue;
            }
            let proposal_logl = self.evaluate(&proposal)?;
            if proposal_logl > threshold {
                position = proposal;
                logl = proposal_logl;
                scale = (scale * 1.1).min(1.0);
            } else {
                scale *= 0.9;
            }
        }
        Ok((position, logl))
    }
}

fn argmin(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v < values[best] {
            best = i;
        }
    }
    best
}

fn ln_add_exp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let m = a.max(b);
    m + ((a - m).exp() + (b - m).exp()).ln()
}

/// Information (negative relative entropy) accumulator used for the evidence
/// uncertainty estimate.
fn update_info(info: f64, logz_old: f64, logz_new: f64, logwt: f64, logl: f64) -> f64 {
    let fresh = (logwt - logz_new).exp() * logl;
    let carried = (logz_old - logz_new).exp();
    let carried_term = if carried > 0.0 {
        carried * (info + logz_old)
    } else {
        0.0
    };
    fresh + carried_term - logz_new
}

/// Nested-sampler adapter: runs the engine with the identity prior transform
/// and remaps the sample columns to physical units in place; every other
/// result field passes through unmodified.
pub(crate) fn run_nested(
    objective: &mut Objective<'_>,
    options: &NestedOptions,
) -> Result<NestedResults, FitError> {
    let ndim = objective.ndim();
    let ranges = objective.ranges().to_vec();
    let mut sampler =
        NestedSampler::new(ndim, |cube| objective.log_likelihood(cube), options.clone());
    let mut results = sampler.run()?;
    for (d, &range) in ranges.iter().enumerate() {
        results
            .samples
            .column_mut(d)
            .mapv_inplace(|u| unit_to_physical(u, range));
    }
    Ok(results)
}

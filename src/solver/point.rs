//! COBYLA point-optimizer adapter.
//!
//! Minimizes the chi-square objective over the unit cube with fixed `[0, 1]`
//! bounds per dimension, starting from the cube midpoint, then derives
//! per-parameter error estimates from a profile search for the
//! `chi2_min + 1` crossing. Both the best fit and the errors are mapped to
//! physical units before being returned.

use crate::error::FitError;
use crate::objective::Objective;
use crate::range::unit_to_physical;

use cobyla::{Func, RhoBeg, StopTols, minimize};
use itertools::izip;
use ndarray::Array1;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;

/// Point-optimizer configuration.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename = "Point")]
pub struct PointOptions {
    #[serde(default = "PointOptions::default_niterations")]
    pub niterations: u32,
    #[serde(default = "PointOptions::default_rhobeg")]
    pub rhobeg: f64,
    #[serde(default = "PointOptions::default_ftol_rel")]
    pub ftol_rel: f64,
}

impl PointOptions {
    /// Create a new [PointOptions].
    ///
    /// # Arguments
    /// - `niterations`: maximum number of objective evaluations
    /// - `rhobeg`: initial change to parameters (initial simplex size)
    /// - `ftol_rel`: relative tolerance on the objective for convergence
    pub fn new(niterations: u32, rhobeg: f64, ftol_rel: f64) -> Self {
        assert!(niterations > 0, "niterations must be positive");
        assert!(rhobeg > 0.0, "rhobeg must be positive");
        assert!(rhobeg.is_finite(), "rhobeg must be finite");
        assert!(ftol_rel >= 0.0, "ftol_rel must be non-negative");
        assert!(ftol_rel.is_finite(), "ftol_rel must be finite");
        Self {
            niterations,
            rhobeg,
            ftol_rel,
        }
    }

    #[inline]
    pub fn default_niterations() -> u32 {
        2000
    }

    #[inline]
    pub fn default_rhobeg() -> f64 {
        0.25
    }

    #[inline]
    pub fn default_ftol_rel() -> f64 {
        1e-8
    }
}

impl Default for PointOptions {
    fn default() -> Self {
        Self::new(
            Self::default_niterations(),
            Self::default_rhobeg(),
            Self::default_ftol_rel(),
        )
    }
}

/// Point-optimizer adapter. Returns `(best_fit, errors)` in physical units,
/// ordered like the sorted active-parameter names.
pub(crate) fn run_point(
    objective: &mut Objective<'_>,
    options: &PointOptions,
) -> Result<(Array1<f64>, Array1<f64>), FitError> {
    let ndim = objective.ndim();
    let ranges = objective.ranges().to_vec();

    // COBYLA wants Fn while the objective mutates model state; the RefCell
    // serializes access per the non-reentrancy contract of Objective.
    let cell = RefCell::new(objective);
    let failure: RefCell<Option<FitError>> = RefCell::new(None);
    let func = |x: &[f64], _: &mut ()| -> f64 {
        match cell.borrow_mut().chi_square(x) {
            Ok(value) => value,
            Err(e) => {
                failure.borrow_mut().get_or_insert(e);
                f64::MAX
            }
        }
    };

    let x0 = vec![0.5; ndim];
    let bounds = vec![(0.0, 1.0); ndim];
    let constraints: Vec<&dyn Func<()>> = vec![];
    let stop_tol = StopTols {
        ftol_rel: options.ftol_rel,
        ..StopTols::default()
    };
    let result = minimize(
        func,
        &x0,
        &bounds,
        &constraints,
        (),
        options.niterations as usize,
        RhoBeg::All(options.rhobeg),
        Some(stop_tol),
    );
    if let Some(e) = failure.borrow_mut().take() {
        return Err(e);
    }

    let (best_cube, chi2_min) = match result {
        Ok((status, x, chi2)) => {
            if matches!(
                status,
                cobyla::SuccessStatus::Success
                    | cobyla::SuccessStatus::FtolReached
                    | cobyla::SuccessStatus::XtolReached
            ) {
                (x, chi2)
            } else {
                return Err(FitError::SolverFailed(
                    "cobyla stopped without convergence".into(),
                ));
            }
        }
        // a roundoff-limited stop still carries the best point found; it is
        // the normal outcome when the midpoint start already sits at the
        // minimum
        Err((cobyla::FailStatus::RoundoffLimited, x, chi2)) => (x, chi2),
        Err(_) => {
            return Err(FitError::SolverFailed("cobyla reported failure".into()));
        }
    };

    let objective = cell.into_inner();
    let mut errors_cube = Vec::with_capacity(ndim);
    for i in 0..ndim {
        errors_cube.push(profile_halfwidth(objective, &best_cube, chi2_min, i)?);
    }

    let best = izip!(&best_cube, &ranges)
        .map(|(&u, &range)| unit_to_physical(u, range))
        .collect();
    // errors pass through the same unit-to-physical map as the values
    let errors = izip!(&errors_cube, &ranges)
        .map(|(&u, &range)| unit_to_physical(u, range))
        .collect();
    Ok((best, errors))
}

/// Mean profile half-width of parameter `i` in cube units: bisect for the
/// `chi2_min + 1` crossing on each side with the other coordinates fixed at
/// the best fit; a side with no crossing inside the cube contributes its
/// distance to the bound.
fn profile_halfwidth(
    objective: &mut Objective<'_>,
    best: &[f64],
    chi2_min: f64,
    i: usize,
) -> Result<f64, FitError> {
    let target = chi2_min + 1.0;
    let mut eval = |u: f64| -> Result<f64, FitError> {
        let mut cube = best.to_vec();
        cube[i] = u;
        objective.chi_square(&cube)
    };

    let mut widths = [0.0; 2];
    for (side, &bound) in [1.0, 0.0].iter().enumerate() {
        let center = best[i];
        if eval(bound)? < target {
            widths[side] = (bound - center).abs();
            continue;
        }
        let mut inside = center;
        let mut outside = bound;
        for _ in 0..60 {
            let mid = 0.5 * (inside + outside);
            if eval(mid)? < target {
                inside = mid;
            } else {
                outside = mid;
            }
        }
        widths[side] = (0.5 * (inside + outside) - center).abs();
    }
    Ok(0.5 * (widths[0] + widths[1]))
}

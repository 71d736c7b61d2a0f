//! Residual-to-scalar reduction strategies.
//!
//! Two variants share one residual path and one covariance-weighted
//! reduction; they differ only in how the residual vector is formed. Both
//! expose a log-likelihood form (higher is better) and a chi-square form
//! (lower is better) that never diverge in their residual logic.

use crate::error::FitError;
use crate::vectorize::{gvec, hvec};

use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2, Array4};
use serde::{Deserialize, Serialize};

/// NaN-safe stand-in for `-inf`: the worst finite log-likelihood.
pub(crate) const LN_LIKE_FLOOR: f64 = f64::MIN;

/// NaN-safe stand-in for `+inf`: the worst finite chi-square.
pub(crate) const CHI2_CEILING: f64 = f64::MAX;

/// Statistic strategy selected at [crate::Fit] construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Statistic {
    /// Plain Gaussian residual `predicted + noise - data`.
    Gaussian,
    /// Hamimeche-Lewis residual with an additive offset bias correction,
    /// shaped like the noise tensor.
    HamimecheLewis { offset: Array4<f64> },
}

impl Statistic {
    /// Form the comparison vector for a predicted band-power tensor.
    ///
    /// Fails with a shape error when the prediction does not match the data
    /// tensor, and with a NaN error when the residual itself is not a
    /// number; the latter indicates a data/model inconsistency and is never
    /// silently masked.
    fn residual(
        &self,
        predicted: &Array4<f64>,
        data: &Array4<f64>,
        fiducial: &Array4<f64>,
        noise: &Array4<f64>,
    ) -> Result<Array1<f64>, FitError> {
        if predicted.raw_dim() != data.raw_dim() {
            return Err(FitError::shape_mismatch(
                "predicted band-power",
                data.shape(),
                predicted.shape(),
            ));
        }
        let diff = match self {
            Self::Gaussian => gvec(&(predicted + noise - data)),
            Self::HamimecheLewis { offset } => hvec(
                &(predicted + noise + offset),
                &(data + offset),
                &(fiducial + noise + offset),
            ),
        };
        if diff.iter().any(|x| x.is_nan()) {
            return Err(FitError::NanEncountered("residual"));
        }
        Ok(diff)
    }

    /// Covariance-weighted chi-square of the prediction.
    ///
    /// A NaN produced by the covariance solve (singular or ill-conditioned
    /// covariance at this parameter point) is clamped to [CHI2_CEILING]
    /// rather than propagated: such points occur routinely while a sampler
    /// explores far from the optimum and must not abort the session.
    pub fn chi_square(
        &self,
        predicted: &Array4<f64>,
        data: &Array4<f64>,
        fiducial: &Array4<f64>,
        noise: &Array4<f64>,
        covariance: &Array2<f64>,
    ) -> Result<f64, FitError> {
        let diff = self.residual(predicted, data, fiducial, noise)?;
        Ok(weighted_norm(covariance, &diff).unwrap_or(CHI2_CEILING))
    }

    /// Log-likelihood of the prediction, `-chi2 / 2`, with degenerate
    /// covariance solves clamped to [LN_LIKE_FLOOR] (zero posterior mass).
    pub fn log_likelihood(
        &self,
        predicted: &Array4<f64>,
        data: &Array4<f64>,
        fiducial: &Array4<f64>,
        noise: &Array4<f64>,
        covariance: &Array2<f64>,
    ) -> Result<f64, FitError> {
        let diff = self.residual(predicted, data, fiducial, noise)?;
        Ok(weighted_norm(covariance, &diff)
            .map(|chi2| -0.5 * chi2)
            .unwrap_or(LN_LIKE_FLOOR))
    }
}

/// `diff^T C^-1 diff` via an SVD least-squares solve, never an explicit
/// inverse. `None` signals a degenerate solve.
fn weighted_norm(covariance: &Array2<f64>, diff: &Array1<f64>) -> Option<f64> {
    let n = diff.len();
    let a = DMatrix::from_fn(n, n, |i, j| covariance[[i, j]]);
    let b = DVector::from_iterator(n, diff.iter().copied());
    let solved = a.svd(true, true).solve(&b, f64::EPSILON).ok()?;
    let chi2 = b.dot(&solved);
    if chi2.is_nan() { None } else { Some(chi2) }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, Array4};

    const SHAPE: (usize, usize, usize, usize) = (1, 1, 2, 2);

    fn eye(n: usize) -> Array2<f64> {
        Array2::eye(n)
    }

    #[test]
    fn gaussian_chi_square_vanishes_for_perfect_prediction() {
        let fiducial = Array4::from_shape_fn(SHAPE, |(_, _, i, j)| 1.0 + (2 * i + j) as f64);
        let noise = Array4::from_elem(SHAPE, 0.25);
        let data = &fiducial + &noise;
        let chi2 = Statistic::Gaussian
            .chi_square(&fiducial, &data, &fiducial, &noise, &eye(4))
            .unwrap();
        assert_abs_diff_eq!(chi2, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn gaussian_chi_square_matches_identity_weighted_norm() {
        let fiducial = Array4::from_elem(SHAPE, 1.0);
        let noise = Array4::zeros(SHAPE);
        let data = Array4::from_elem(SHAPE, 1.5);
        // residual is -0.5 in each of the four entries
        let chi2 = Statistic::Gaussian
            .chi_square(&fiducial, &data, &fiducial, &noise, &eye(4))
            .unwrap();
        assert_abs_diff_eq!(chi2, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn log_likelihood_is_half_negative_chi_square() {
        let fiducial = Array4::from_elem(SHAPE, 2.0);
        let noise = Array4::from_elem(SHAPE, 0.1);
        let data = Array4::from_elem(SHAPE, 2.4);
        let stat = Statistic::Gaussian;
        let chi2 = stat
            .chi_square(&fiducial, &data, &fiducial, &noise, &eye(4))
            .unwrap();
        let logl = stat
            .log_likelihood(&fiducial, &data, &fiducial, &noise, &eye(4))
            .unwrap();
        assert_abs_diff_eq!(logl, -0.5 * chi2, epsilon = 1e-12);
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let data = Array4::<f64>::zeros(SHAPE);
        let noise = Array4::<f64>::zeros(SHAPE);
        let predicted = Array4::<f64>::zeros((1, 1, 2, 3));
        let err = Statistic::Gaussian
            .chi_square(&predicted, &data, &data, &noise, &eye(4))
            .unwrap_err();
        assert!(matches!(err, FitError::ShapeMismatch { .. }));
    }

    #[test]
    fn nan_residual_is_a_hard_failure() {
        // Negative band-powers give the Hamimeche-Lewis transform a negative
        // ratio, whose residual is NaN.
        let data = Array4::from_elem(SHAPE, -5.0);
        let fiducial = Array4::from_elem(SHAPE, 1.0);
        let noise = Array4::zeros(SHAPE);
        let stat = Statistic::HamimecheLewis {
            offset: Array4::zeros(SHAPE),
        };
        let err = stat
            .log_likelihood(&fiducial, &data, &fiducial, &noise, &eye(4))
            .unwrap_err();
        assert_eq!(err, FitError::NanEncountered("residual"));
    }

    #[test]
    fn hamimeche_lewis_vanishes_when_data_matches_prediction() {
        let fiducial = Array4::from_elem(SHAPE, 3.0);
        let noise = Array4::from_elem(SHAPE, 0.5);
        let offset = Array4::from_elem(SHAPE, 0.1);
        let data = &fiducial + &noise;
        let stat = Statistic::HamimecheLewis { offset };
        let chi2 = stat
            .chi_square(&fiducial, &data, &fiducial, &noise, &eye(4))
            .unwrap();
        assert_abs_diff_eq!(chi2, 0.0, epsilon = 1e-12);
    }
}

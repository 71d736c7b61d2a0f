//! Vector-transform helpers reshaping band-power tensors into covariance
//! comparison vectors.

use ndarray::{Array1, Array4, Zip};

/// Flatten a residual band-power tensor into the comparison vector, in
/// logical (row-major) order. The covariance matrix rows follow the same
/// ordering.
pub fn gvec(tensor: &Array4<f64>) -> Array1<f64> {
    tensor.iter().copied().collect()
}

/// Hamimeche-Lewis Gaussianized residual vector.
///
/// Band-power estimates are not Gaussian-distributed; the elementwise
/// transform `g(x) = sign(x - 1) sqrt(2 (x - ln x - 1))` of the data-to-model
/// ratio, scaled by the fiducial amplitude, yields a residual whose
/// distribution is close enough to Gaussian for a covariance-weighted
/// quadratic form (Hamimeche & Lewis 2008).
///
/// A non-positive ratio has no real transform and produces NaN, which the
/// statistic layer treats as a hard data/model inconsistency.
pub fn hvec(model: &Array4<f64>, data: &Array4<f64>, fiducial: &Array4<f64>) -> Array1<f64> {
    debug_assert_eq!(model.raw_dim(), data.raw_dim());
    debug_assert_eq!(model.raw_dim(), fiducial.raw_dim());
    let gaussianized = Zip::from(model)
        .and(data)
        .and(fiducial)
        .map_collect(|&m, &d, &f| {
            let x = d / m;
            let g = (x - 1.0).signum() * (2.0 * (x - x.ln() - 1.0)).sqrt();
            g * f
        });
    gvec(&gaussianized)
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;
    use ndarray::Array4;

    #[test]
    fn gvec_is_row_major() {
        let t = Array4::from_shape_fn((1, 2, 1, 2), |(_, i, _, j)| (2 * i + j) as f64);
        let v = gvec(&t);
        assert_eq!(v.to_vec(), vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn hvec_vanishes_at_unit_ratio() {
        let model = Array4::from_elem((1, 1, 2, 2), 3.0);
        let fiducial = Array4::from_elem((1, 1, 2, 2), 7.0);
        let v = hvec(&model, &model.clone(), &fiducial);
        for &x in &v {
            assert_abs_diff_eq!(x, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn hvec_sign_follows_data_excess() {
        let model = Array4::from_elem((1, 1, 1, 1), 1.0);
        let fiducial = Array4::from_elem((1, 1, 1, 1), 1.0);

        let above = Array4::from_elem((1, 1, 1, 1), 2.0);
        assert!(hvec(&model, &above, &fiducial)[0] > 0.0);

        let below = Array4::from_elem((1, 1, 1, 1), 0.5);
        assert!(hvec(&model, &below, &fiducial)[0] < 0.0);
    }

    #[test]
    fn hvec_nan_for_nonpositive_ratio() {
        let model = Array4::from_elem((1, 1, 1, 1), 1.0);
        let data = Array4::from_elem((1, 1, 1, 1), -1.0);
        let fiducial = Array4::from_elem((1, 1, 1, 1), 1.0);
        assert!(hvec(&model, &data, &fiducial)[0].is_nan());
    }
}

//! Contract for foreground and background sky-emission models.

use ndarray::Array4;
use std::collections::{BTreeMap, BTreeSet};

/// A pluggable sky-emission model, either a foreground (dust, synchrotron,
/// ...) or a background (CMB) component.
///
/// The fitting machinery treats models as opaque: it reads their parameter
/// and range dictionaries, pushes parameter updates through [SkyModel::reset]
/// and requests band-power predictions. Ordered map types are required
/// because the unit-cube index assignment relies on deterministic
/// lexicographic iteration over parameter names.
pub trait SkyModel {
    /// Current parameter values, keyed by name.
    fn params(&self) -> &BTreeMap<String, f64>;

    /// Physical `[low, high]` interval for every parameter.
    fn param_ranges(&self) -> &BTreeMap<String, (f64, f64)>;

    /// Parameter names excluded from the fit.
    fn blacklist(&self) -> &BTreeSet<String>;

    /// Update a subset of parameters in place. Unknown names must be
    /// silently ignored: the objective offers every active parameter to both
    /// attached models, and each picks up the names it declares.
    fn reset(&mut self, partial: &BTreeMap<String, f64>);

    /// Predict a band-power tensor shaped like the measured data tensor.
    fn bandpower(&self) -> Array4<f64>;
}

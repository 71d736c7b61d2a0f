//! Linear bijection between the solver-internal unit interval and a physical
//! parameter range.
//!
//! Solvers operate on the unit cube \\([0, 1]^k\\), while models and
//! statistics work in physical units. `low == high` is never a valid range,
//! the caller is responsible for providing non-degenerate intervals.

use num_traits::Float;

/// Map a unit-interval coordinate to the physical range `[low, high]`.
#[inline]
pub fn unit_to_physical<T: Float>(u: T, (low, high): (T, T)) -> T {
    low + u * (high - low)
}

/// Map a physical value back to the unit interval, inverse of
/// [unit_to_physical].
#[inline]
pub fn physical_to_unit<T: Float>(value: T, (low, high): (T, T)) -> T {
    (value - low) / (high - low)
}

//! Common utility functions shared across modules.

/// Wrap a coordinate into the periodic interval `[-length / 2, length / 2)`.
#[inline(always)]
pub fn wrap_centered(x: f64, length: f64) -> f64 {
    let half = 0.5 * length;
    let wrapped = (x + half).rem_euclid(length) - half;
    // rem_euclid can round up to `length` for tiny negative inputs
    if wrapped >= half {
        -half
    } else {
        wrapped
    }
}

/// Periodic index into a ring of `n` cells.
#[inline(always)]
pub fn wrap_index(i: isize, n: usize) -> usize {
    i.rem_euclid(n as isize) as usize
}

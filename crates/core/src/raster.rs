//! 3D rasterization of particle positions for numerical microscopy.
//!
//! Positions are binned into a cubic periodic grid spanning
//! `[-box_size / 2, box_size / 2]` on every axis, then optionally blurred
//! with a Gaussian point-spread function under wrap-around boundaries.
//! The grid is indexed `[z, y, x]`.

use log::debug;
use ndarray::Array3;
use rayon::prelude::*;

use crate::config::RasterConfig;
use crate::error::RasterError;
use crate::util::{wrap_centered, wrap_index};

/// Gaussian kernels are truncated at this many standard deviations.
pub const TRUNCATE: f64 = 4.0;

/// Largest grid `rasterize` allocates, in voxels (512^3).
pub const MAX_VOXELS: usize = 1 << 27;

/// Number of voxels along each edge of the grid.
pub fn voxel_count(box_size: f64, config: &RasterConfig) -> Result<usize, RasterError> {
    config.validate()?;
    if !(box_size.is_finite() && box_size > 0.0) {
        return Err(RasterError::invalid(
            "box_size",
            format!("must be positive, got {}", box_size),
        ));
    }
    let n = (box_size / config.voxel_size()).floor();
    if n < 1.0 {
        return Err(RasterError::invalid(
            "resolution",
            format!(
                "voxels of {} model units do not fit in a box of {}",
                config.voxel_size(),
                box_size
            ),
        ));
    }
    let n = n as usize;
    match n.checked_pow(3) {
        Some(total) if total <= MAX_VOXELS => Ok(n),
        _ => Err(RasterError::invalid(
            "box_size",
            format!(
                "{}^3 voxels exceeds the limit of {} voxels, use a coarser resolution",
                n, MAX_VOXELS
            ),
        )),
    }
}

/// Rasterize `positions` into an `n x n x n` voxel grid.
///
/// # Arguments
/// * `positions` - Particle positions in model units
/// * `box_size` - Edge length of the periodic box in model units
/// * `config` - Voxel size, blur width and normalization
///
/// # Returns
/// Voxel grid indexed `[z, y, x]`
pub fn rasterize(
    positions: &[[f64; 3]],
    box_size: f64,
    config: &RasterConfig,
) -> Result<Array3<f64>, RasterError> {
    let n = voxel_count(box_size, config)?;
    let width = box_size / n as f64;
    let half = 0.5 * box_size;

    let mut raster = Array3::<f64>::zeros((n, n, n));
    for (i, p) in positions.iter().enumerate() {
        if !p.iter().all(|c| c.is_finite()) {
            return Err(RasterError::invalid(
                "positions",
                format!("particle {} has non-finite coordinates {:?}", i, p),
            ));
        }
        let bin = |c: f64| (((wrap_centered(c, box_size) + half) / width) as usize).min(n - 1);
        raster[[bin(p[2]), bin(p[1]), bin(p[0])]] += 1.0;
    }

    if config.gaussian_width > 0.0 {
        scale_to_unit_max(&mut raster);
        raster = gaussian_filter(&raster, config.sigma_voxels())?;
    }
    if config.normalize {
        scale_to_unit_max(&mut raster);
    }

    debug!(
        "rasterized {} particles into {}^3 voxels (sigma {} voxels)",
        positions.len(),
        n,
        config.sigma_voxels().max(0.0)
    );
    Ok(raster)
}

/// Normalized 1D Gaussian weights over `[-radius, radius]`.
pub fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = (TRUNCATE * sigma + 0.5) as usize;
    let inv = -0.5 / (sigma * sigma);
    let mut weights: Vec<f64> = (0..=2 * radius)
        .map(|t| {
            let x = t as f64 - radius as f64;
            (inv * x * x).exp()
        })
        .collect();
    let total: f64 = weights.iter().sum();
    for w in &mut weights {
        *w /= total;
    }
    weights
}

/// Separable Gaussian blur with periodic boundaries on all three axes.
pub fn gaussian_filter(raster: &Array3<f64>, sigma: f64) -> Result<Array3<f64>, RasterError> {
    if !(sigma.is_finite() && sigma > 0.0) {
        return Err(RasterError::invalid(
            "sigma",
            format!("must be positive, got {}", sigma),
        ));
    }
    let kernel = gaussian_kernel(sigma);
    let mut out = raster.clone();
    for axis in 0..3 {
        out = convolve_axis(&out, &kernel, axis)?;
    }
    Ok(out)
}

fn convolve_axis(
    input: &Array3<f64>,
    kernel: &[f64],
    axis: usize,
) -> Result<Array3<f64>, RasterError> {
    let (d0, d1, d2) = input.dim();
    let radius = (kernel.len() / 2) as isize;

    let data: Vec<f64> = (0..d0 * d1 * d2)
        .into_par_iter()
        .map(|flat| {
            let i = flat / (d1 * d2);
            let j = (flat / d2) % d1;
            let k = flat % d2;
            kernel
                .iter()
                .enumerate()
                .map(|(t, w)| {
                    let offset = t as isize - radius;
                    let idx = match axis {
                        0 => [wrap_index(i as isize + offset, d0), j, k],
                        1 => [i, wrap_index(j as isize + offset, d1), k],
                        _ => [i, j, wrap_index(k as isize + offset, d2)],
                    };
                    w * input[idx]
                })
                .sum::<f64>()
        })
        .collect();

    Array3::from_shape_vec((d0, d1, d2), data)
        .map_err(|e| RasterError::invalid("raster", e.to_string()))
}

fn scale_to_unit_max(raster: &mut Array3<f64>) {
    let max = raster.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max > 0.0 {
        raster.mapv_inplace(|v| v / max);
    }
}

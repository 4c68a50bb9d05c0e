//! Projection of voxel grids onto 2D RGB images.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use colorous::Gradient;
use image::{Rgb, RgbImage};
use log::debug;
use ndarray::{Array2, Array3, Axis};
use palette::{Mix, Srgb};
use serde::{Deserialize, Serialize};

use crate::config::ProjectionConfig;
use crate::error::RasterError;

// ---------------------------------------------------------------------------
// Colormaps
// ---------------------------------------------------------------------------

/// Named colormaps. `Viridis`, `Magma` and `Greys` use the matplotlib
/// gradients, `Gray` is a linear ramp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Colormap {
    Viridis,
    Magma,
    /// Black to white.
    Gray,
    /// White to black.
    Greys,
}

impl Colormap {
    /// Colour at `t`, clipped to `[0, 1]`. NaN maps to black.
    pub fn map(self, t: f64) -> [f64; 3] {
        if t.is_nan() {
            return [0.0; 3];
        }
        let t = t.clamp(0.0, 1.0);
        let color: Srgb<f64> = match self {
            Colormap::Viridis => sample(&colorous::VIRIDIS, t),
            Colormap::Magma => sample(&colorous::MAGMA, t),
            Colormap::Greys => sample(&colorous::GREYS, t),
            Colormap::Gray => Srgb::new(0.0, 0.0, 0.0).mix(Srgb::new(1.0, 1.0, 1.0), t),
        };
        [color.red, color.green, color.blue]
    }

    pub fn name(self) -> &'static str {
        match self {
            Colormap::Viridis => "viridis",
            Colormap::Magma => "magma",
            Colormap::Gray => "gray",
            Colormap::Greys => "greys",
        }
    }
}

impl FromStr for Colormap {
    type Err = RasterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "viridis" => Ok(Colormap::Viridis),
            "magma" => Ok(Colormap::Magma),
            "gray" | "grey" => Ok(Colormap::Gray),
            "greys" => Ok(Colormap::Greys),
            _ => Err(RasterError::UnknownColormap(s.to_string())),
        }
    }
}

fn sample(gradient: &Gradient, t: f64) -> Srgb<f64> {
    let c = gradient.eval_continuous(t);
    Srgb::new(c.r, c.g, c.b).into_format()
}

impl fmt::Display for Colormap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

/// How voxels along the projection axis combine into one pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectionMode {
    /// Maximum intensity projection.
    Max,
    /// Summed intensity projection.
    Sum,
}

impl FromStr for ProjectionMode {
    type Err = RasterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "max" => Ok(ProjectionMode::Max),
            "sum" => Ok(ProjectionMode::Sum),
            _ => Err(RasterError::UnknownProjection(s.to_string())),
        }
    }
}

/// Collapse `axis` of the raster.
pub fn project(
    raster: &Array3<f64>,
    mode: ProjectionMode,
    axis: usize,
) -> Result<Array2<f64>, RasterError> {
    if axis > 2 {
        return Err(RasterError::invalid(
            "axis",
            format!("must be 0, 1 or 2, got {}", axis),
        ));
    }
    if raster.is_empty() {
        return Err(RasterError::invalid("raster", "raster is empty"));
    }
    let image = match mode {
        ProjectionMode::Max => raster.map_axis(Axis(axis), |lane| {
            lane.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
        }),
        ProjectionMode::Sum => raster.sum_axis(Axis(axis)),
    };
    Ok(image)
}

/// Project voxels onto pixels and map intensities to RGB.
///
/// # Returns
/// Image of shape `(rows, cols, 3)` with channels in `[0, 1]`
pub fn voxels_to_pixels_rgb(
    raster: &Array3<f64>,
    config: &ProjectionConfig,
) -> Result<Array3<f64>, RasterError> {
    let image = project(raster, config.mode, config.axis)?;

    let vmin = config
        .vmin
        .unwrap_or_else(|| image.iter().cloned().fold(f64::INFINITY, f64::min));
    let vmax = config
        .vmax
        .unwrap_or_else(|| image.iter().cloned().fold(f64::NEG_INFINITY, f64::max));
    let range = vmax - vmin;

    let (rows, cols) = image.dim();
    let mut rgb = Array3::<f64>::zeros((rows, cols, 3));
    for ((r, c), &value) in image.indexed_iter() {
        let t = if range == 0.0 {
            0.0
        } else {
            (value - vmin) / range
        };
        let color = config.colormap.map(t);
        for (channel, v) in color.iter().enumerate() {
            rgb[[r, c, channel]] = *v;
        }
    }

    debug!(
        "projected {:?} along axis {} into {}x{} pixels ({})",
        config.mode, config.axis, rows, cols, config.colormap
    );
    Ok(rgb)
}

/// Convert a `(rows, cols, 3)` float image to 8-bit RGB.
pub fn to_rgb_image(pixels: &Array3<f64>) -> Result<RgbImage, RasterError> {
    let (rows, cols, channels) = pixels.dim();
    if channels != 3 {
        return Err(RasterError::invalid(
            "pixels",
            format!("expected 3 channels, got {}", channels),
        ));
    }
    let to_u8 = |v: f64| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    Ok(RgbImage::from_fn(cols as u32, rows as u32, |x, y| {
        let (r, c) = (y as usize, x as usize);
        Rgb([
            to_u8(pixels[[r, c, 0]]),
            to_u8(pixels[[r, c, 1]]),
            to_u8(pixels[[r, c, 2]]),
        ])
    }))
}

/// Write a `(rows, cols, 3)` float image as PNG.
pub fn save_png<P: AsRef<Path>>(pixels: &Array3<f64>, path: P) -> Result<(), RasterError> {
    to_rgb_image(pixels)?
        .save_with_format(path.as_ref(), image::ImageFormat::Png)
        .map_err(|e| RasterError::Image(e.to_string()))
}

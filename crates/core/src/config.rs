//! Parameter sets for rasterization and projection.
//!
//! Both structs deserialize from partial documents: missing fields take
//! their defaults.

use serde::{Deserialize, Serialize};

use crate::error::RasterError;
use crate::projection::{Colormap, ProjectionMode};

/// Settings for [`crate::raster::rasterize`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RasterConfig {
    /// Edge length of one output voxel, in nm.
    pub resolution: f64,
    /// Size of one model length unit, in nm.
    pub length_unit: f64,
    /// Width of the Gaussian point-spread function, in nm. Values `<= 0`
    /// return the raw counts.
    pub gaussian_width: f64,
    /// Scale the result so the brightest voxel is 1.
    pub normalize: bool,
}

impl Default for RasterConfig {
    fn default() -> Self {
        Self {
            resolution: 100.0,
            length_unit: 50.0,
            gaussian_width: 250.0,
            normalize: false,
        }
    }
}

impl RasterConfig {
    pub fn validate(&self) -> Result<(), RasterError> {
        if !(self.resolution.is_finite() && self.resolution > 0.0) {
            return Err(RasterError::invalid(
                "resolution",
                format!("must be positive, got {}", self.resolution),
            ));
        }
        if !(self.length_unit.is_finite() && self.length_unit > 0.0) {
            return Err(RasterError::invalid(
                "length_unit",
                format!("must be positive, got {}", self.length_unit),
            ));
        }
        if !self.gaussian_width.is_finite() {
            return Err(RasterError::invalid(
                "gaussian_width",
                format!("must be finite, got {}", self.gaussian_width),
            ));
        }
        Ok(())
    }

    /// Voxel edge length in model units.
    pub fn voxel_size(&self) -> f64 {
        self.resolution / self.length_unit
    }

    /// Gaussian standard deviation in voxels.
    pub fn sigma_voxels(&self) -> f64 {
        self.gaussian_width / self.resolution
    }
}

/// Settings for [`crate::projection::voxels_to_pixels_rgb`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    pub colormap: Colormap,
    /// Lower end of the colour range; the data minimum when unset.
    pub vmin: Option<f64>,
    /// Upper end of the colour range; the data maximum when unset.
    pub vmax: Option<f64>,
    pub mode: ProjectionMode,
    /// Raster axis collapsed by the projection.
    pub axis: usize,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            colormap: Colormap::Viridis,
            vmin: None,
            vmax: None,
            mode: ProjectionMode::Max,
            axis: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raster_defaults() {
        let config = RasterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.voxel_size(), 2.0);
        assert_eq!(config.sigma_voxels(), 2.5);
    }

    #[test]
    fn test_raster_validation() {
        let config = RasterConfig {
            resolution: 0.0,
            ..RasterConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RasterError::InvalidParameter {
                name: "resolution",
                ..
            })
        ));

        let config = RasterConfig {
            length_unit: -1.0,
            ..RasterConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_documents_use_defaults() {
        let raster: RasterConfig = serde_json::from_str(r#"{"resolution": 50.0}"#).unwrap();
        assert_eq!(raster.resolution, 50.0);
        assert_eq!(raster.length_unit, 50.0);
        assert!(!raster.normalize);

        let projection: ProjectionConfig =
            serde_json::from_str(r#"{"colormap": "magma", "mode": "sum", "vmax": 2.0}"#).unwrap();
        assert_eq!(projection.colormap, Colormap::Magma);
        assert_eq!(projection.mode, ProjectionMode::Sum);
        assert_eq!(projection.vmin, None);
        assert_eq!(projection.vmax, Some(2.0));
        assert_eq!(projection.axis, 2);
    }
}

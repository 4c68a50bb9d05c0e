//! Core library for polykit.
//!
//! Pure Rust implementations with no Python dependencies.
//! Provides the `<path>::<frame>` trajectory loaders, GSD and DCD
//! readers, a GSD writer, and voxel rasterization for numerical
//! microscopy.

pub mod config;
pub mod error;
pub mod projection;
pub mod raster;
pub mod trajectory;
pub mod uri;
pub mod util;

#[cfg(test)]
mod test_util;

pub use config::{ProjectionConfig, RasterConfig};
pub use error::{LoadError, RasterError, TrajectoryError, UriError};
pub use trajectory::{load, load_dcd, load_gsd, load_with, TrajectoryFormat, TrajectoryReader};
pub use uri::TrajectoryUri;

//! Trajectory containers and the `<path>::<frame>` loader functions.
//!
//! Provides native Rust readers for simulation trajectory files:
//! - GSD: HOOMD-blue binary container
//! - DCD: CHARMM/NAMD/LAMMPS binary trajectory format
//!
//! Every loader opens its container for the duration of one call. The
//! reader is dropped, and the file handle released, before the loader
//! returns on every path.

pub mod dcd;
pub mod gsd;

use std::path::Path;

use log::trace;

use crate::error::{LoadError, TrajectoryError};
use crate::uri::TrajectoryUri;

use self::dcd::DcdReader;
use self::gsd::GsdReader;

/// A container format that can serve the positions of a single frame.
pub trait TrajectoryReader: Sized {
    /// Human-readable format name.
    const FORMAT: &'static str;

    /// Open the container read-only.
    fn open(path: &Path) -> Result<Self, TrajectoryError>;

    fn n_frames(&self) -> usize;

    /// Positions of `frame` in container particle order.
    fn positions(&mut self, frame: usize) -> Result<Vec<[f64; 3]>, TrajectoryError>;
}

/// Supported on-disk formats, keyed by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrajectoryFormat {
    Gsd,
    Dcd,
}

impl TrajectoryFormat {
    pub fn from_extension(extension: &str) -> Result<Self, TrajectoryError> {
        match extension.to_ascii_lowercase().as_str() {
            "gsd" => Ok(TrajectoryFormat::Gsd),
            "dcd" => Ok(TrajectoryFormat::Dcd),
            other => Err(TrajectoryError::UnsupportedExtension {
                extension: other.to_string(),
            }),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, TrajectoryError> {
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        Self::from_extension(extension)
    }
}

/// Load one frame through the reader `R`.
pub fn load_with<R: TrajectoryReader>(uri: &str) -> Result<Vec<[f64; 3]>, LoadError> {
    let uri = TrajectoryUri::parse(uri)?;
    read_frame_positions::<R>(&uri).map_err(LoadError::from)
}

fn read_frame_positions<R: TrajectoryReader>(
    uri: &TrajectoryUri,
) -> Result<Vec<[f64; 3]>, TrajectoryError> {
    trace!("loading {} frame {} from `{}`", R::FORMAT, uri.frame(), uri.path().display());
    let mut reader = R::open(uri.path())?;
    let n_frames = reader.n_frames();
    if uri.frame() >= n_frames {
        return Err(TrajectoryError::FrameOutOfRange {
            index: uri.frame(),
            n_frames,
        });
    }
    reader.positions(uri.frame())
}

/// Load particle positions from a GSD frame, e.g. `"traj.gsd::3"`.
pub fn load_gsd(uri: &str) -> Result<Vec<[f64; 3]>, LoadError> {
    load_with::<GsdReader>(uri)
}

/// Load particle positions from a DCD frame, e.g. `"traj.dcd::3"`.
pub fn load_dcd(uri: &str) -> Result<Vec<[f64; 3]>, LoadError> {
    load_with::<DcdReader>(uri)
}

/// Load particle positions, choosing the format from the path extension.
pub fn load(uri: &str) -> Result<Vec<[f64; 3]>, LoadError> {
    let parsed = TrajectoryUri::parse(uri)?;
    match TrajectoryFormat::from_path(parsed.path())? {
        TrajectoryFormat::Gsd => read_frame_positions::<GsdReader>(&parsed),
        TrajectoryFormat::Dcd => read_frame_positions::<DcdReader>(&parsed),
    }
    .map_err(LoadError::from)
}

#[cfg(test)]
mod tests {
    use super::gsd::{GsdWriter, POSITION, STEP};
    use super::*;
    use crate::test_util::scratch_dir;

    const N_FRAMES: usize = 5;
    const N_PARTICLES: usize = 10;

    fn frame_value(frame: usize, particle: usize, axis: usize) -> f32 {
        frame as f32 * 10.0 + particle as f32 + axis as f32 * 0.125
    }

    fn write_sample_gsd(path: &Path) {
        let mut writer = GsdWriter::create_hoomd(path, "polykit-tests").unwrap();
        for frame in 0..N_FRAMES {
            let data: Vec<f32> = (0..N_PARTICLES)
                .flat_map(|p| (0..3).map(move |a| frame_value(frame, p, a)))
                .collect();
            writer.write_chunk(STEP, 1, 1, &[frame as u64]).unwrap();
            writer.write_chunk(POSITION, N_PARTICLES, 3, &data).unwrap();
            writer.end_frame();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_load_gsd_scenario() {
        let dir = scratch_dir("load_gsd_scenario");
        let path = dir.join("traj.gsd");
        write_sample_gsd(&path);

        let positions = load_gsd(&format!("{}::3", path.display())).unwrap();
        assert_eq!(positions.len(), N_PARTICLES);
        for (p, pos) in positions.iter().enumerate() {
            for a in 0..3 {
                assert_eq!(pos[a], frame_value(3, p, a) as f64);
            }
        }

        let err = load_gsd(&format!("{}::5", path.display())).unwrap_err();
        assert!(err.is_out_of_range());

        let err = load_gsd(&format!("{}::abc", path.display())).unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn test_load_matches_direct_indexing() {
        let dir = scratch_dir("load_matches_direct");
        let path = dir.join("traj.gsd");
        write_sample_gsd(&path);

        let mut reader = GsdReader::open(&path).unwrap();
        for frame in 0..N_FRAMES {
            let uri = TrajectoryUri::new(&path, frame).to_string();
            assert_eq!(load(&uri).unwrap(), reader.positions(frame).unwrap());
        }
    }

    #[test]
    fn test_load_parse_failures() {
        for uri in ["traj.gsd", "traj.gsd::1::2", "traj.gsd::-1", "traj.gsd::1.0"] {
            let err = load_gsd(uri).unwrap_err();
            assert!(err.is_parse(), "{uri} should fail to parse");
        }
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = scratch_dir("load_missing");
        let uri = format!("{}::0", dir.join("absent.gsd").display());
        assert!(load_gsd(&uri).unwrap_err().is_io());
        assert!(load(&uri).unwrap_err().is_io());
    }

    #[test]
    fn test_load_dcd_by_extension() {
        let dir = scratch_dir("load_dcd");
        let path = dir.join("traj.dcd");
        let frames = dcd::tests::sample_frames(3, 4);
        std::fs::write(&path, dcd::tests::build_dcd(&frames, None, false, 3)).unwrap();

        let positions = load(&format!("{}::2", path.display())).unwrap();
        assert_eq!(positions, load_dcd(&format!("{}::2", path.display())).unwrap());
        assert_eq!(positions.len(), 4);
        assert_eq!(positions[1], [2.0, 1.0, 4.5]);

        assert!(load(&format!("{}::3", path.display()))
            .unwrap_err()
            .is_out_of_range());
    }

    #[test]
    fn test_unsupported_extension() {
        let err = load("traj.xyz::0").unwrap_err();
        assert!(matches!(
            err,
            LoadError::Trajectory(TrajectoryError::UnsupportedExtension { .. })
        ));
        assert_eq!(
            TrajectoryFormat::from_extension("GSD").unwrap(),
            TrajectoryFormat::Gsd
        );
    }
}

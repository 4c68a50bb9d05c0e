//! Error types shared by the URI parser, trajectory readers and loaders.

use std::io;
use std::num::ParseIntError;
use std::path::PathBuf;

use thiserror::Error;

/// A trajectory identifier that does not have the `<path>::<index>` shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UriError {
    /// The identifier contains no `::` delimiter.
    #[error("missing `::` delimiter in `{uri}`")]
    MissingDelimiter { uri: String },

    /// The identifier contains the delimiter more than once.
    #[error("expected exactly one `::` delimiter in `{uri}`, found {count}")]
    MultipleDelimiters { uri: String, count: usize },

    /// Nothing precedes the delimiter.
    #[error("empty path in `{uri}`")]
    EmptyPath { uri: String },

    /// The frame index is negative.
    #[error("frame index `{index}` is negative")]
    NegativeIndex { index: String },

    /// The frame index is not an integer.
    #[error("frame index `{index}` is not a non-negative integer")]
    InvalidIndex {
        index: String,
        #[source]
        source: ParseIntError,
    },
}

/// Errors raised while opening or reading a trajectory container.
#[derive(Debug, Error)]
pub enum TrajectoryError {
    /// The container could not be opened or read.
    #[error("I/O error on `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The requested frame does not exist.
    #[error("frame {index} out of range for a trajectory with {n_frames} frames")]
    FrameOutOfRange { index: usize, n_frames: usize },

    /// The bytes on disk do not follow the container layout.
    #[error("invalid trajectory file: {0}")]
    InvalidFormat(String),

    /// The file declares a format version this reader does not handle.
    #[error("unsupported {format} version {major}.{minor}")]
    UnsupportedVersion {
        format: &'static str,
        major: u32,
        minor: u32,
    },

    /// A required data chunk is absent from the frame and from its fallbacks.
    #[error("chunk `{name}` not found in frame {frame}")]
    MissingChunk { name: String, frame: usize },

    /// A chunk is stored with a different element type than requested.
    #[error("chunk `{name}` has type {found}, expected {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        found: &'static str,
    },

    /// The path extension does not name a supported container.
    #[error("unsupported trajectory extension `{extension}`")]
    UnsupportedExtension { extension: String },
}

impl TrajectoryError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        TrajectoryError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        TrajectoryError::InvalidFormat(message.into())
    }
}

/// Failure of a loader call.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Uri(#[from] UriError),

    #[error(transparent)]
    Trajectory(#[from] TrajectoryError),
}

impl LoadError {
    /// The identifier itself was malformed.
    pub fn is_parse(&self) -> bool {
        matches!(self, LoadError::Uri(_))
    }

    /// The frame index was past the end of the trajectory.
    pub fn is_out_of_range(&self) -> bool {
        matches!(
            self,
            LoadError::Trajectory(TrajectoryError::FrameOutOfRange { .. })
        )
    }

    /// The container could not be opened or read.
    pub fn is_io(&self) -> bool {
        matches!(self, LoadError::Trajectory(TrajectoryError::Io { .. }))
    }
}

/// Invalid input to the rasterizer or projection helpers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RasterError {
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("unknown colormap `{0}`")]
    UnknownColormap(String),

    #[error("unknown projection mode `{0}`")]
    UnknownProjection(String),

    #[error("failed to write image: {0}")]
    Image(String),
}

impl RasterError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        RasterError::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

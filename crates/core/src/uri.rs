//! Trajectory identifiers of the form `<path>::<frame-index>`.
//!
//! Analysis code addresses a single frame with one string, e.g.
//! `"run/traj.gsd::42"`. The path may itself contain single colons
//! (drive letters) but never the two-character delimiter.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::UriError;

/// Separator between the container path and the frame index.
pub const DELIMITER: &str = "::";

/// A parsed `<path>::<frame-index>` identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrajectoryUri {
    path: PathBuf,
    frame: usize,
}

impl TrajectoryUri {
    pub fn new(path: impl Into<PathBuf>, frame: usize) -> Self {
        Self {
            path: path.into(),
            frame,
        }
    }

    /// Parse an identifier.
    ///
    /// The index tolerates surrounding whitespace and a leading `+`;
    /// a leading `-` is rejected as [`UriError::NegativeIndex`].
    pub fn parse(uri: &str) -> Result<Self, UriError> {
        let count = uri.matches(DELIMITER).count();
        match count {
            0 => {
                return Err(UriError::MissingDelimiter {
                    uri: uri.to_string(),
                })
            }
            1 => {}
            _ => {
                return Err(UriError::MultipleDelimiters {
                    uri: uri.to_string(),
                    count,
                })
            }
        }

        // count == 1 guarantees the split succeeds
        let (path, index) = uri
            .split_once(DELIMITER)
            .ok_or_else(|| UriError::MissingDelimiter {
                uri: uri.to_string(),
            })?;

        if path.is_empty() {
            return Err(UriError::EmptyPath {
                uri: uri.to_string(),
            });
        }

        let trimmed = index.trim();
        if trimmed.starts_with('-') {
            return Err(UriError::NegativeIndex {
                index: index.to_string(),
            });
        }
        let frame = trimmed
            .parse::<usize>()
            .map_err(|source| UriError::InvalidIndex {
                index: index.to_string(),
                source,
            })?;

        Ok(Self {
            path: PathBuf::from(path),
            frame,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frame(&self) -> usize {
        self.frame
    }

    /// Lower-cased extension of the container path, if any.
    pub fn extension(&self) -> Option<String> {
        self.path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }
}

impl FromStr for TrajectoryUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TrajectoryUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.path.display(), DELIMITER, self.frame)
    }
}

//! DCD trajectory file reader.
//!
//! Reads CHARMM/NAMD/X-PLOR/LAMMPS DCD binary trajectories in either byte
//! order. Coordinates are returned in the units stored in the file.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::TrajectoryError;
use crate::trajectory::TrajectoryReader;

/// Size of the first Fortran record (`CORD` + 20 control integers).
const MAIN_BLOCK_SIZE: i32 = 84;
const TITLE_SIZE: usize = 80;
/// Upper bound on the atom count accepted from a header.
const MAX_ATOMS: usize = 100_000_000;

// ============================================================================
// Data Structures
// ============================================================================

/// DCD file header information.
#[derive(Debug, Clone, PartialEq)]
pub struct DcdHeader {
    /// Number of frames, derived from the file length.
    pub n_frames: usize,
    /// Frame count recorded in the header, which writers that crash
    /// mid-run leave stale.
    pub declared_frames: usize,
    pub n_atoms: usize,
    pub start_timestep: i32,
    /// Timesteps between saved frames.
    pub timestep_interval: i32,
    /// Integration timestep in AKMA units.
    pub timestep: f32,
    pub has_unit_cell: bool,
    pub is_charmm: bool,
    pub is_big_endian: bool,
    pub titles: Vec<String>,
    /// Byte offset where frame data begins.
    pub first_frame_offset: u64,
    /// Size in bytes of each frame.
    pub frame_size: usize,
}

/// One DCD frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DcdFrame {
    pub positions: Vec<[f64; 3]>,
    /// `[a, b, c, alpha, beta, gamma]` when the file stores a unit cell.
    pub unit_cell: Option<[f64; 6]>,
}

/// DCD trajectory reader with streaming capability.
pub struct DcdReader<R = BufReader<File>> {
    reader: R,
    path: PathBuf,
    header: DcdHeader,
    current_frame: usize,
}

impl DcdReader<BufReader<File>> {
    /// Open a DCD file for reading.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TrajectoryError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| TrajectoryError::io(path, e))?;
        Self::with_path(BufReader::new(file), path.to_path_buf())
    }
}

impl<R: Read + Seek> DcdReader<R> {
    /// Read a DCD stream from any seekable source.
    pub fn from_reader(reader: R) -> Result<Self, TrajectoryError> {
        Self::with_path(reader, PathBuf::from("<stream>"))
    }

    fn with_path(mut reader: R, path: PathBuf) -> Result<Self, TrajectoryError> {
        let header = read_header(&mut reader, &path)?;
        debug!(
            "opened DCD `{}`: {} frames, {} atoms, unit cell: {}",
            path.display(),
            header.n_frames,
            header.n_atoms,
            header.has_unit_cell
        );
        Ok(Self {
            reader,
            path,
            header,
            current_frame: 0,
        })
    }

    pub fn header(&self) -> &DcdHeader {
        &self.header
    }

    pub fn n_frames(&self) -> usize {
        self.header.n_frames
    }

    pub fn n_atoms(&self) -> usize {
        self.header.n_atoms
    }

    /// Read the next frame. Returns `None` at the end of the trajectory.
    pub fn read_frame(&mut self) -> Result<Option<DcdFrame>, TrajectoryError> {
        if self.current_frame >= self.header.n_frames {
            return Ok(None);
        }

        let frame = read_frame_internal(&mut self.reader, &self.header)
            .map_err(|e| e.at(&self.path))?;
        self.current_frame += 1;
        Ok(Some(frame))
    }

    /// Seek to a specific frame.
    pub fn seek_frame(&mut self, frame: usize) -> Result<(), TrajectoryError> {
        if frame >= self.header.n_frames {
            return Err(TrajectoryError::FrameOutOfRange {
                index: frame,
                n_frames: self.header.n_frames,
            });
        }

        let offset =
            self.header.first_frame_offset + (frame as u64) * (self.header.frame_size as u64);
        self.reader
            .seek(SeekFrom::Start(offset))
            .map_err(|e| TrajectoryError::io(&self.path, e))?;
        self.current_frame = frame;
        Ok(())
    }

    /// Seek to `frame` and read it.
    pub fn read_frame_at(&mut self, frame: usize) -> Result<DcdFrame, TrajectoryError> {
        self.seek_frame(frame)?;
        self.read_frame()?.ok_or(TrajectoryError::FrameOutOfRange {
            index: frame,
            n_frames: self.header.n_frames,
        })
    }

    /// Read all frames into memory.
    pub fn read_all_frames(&mut self) -> Result<Vec<DcdFrame>, TrajectoryError> {
        let mut frames = Vec::with_capacity(self.header.n_frames);
        if self.header.n_frames == 0 {
            return Ok(frames);
        }
        self.seek_frame(0)?;
        while let Some(frame) = self.read_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Current frame index.
    pub fn current_frame(&self) -> usize {
        self.current_frame
    }
}

impl TrajectoryReader for DcdReader<BufReader<File>> {
    const FORMAT: &'static str = "DCD";

    fn open(path: &Path) -> Result<Self, TrajectoryError> {
        DcdReader::open(path)
    }

    fn n_frames(&self) -> usize {
        self.header.n_frames
    }

    fn positions(&mut self, frame: usize) -> Result<Vec<[f64; 3]>, TrajectoryError> {
        self.read_frame_at(frame).map(|f| f.positions)
    }
}

// ============================================================================
// Internal Implementation
// ============================================================================

/// Read failure before the file path is attached.
enum RecordError {
    Io(std::io::Error),
    Invalid(String),
}

impl RecordError {
    fn at(self, path: &Path) -> TrajectoryError {
        match self {
            RecordError::Io(e) => TrajectoryError::io(path, e),
            RecordError::Invalid(message) => TrajectoryError::InvalidFormat(message),
        }
    }
}

impl From<std::io::Error> for RecordError {
    fn from(e: std::io::Error) -> Self {
        RecordError::Io(e)
    }
}

/// Byte-order aware scalar reads.
struct Endian {
    big: bool,
}

impl Endian {
    fn i32<R: Read>(&self, reader: &mut R) -> Result<i32, RecordError> {
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf)?;
        Ok(if self.big {
            i32::from_be_bytes(buf)
        } else {
            i32::from_le_bytes(buf)
        })
    }

    fn f32<R: Read>(&self, reader: &mut R) -> Result<f32, RecordError> {
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf)?;
        Ok(if self.big {
            f32::from_be_bytes(buf)
        } else {
            f32::from_le_bytes(buf)
        })
    }

    fn f64<R: Read>(&self, reader: &mut R) -> Result<f64, RecordError> {
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf)?;
        Ok(if self.big {
            f64::from_be_bytes(buf)
        } else {
            f64::from_le_bytes(buf)
        })
    }

    /// Read a Fortran record marker and check it against `expected`.
    fn marker<R: Read>(
        &self,
        reader: &mut R,
        expected: usize,
        what: &str,
    ) -> Result<(), RecordError> {
        let size = self.i32(reader)?;
        if size < 0 || size as usize != expected {
            return Err(RecordError::Invalid(format!(
                "{} record has size {}, expected {}",
                what, size, expected
            )));
        }
        Ok(())
    }
}

/// Detect byte order from the first record marker, which must be 84.
fn detect_endianness<R: Read + Seek>(reader: &mut R) -> Result<Endian, RecordError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    reader.seek(SeekFrom::Current(-4))?;

    let le_val = i32::from_le_bytes(buf);
    let be_val = i32::from_be_bytes(buf);
    if le_val == MAIN_BLOCK_SIZE {
        Ok(Endian { big: false })
    } else if be_val == MAIN_BLOCK_SIZE {
        Ok(Endian { big: true })
    } else {
        Err(RecordError::Invalid(format!(
            "first block size is {} (LE) or {} (BE), expected {}",
            le_val, be_val, MAIN_BLOCK_SIZE
        )))
    }
}

fn read_header<R: Read + Seek>(reader: &mut R, path: &Path) -> Result<DcdHeader, TrajectoryError> {
    let (mut header, endian) = read_header_blocks(reader).map_err(|e| e.at(path))?;

    // The header frame count is unreliable, trust the file length
    let file_len = reader
        .seek(SeekFrom::End(0))
        .map_err(|e| TrajectoryError::io(path, e))?;
    let data_len = file_len.saturating_sub(header.first_frame_offset);
    let n_frames = (data_len / header.frame_size as u64) as usize;
    if data_len % header.frame_size as u64 != 0 {
        warn!(
            "`{}` ends with a partial frame ({} trailing bytes)",
            path.display(),
            data_len % header.frame_size as u64
        );
    }
    if n_frames != header.declared_frames {
        warn!(
            "`{}` header declares {} frames but the file holds {}",
            path.display(),
            header.declared_frames,
            n_frames
        );
    }
    header.n_frames = n_frames;
    header.is_big_endian = endian.big;

    reader
        .seek(SeekFrom::Start(header.first_frame_offset))
        .map_err(|e| TrajectoryError::io(path, e))?;
    Ok(header)
}

fn read_header_blocks<R: Read + Seek>(reader: &mut R) -> Result<(DcdHeader, Endian), RecordError> {
    let endian = detect_endianness(reader)?;

    // First block: magic + 20 control integers
    endian.marker(reader, MAIN_BLOCK_SIZE as usize, "header")?;
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != b"CORD" {
        return Err(RecordError::Invalid(format!("bad DCD magic {:?}", magic)));
    }

    // slot 9 holds the float timestep, reinterpreted below
    let mut control = [0i32; 20];
    for slot in control.iter_mut() {
        *slot = endian.i32(reader)?;
    }
    let declared_frames = usize::try_from(control[0])
        .map_err(|_| RecordError::Invalid(format!("invalid number of frames: {}", control[0])))?;
    let start_timestep = control[1];
    let timestep_interval = control[2];
    let n_fixed = control[8];
    let timestep = if endian.big {
        f32::from_be_bytes(control[9].to_be_bytes())
    } else {
        f32::from_le_bytes(control[9].to_le_bytes())
    };
    let has_unit_cell = control[10] != 0;
    let is_charmm = control[19] != 0;

    if n_fixed != 0 {
        return Err(RecordError::Invalid(format!(
            "DCD files with {} fixed atoms are not supported",
            n_fixed
        )));
    }
    endian.marker(reader, MAIN_BLOCK_SIZE as usize, "header")?;

    // Second block: titles
    let block2_size = endian.i32(reader)?;
    if block2_size < 4 {
        return Err(RecordError::Invalid(format!(
            "invalid title block size: {}",
            block2_size
        )));
    }
    let position = reader.stream_position()?;
    let stream_len = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(position))?;
    if block2_size as u64 + 4 > stream_len.saturating_sub(position) {
        return Err(RecordError::Invalid(format!(
            "title block of {} bytes runs past the end of the file",
            block2_size
        )));
    }
    let n_titles = endian.i32(reader)?;
    if n_titles < 0 {
        return Err(RecordError::Invalid(format!(
            "invalid number of titles: {}",
            n_titles
        )));
    }
    let expected_title_bytes = 4 + n_titles as i64 * TITLE_SIZE as i64;
    if expected_title_bytes > block2_size as i64 {
        return Err(RecordError::Invalid(format!(
            "title block holds {} bytes but {} titles need {}",
            block2_size, n_titles, expected_title_bytes
        )));
    }

    let mut titles = Vec::with_capacity(n_titles as usize);
    let mut title_buf = [0u8; TITLE_SIZE];
    for _ in 0..n_titles {
        reader.read_exact(&mut title_buf)?;
        titles.push(
            String::from_utf8_lossy(&title_buf)
                .trim_end_matches(['\0', ' '])
                .to_string(),
        );
    }
    let remaining = block2_size as i64 - expected_title_bytes;
    if remaining > 0 {
        reader.seek(SeekFrom::Current(remaining))?;
    }
    endian.marker(reader, block2_size as usize, "title")?;

    // Third block: atom count
    endian.marker(reader, 4, "atom count")?;
    let n_atoms_i32 = endian.i32(reader)?;
    let n_atoms = usize::try_from(n_atoms_i32)
        .map_err(|_| RecordError::Invalid(format!("invalid number of atoms: {}", n_atoms_i32)))?;
    if n_atoms > MAX_ATOMS {
        return Err(RecordError::Invalid(format!(
            "atom count {} exceeds maximum supported ({})",
            n_atoms, MAX_ATOMS
        )));
    }
    endian.marker(reader, 4, "atom count")?;

    let first_frame_offset = reader.stream_position()?;

    // n_atoms <= MAX_ATOMS keeps this far from overflow
    let coord_block_size = n_atoms * 4 + 8;
    let unit_cell_size = if has_unit_cell { 4 + 48 + 4 } else { 0 };
    let frame_size = coord_block_size * 3 + unit_cell_size;

    let header = DcdHeader {
        n_frames: declared_frames,
        declared_frames,
        n_atoms,
        start_timestep,
        timestep_interval,
        timestep,
        has_unit_cell,
        is_charmm,
        is_big_endian: endian.big,
        titles,
        first_frame_offset,
        frame_size,
    };
    Ok((header, endian))
}

/// Read a single frame from the current position.
fn read_frame_internal<R: Read>(
    reader: &mut R,
    header: &DcdHeader,
) -> Result<DcdFrame, RecordError> {
    let endian = Endian {
        big: header.is_big_endian,
    };
    let n_atoms = header.n_atoms;

    let unit_cell = if header.has_unit_cell {
        endian.marker(reader, 48, "unit cell")?;
        // stored as a, gamma, b, beta, alpha, c
        let mut raw = [0.0f64; 6];
        for value in raw.iter_mut() {
            *value = endian.f64(reader)?;
        }
        endian.marker(reader, 48, "unit cell")?;
        Some([raw[0], raw[2], raw[5], raw[4], raw[3], raw[1]])
    } else {
        None
    };

    let mut axes: [Vec<f32>; 3] = [Vec::new(), Vec::new(), Vec::new()];
    for (axis, name) in axes.iter_mut().zip(["x", "y", "z"]) {
        endian.marker(reader, n_atoms * 4, name)?;
        *axis = (0..n_atoms)
            .map(|_| endian.f32(reader))
            .collect::<Result<Vec<_>, _>>()?;
        endian.marker(reader, n_atoms * 4, name)?;
    }

    let [xs, ys, zs] = &axes;
    let positions = xs
        .iter()
        .zip(ys)
        .zip(zs)
        .map(|((&x, &y), &z)| [x as f64, y as f64, z as f64])
        .collect();

    Ok(DcdFrame {
        positions,
        unit_cell,
    })
}

// ============================================================================
// Public API
// ============================================================================

/// Read the header from a DCD file.
pub fn read_dcd_header<P: AsRef<Path>>(path: P) -> Result<DcdHeader, TrajectoryError> {
    DcdReader::open(path).map(|reader| reader.header)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    /// Serialize a little- or big-endian DCD with the given frames.
    pub(crate) fn build_dcd(
        frames: &[Vec<[f32; 3]>],
        unit_cell: Option<[f64; 6]>,
        big_endian: bool,
        declared_frames: i32,
    ) -> Vec<u8> {
        let n_atoms = frames.first().map_or(0, |f| f.len());
        let mut out = Vec::new();
        let i32b = |v: i32| {
            if big_endian {
                v.to_be_bytes()
            } else {
                v.to_le_bytes()
            }
        };

        out.extend_from_slice(&i32b(84));
        out.extend_from_slice(b"CORD");
        let mut control = [0i32; 20];
        control[0] = declared_frames;
        control[1] = 100;
        control[2] = 10;
        control[9] = if big_endian {
            i32::from_be_bytes(0.5f32.to_be_bytes())
        } else {
            i32::from_le_bytes(0.5f32.to_le_bytes())
        };
        control[10] = unit_cell.is_some() as i32;
        control[19] = 24;
        for v in control {
            out.extend_from_slice(&i32b(v));
        }
        out.extend_from_slice(&i32b(84));

        out.extend_from_slice(&i32b(4 + 80));
        out.extend_from_slice(&i32b(1));
        let mut title = [b' '; 80];
        title[..7].copy_from_slice(b"polymer");
        out.extend_from_slice(&title);
        out.extend_from_slice(&i32b(4 + 80));

        out.extend_from_slice(&i32b(4));
        out.extend_from_slice(&i32b(n_atoms as i32));
        out.extend_from_slice(&i32b(4));

        for frame in frames {
            if let Some([a, b, c, alpha, beta, gamma]) = unit_cell {
                out.extend_from_slice(&i32b(48));
                for v in [a, gamma, b, beta, alpha, c] {
                    if big_endian {
                        out.extend_from_slice(&v.to_be_bytes());
                    } else {
                        out.extend_from_slice(&v.to_le_bytes());
                    }
                }
                out.extend_from_slice(&i32b(48));
            }
            for axis in 0..3 {
                out.extend_from_slice(&i32b(n_atoms as i32 * 4));
                for p in frame {
                    if big_endian {
                        out.extend_from_slice(&p[axis].to_be_bytes());
                    } else {
                        out.extend_from_slice(&p[axis].to_le_bytes());
                    }
                }
                out.extend_from_slice(&i32b(n_atoms as i32 * 4));
            }
        }
        out
    }

    pub(crate) fn sample_frames(n_frames: usize, n_atoms: usize) -> Vec<Vec<[f32; 3]>> {
        (0..n_frames)
            .map(|f| {
                (0..n_atoms)
                    .map(|i| [f as f32, i as f32, (f * n_atoms + i) as f32 * 0.5])
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_read_header_little_endian() {
        let bytes = build_dcd(&sample_frames(3, 4), None, false, 3);
        let reader = DcdReader::from_reader(Cursor::new(bytes)).unwrap();
        let header = reader.header();
        assert_eq!(header.n_frames, 3);
        assert_eq!(header.n_atoms, 4);
        assert_eq!(header.start_timestep, 100);
        assert_eq!(header.timestep_interval, 10);
        assert_eq!(header.timestep, 0.5);
        assert!(header.is_charmm);
        assert!(!header.is_big_endian);
        assert!(!header.has_unit_cell);
        assert_eq!(header.titles, vec!["polymer".to_string()]);
    }

    #[test]
    fn test_read_frames_big_endian_with_unit_cell() {
        let cell = [30.0, 31.0, 32.0, 90.0, 91.0, 92.0];
        let frames = sample_frames(2, 5);
        let bytes = build_dcd(&frames, Some(cell), true, 2);
        let mut reader = DcdReader::from_reader(Cursor::new(bytes)).unwrap();
        assert!(reader.header().is_big_endian);

        let frame = reader.read_frame_at(1).unwrap();
        assert_eq!(frame.unit_cell, Some(cell));
        assert_eq!(frame.positions.len(), 5);
        assert_eq!(frame.positions[3], [1.0, 3.0, 4.0]);
        assert_eq!(reader.current_frame(), 2);
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn test_frame_count_from_file_length() {
        // header claims 0 frames, as an interrupted writer would leave it
        let bytes = build_dcd(&sample_frames(4, 2), None, false, 0);
        let mut reader = DcdReader::from_reader(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.header().declared_frames, 0);
        assert_eq!(reader.n_frames(), 4);
        assert_eq!(reader.read_all_frames().unwrap().len(), 4);
    }

    #[test]
    fn test_seek_out_of_range() {
        let bytes = build_dcd(&sample_frames(2, 2), None, false, 2);
        let mut reader = DcdReader::from_reader(Cursor::new(bytes)).unwrap();
        let err = reader.seek_frame(2).unwrap_err();
        assert!(matches!(
            err,
            TrajectoryError::FrameOutOfRange {
                index: 2,
                n_frames: 2
            }
        ));
    }

    #[test]
    fn test_invalid_first_block() {
        let mut bytes = build_dcd(&sample_frames(1, 1), None, false, 1);
        bytes[0] = 0x10;
        let err = DcdReader::from_reader(Cursor::new(bytes)).err().unwrap();
        assert!(matches!(err, TrajectoryError::InvalidFormat(_)));
    }

    #[test]
    fn test_fixed_atoms_rejected() {
        let mut bytes = build_dcd(&sample_frames(1, 1), None, false, 1);
        // control slot 8 sits after the marker, magic and 8 integers
        let offset = 4 + 4 + 8 * 4;
        bytes[offset..offset + 4].copy_from_slice(&3i32.to_le_bytes());
        let err = DcdReader::from_reader(Cursor::new(bytes)).err().unwrap();
        assert!(matches!(err, TrajectoryError::InvalidFormat(_)));
    }

    #[test]
    fn test_title_block_past_end_of_file() {
        let mut bytes = build_dcd(&sample_frames(1, 1), None, false, 1);
        // title block size and title count follow the 92-byte first block
        let titles = 10_000_000i32;
        bytes[92..96].copy_from_slice(&(4 + 80 * titles).to_le_bytes());
        bytes[96..100].copy_from_slice(&titles.to_le_bytes());
        let err = DcdReader::from_reader(Cursor::new(bytes)).err().unwrap();
        assert!(matches!(err, TrajectoryError::InvalidFormat(_)), "{}", err);
    }
}

//! GSD trajectory file reader and writer.
//!
//! GSD is the binary container written by HOOMD-blue. A file holds a
//! 256-byte header, a list of named, typed 2D data chunks per frame, an
//! index locating every chunk and a namelist mapping chunk names to ids.
//! Frames follow the HOOMD schema: a chunk absent from frame `i` takes its
//! value from frame 0, then from the schema default.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, trace};
use rustc_hash::FxHashMap;

use crate::error::TrajectoryError;
use crate::trajectory::TrajectoryReader;

/// Magic number at the start of every GSD file.
pub const GSD_MAGIC: u64 = 0x65DF_65DF_65DF_65DF;

/// File layout version written by [`GsdWriter`].
pub const GSD_VERSION: u32 = make_version(2, 0);

/// HOOMD schema name and version written by [`GsdWriter::create_hoomd`].
pub const HOOMD_SCHEMA: &str = "hoomd";
pub const HOOMD_SCHEMA_VERSION: u32 = make_version(1, 4);

const HEADER_SIZE: usize = 256;
const INDEX_ENTRY_SIZE: usize = 32;
const HEADER_STRING_SIZE: usize = 64;
/// Fixed namelist entry width used by 1.x files.
const V1_NAME_SIZE: usize = 64;

pub const POSITION: &str = "particles/position";
pub const PARTICLE_COUNT: &str = "particles/N";
pub const TYPE_ID: &str = "particles/typeid";
pub const TYPES: &str = "particles/types";
pub const STEP: &str = "configuration/step";
pub const BOX: &str = "configuration/box";
pub const BONDS_N: &str = "bonds/N";
pub const BOND_GROUP: &str = "bonds/group";

/// Pack a `major.minor` pair the way GSD stores versions.
pub const fn make_version(major: u32, minor: u32) -> u32 {
    (major << 16) | minor
}

fn split_version(version: u32) -> (u32, u32) {
    (version >> 16, version & 0xFFFF)
}

// ============================================================================
// Element Types
// ============================================================================

/// Element type of a chunk, with the on-disk type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GsdType {
    U8 = 1,
    U16 = 2,
    U32 = 3,
    U64 = 4,
    I8 = 5,
    I16 = 6,
    I32 = 7,
    I64 = 8,
    F32 = 9,
    F64 = 10,
    Character = 11,
}

impl GsdType {
    pub fn from_code(code: u8) -> Option<Self> {
        let ty = match code {
            1 => GsdType::U8,
            2 => GsdType::U16,
            3 => GsdType::U32,
            4 => GsdType::U64,
            5 => GsdType::I8,
            6 => GsdType::I16,
            7 => GsdType::I32,
            8 => GsdType::I64,
            9 => GsdType::F32,
            10 => GsdType::F64,
            11 => GsdType::Character,
            _ => return None,
        };
        Some(ty)
    }

    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            GsdType::U8 | GsdType::I8 | GsdType::Character => 1,
            GsdType::U16 | GsdType::I16 => 2,
            GsdType::U32 | GsdType::I32 | GsdType::F32 => 4,
            GsdType::U64 | GsdType::I64 | GsdType::F64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            GsdType::U8 => "uint8",
            GsdType::U16 => "uint16",
            GsdType::U32 => "uint32",
            GsdType::U64 => "uint64",
            GsdType::I8 => "int8",
            GsdType::I16 => "int16",
            GsdType::I32 => "int32",
            GsdType::I64 => "int64",
            GsdType::F32 => "float",
            GsdType::F64 => "double",
            GsdType::Character => "char",
        }
    }
}

/// Rust scalar types that can be stored in a chunk.
pub trait ChunkElement: Copy {
    const TYPE: GsdType;

    /// Decode one element from exactly `TYPE.size()` little-endian bytes.
    fn from_le_slice(bytes: &[u8]) -> Self;

    fn extend_le(self, out: &mut Vec<u8>);
}

macro_rules! chunk_element {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl ChunkElement for $t {
                const TYPE: GsdType = GsdType::$variant;

                fn from_le_slice(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$t>()];
                    buf.copy_from_slice(bytes);
                    <$t>::from_le_bytes(buf)
                }

                fn extend_le(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

chunk_element! {
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    f32 => F32,
    f64 => F64,
}

// ============================================================================
// Data Structures
// ============================================================================

/// GSD file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GsdHeader {
    pub index_location: u64,
    pub index_allocated_entries: u64,
    pub namelist_location: u64,
    /// Bytes of namelist storage (2.x) or number of 64-byte names (1.x).
    pub namelist_allocated_entries: u64,
    pub schema_version: u32,
    pub gsd_version: u32,
    /// Name of the application that wrote the file.
    pub application: String,
    /// Schema the chunk names follow, `"hoomd"` for HOOMD-blue output.
    pub schema: String,
}

impl GsdHeader {
    fn new(application: &str, schema: &str, schema_version: u32) -> Self {
        Self {
            index_location: 0,
            index_allocated_entries: 0,
            namelist_location: 0,
            namelist_allocated_entries: 0,
            schema_version,
            gsd_version: GSD_VERSION,
            application: application.to_string(),
            schema: schema.to_string(),
        }
    }

    fn parse(buf: &[u8; HEADER_SIZE]) -> Result<Self, TrajectoryError> {
        let magic = u64_at(buf, 0);
        if magic != GSD_MAGIC {
            return Err(TrajectoryError::invalid(format!(
                "bad GSD magic number {:#018x}",
                magic
            )));
        }

        let header = Self {
            index_location: u64_at(buf, 8),
            index_allocated_entries: u64_at(buf, 16),
            namelist_location: u64_at(buf, 24),
            namelist_allocated_entries: u64_at(buf, 32),
            schema_version: u32_at(buf, 40),
            gsd_version: u32_at(buf, 44),
            application: c_string(&buf[48..48 + HEADER_STRING_SIZE]),
            schema: c_string(&buf[112..112 + HEADER_STRING_SIZE]),
        };

        let (major, minor) = header.version();
        if !(1..=2).contains(&major) {
            return Err(TrajectoryError::UnsupportedVersion {
                format: "GSD",
                major,
                minor,
            });
        }
        Ok(header)
    }

    fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&GSD_MAGIC.to_le_bytes());
        buf[8..16].copy_from_slice(&self.index_location.to_le_bytes());
        buf[16..24].copy_from_slice(&self.index_allocated_entries.to_le_bytes());
        buf[24..32].copy_from_slice(&self.namelist_location.to_le_bytes());
        buf[32..40].copy_from_slice(&self.namelist_allocated_entries.to_le_bytes());
        buf[40..44].copy_from_slice(&self.schema_version.to_le_bytes());
        buf[44..48].copy_from_slice(&self.gsd_version.to_le_bytes());
        put_c_string(&mut buf[48..48 + HEADER_STRING_SIZE], &self.application);
        put_c_string(&mut buf[112..112 + HEADER_STRING_SIZE], &self.schema);
        buf
    }

    /// `(major, minor)` file layout version.
    pub fn version(&self) -> (u32, u32) {
        split_version(self.gsd_version)
    }

    pub fn schema_version_parts(&self) -> (u32, u32) {
        split_version(self.schema_version)
    }
}

/// Location and shape of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub frame: u64,
    /// Number of rows.
    pub n: u64,
    /// Byte offset of the chunk data; 0 marks an unused slot.
    pub location: i64,
    /// Number of columns.
    pub m: u32,
    /// Namelist id of the chunk name.
    pub id: u16,
    pub type_code: u8,
    pub flags: u8,
}

impl IndexEntry {
    fn parse(buf: &[u8]) -> Self {
        Self {
            frame: u64_at(buf, 0),
            n: u64_at(buf, 8),
            location: u64_at(buf, 16) as i64,
            m: u32_at(buf, 24),
            id: u16::from_le_bytes([buf[28], buf[29]]),
            type_code: buf[30],
            flags: buf[31],
        }
    }

    fn to_bytes(self) -> [u8; INDEX_ENTRY_SIZE] {
        let mut buf = [0u8; INDEX_ENTRY_SIZE];
        buf[0..8].copy_from_slice(&self.frame.to_le_bytes());
        buf[8..16].copy_from_slice(&self.n.to_le_bytes());
        buf[16..24].copy_from_slice(&self.location.to_le_bytes());
        buf[24..28].copy_from_slice(&self.m.to_le_bytes());
        buf[28..30].copy_from_slice(&self.id.to_le_bytes());
        buf[30] = self.type_code;
        buf[31] = self.flags;
        buf
    }

    pub fn gsd_type(&self) -> Option<GsdType> {
        GsdType::from_code(self.type_code)
    }

    fn byte_len(&self) -> Result<usize, TrajectoryError> {
        let ty = self.gsd_type().ok_or_else(|| {
            TrajectoryError::invalid(format!("unknown chunk type code {}", self.type_code))
        })?;
        (self.n as usize)
            .checked_mul(self.m as usize)
            .and_then(|count| count.checked_mul(ty.size()))
            .ok_or_else(|| {
                TrajectoryError::invalid(format!("chunk size overflow: {}x{}", self.n, self.m))
            })
    }
}

/// A decoded chunk: `n` rows of `m` elements, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk<T> {
    pub n: usize,
    pub m: usize,
    pub data: Vec<T>,
}

impl<T: Copy> Chunk<T> {
    pub fn rows(&self) -> impl Iterator<Item = &[T]> {
        self.data.chunks(self.m.max(1))
    }

    pub fn first(&self) -> Option<T> {
        self.data.first().copied()
    }
}

/// One frame read under the HOOMD schema.
#[derive(Debug, Clone, PartialEq)]
pub struct HoomdFrame {
    pub step: u64,
    /// `[Lx, Ly, Lz, xy, xz, yz]`.
    pub box_dims: [f32; 6],
    pub positions: Vec<[f64; 3]>,
    pub typeid: Vec<u32>,
    pub types: Vec<String>,
    pub bonds: Vec<[u32; 2]>,
}

impl HoomdFrame {
    pub fn n_particles(&self) -> usize {
        self.positions.len()
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Random-access GSD reader.
pub struct GsdReader<R = BufReader<File>> {
    reader: R,
    path: PathBuf,
    header: GsdHeader,
    index: Vec<IndexEntry>,
    names: Vec<String>,
    name_ids: FxHashMap<String, u16>,
}

impl GsdReader<BufReader<File>> {
    /// Open a GSD file read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TrajectoryError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| TrajectoryError::io(path, e))?;
        Self::with_path(BufReader::new(file), path.to_path_buf())
    }
}

impl<R: Read + Seek> GsdReader<R> {
    /// Read a GSD stream from any seekable source.
    pub fn from_reader(reader: R) -> Result<Self, TrajectoryError> {
        Self::with_path(reader, PathBuf::from("<stream>"))
    }

    fn with_path(mut reader: R, path: PathBuf) -> Result<Self, TrajectoryError> {
        let mut buf = [0u8; HEADER_SIZE];
        reader
            .read_exact(&mut buf)
            .map_err(|e| TrajectoryError::io(&path, e))?;
        let header = GsdHeader::parse(&buf)?;
        let file_len = reader
            .seek(SeekFrom::End(0))
            .map_err(|e| TrajectoryError::io(&path, e))?;

        let index = read_index(&mut reader, &header, file_len).map_err(|e| e.at(&path))?;
        let names = read_namelist(&mut reader, &header).map_err(|e| e.at(&path))?;
        if names.len() > u16::MAX as usize + 1 {
            return Err(TrajectoryError::invalid(format!(
                "namelist holds {} names, more than a u16 id can address",
                names.len()
            )));
        }
        let name_ids = names
            .iter()
            .enumerate()
            .map(|(id, name)| (name.clone(), id as u16))
            .collect();

        let gsd = Self {
            reader,
            path,
            header,
            index,
            names,
            name_ids,
        };
        debug!(
            "opened GSD `{}`: {} frames, {} chunk names, schema `{}`",
            gsd.path.display(),
            gsd.n_frames(),
            gsd.names.len(),
            gsd.header.schema
        );
        Ok(gsd)
    }

    pub fn header(&self) -> &GsdHeader {
        &self.header
    }

    /// Number of frames, from the last index entry.
    pub fn n_frames(&self) -> usize {
        self.index.last().map_or(0, |e| e.frame as usize + 1)
    }

    /// All chunk names present in the namelist.
    pub fn chunk_names(&self) -> &[String] {
        &self.names
    }

    pub fn find_chunk(&self, frame: usize, name: &str) -> Option<&IndexEntry> {
        let id = *self.name_ids.get(name)?;
        let key = (frame as u64, id);
        self.index
            .binary_search_by_key(&key, |e| (e.frame, e.id))
            .ok()
            .map(|i| &self.index[i])
    }

    pub fn chunk_exists(&self, frame: usize, name: &str) -> bool {
        self.find_chunk(frame, name).is_some()
    }

    /// Read a chunk, checking that its stored type matches `T`.
    pub fn read_chunk<T: ChunkElement>(
        &mut self,
        frame: usize,
        name: &str,
    ) -> Result<Chunk<T>, TrajectoryError> {
        self.check_frame(frame)?;
        let entry = *self
            .find_chunk(frame, name)
            .ok_or_else(|| TrajectoryError::MissingChunk {
                name: name.to_string(),
                frame,
            })?;

        let found = entry.gsd_type().ok_or_else(|| {
            TrajectoryError::invalid(format!(
                "unknown type code {} for `{}`",
                entry.type_code, name
            ))
        })?;
        let compatible =
            found == T::TYPE || (found == GsdType::Character && T::TYPE == GsdType::U8);
        if !compatible {
            return Err(TrajectoryError::TypeMismatch {
                name: name.to_string(),
                expected: T::TYPE.name(),
                found: found.name(),
            });
        }

        let bytes = self.read_entry_bytes(&entry)?;
        trace!(
            "read chunk `{}` frame {}: {}x{} {}",
            name,
            frame,
            entry.n,
            entry.m,
            found.name()
        );
        let data = bytes
            .chunks_exact(found.size())
            .map(T::from_le_slice)
            .collect();
        Ok(Chunk {
            n: entry.n as usize,
            m: entry.m as usize,
            data,
        })
    }

    /// Read a character chunk as one string per row.
    pub fn read_strings(
        &mut self,
        frame: usize,
        name: &str,
    ) -> Result<Vec<String>, TrajectoryError> {
        let chunk: Chunk<u8> = self.read_chunk(frame, name)?;
        Ok(chunk.rows().map(c_string).collect())
    }

    /// Read a frame with HOOMD schema defaults applied.
    pub fn read_frame(&mut self, frame: usize) -> Result<HoomdFrame, TrajectoryError> {
        self.check_frame(frame)?;

        let step = self
            .read_with_fallback::<u64>(frame, STEP)?
            .and_then(|c| c.first())
            .unwrap_or(0);

        let box_dims = match self.read_with_fallback::<f32>(frame, BOX)? {
            Some(chunk) if chunk.data.len() == 6 => {
                let mut dims = [0.0f32; 6];
                dims.copy_from_slice(&chunk.data);
                dims
            }
            Some(chunk) => {
                return Err(TrajectoryError::invalid(format!(
                    "`{}` holds {} values, expected 6",
                    BOX,
                    chunk.data.len()
                )))
            }
            None => [1.0, 1.0, 1.0, 0.0, 0.0, 0.0],
        };

        let positions = self.positions(frame)?;
        let n = positions.len();

        let typeid = match self.read_with_fallback::<u32>(frame, TYPE_ID)? {
            Some(chunk) => expect_rows(chunk, n, 1, TYPE_ID)?.data,
            None => vec![0; n],
        };

        let types = match self.find_with_fallback(frame, TYPES) {
            Some(source) => self.read_strings(source, TYPES)?,
            None => vec!["A".to_string()],
        };

        let bonds = match self.read_with_fallback::<u32>(frame, BOND_GROUP)? {
            Some(chunk) => {
                if chunk.m != 2 {
                    return Err(TrajectoryError::invalid(format!(
                        "`{}` has {} columns, expected 2",
                        BOND_GROUP, chunk.m
                    )));
                }
                chunk.rows().map(|r| [r[0], r[1]]).collect()
            }
            None => Vec::new(),
        };

        Ok(HoomdFrame {
            step,
            box_dims,
            positions,
            typeid,
            types,
            bonds,
        })
    }

    /// Particle positions of one frame, widened to `f64`.
    pub fn positions(&mut self, frame: usize) -> Result<Vec<[f64; 3]>, TrajectoryError> {
        self.check_frame(frame)?;

        let declared = self
            .read_with_fallback::<u32>(frame, PARTICLE_COUNT)?
            .and_then(|c| c.first())
            .map(|n| n as usize);

        match self.read_with_fallback::<f32>(frame, POSITION)? {
            Some(chunk) => {
                let n = declared.unwrap_or(chunk.n);
                let chunk = expect_rows(chunk, n, 3, POSITION)?;
                Ok(chunk
                    .rows()
                    .map(|r| [r[0] as f64, r[1] as f64, r[2] as f64])
                    .collect())
            }
            None => Ok(vec![[0.0; 3]; declared.unwrap_or(0)]),
        }
    }

    fn find_with_fallback(&self, frame: usize, name: &str) -> Option<usize> {
        if self.chunk_exists(frame, name) {
            Some(frame)
        } else if frame != 0 && self.chunk_exists(0, name) {
            Some(0)
        } else {
            None
        }
    }

    fn read_with_fallback<T: ChunkElement>(
        &mut self,
        frame: usize,
        name: &str,
    ) -> Result<Option<Chunk<T>>, TrajectoryError> {
        match self.find_with_fallback(frame, name) {
            Some(source) => self.read_chunk(source, name).map(Some),
            None => Ok(None),
        }
    }

    fn check_frame(&self, frame: usize) -> Result<(), TrajectoryError> {
        let n_frames = self.n_frames();
        if frame >= n_frames {
            return Err(TrajectoryError::FrameOutOfRange {
                index: frame,
                n_frames,
            });
        }
        Ok(())
    }

    fn read_entry_bytes(&mut self, entry: &IndexEntry) -> Result<Vec<u8>, TrajectoryError> {
        let len = entry.byte_len()?;
        let mut bytes = vec![0u8; len];
        self.reader
            .seek(SeekFrom::Start(entry.location as u64))
            .and_then(|_| self.reader.read_exact(&mut bytes))
            .map_err(|e| TrajectoryError::io(&self.path, e))?;
        Ok(bytes)
    }
}

impl TrajectoryReader for GsdReader<BufReader<File>> {
    const FORMAT: &'static str = "GSD";

    fn open(path: &Path) -> Result<Self, TrajectoryError> {
        GsdReader::open(path)
    }

    fn n_frames(&self) -> usize {
        GsdReader::n_frames(self)
    }

    fn positions(&mut self, frame: usize) -> Result<Vec<[f64; 3]>, TrajectoryError> {
        GsdReader::positions(self, frame)
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Append-only GSD writer.
///
/// Chunks are written as they arrive; the index and namelist are written
/// at [`GsdWriter::finish`], which then rewrites the header with their
/// locations. A writer dropped without `finish` leaves an unreadable file.
pub struct GsdWriter<W: Write + Seek = BufWriter<File>> {
    writer: W,
    path: PathBuf,
    header: GsdHeader,
    names: Vec<String>,
    name_ids: FxHashMap<String, u16>,
    index: Vec<IndexEntry>,
    pending: Vec<IndexEntry>,
    frame: u64,
    position: u64,
}

impl GsdWriter<BufWriter<File>> {
    /// Create (or truncate) a GSD file.
    pub fn create<P: AsRef<Path>>(
        path: P,
        application: &str,
        schema: &str,
        schema_version: u32,
    ) -> Result<Self, TrajectoryError> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| TrajectoryError::io(path, e))?;
        let mut writer = Self::new(BufWriter::new(file), application, schema, schema_version)?;
        writer.path = path.to_path_buf();
        Ok(writer)
    }

    /// Create a file following the HOOMD schema.
    pub fn create_hoomd<P: AsRef<Path>>(
        path: P,
        application: &str,
    ) -> Result<Self, TrajectoryError> {
        Self::create(path, application, HOOMD_SCHEMA, HOOMD_SCHEMA_VERSION)
    }
}

impl<W: Write + Seek> GsdWriter<W> {
    /// Start a GSD stream on any seekable sink.
    pub fn new(
        mut writer: W,
        application: &str,
        schema: &str,
        schema_version: u32,
    ) -> Result<Self, TrajectoryError> {
        let path = PathBuf::from("<stream>");
        let header = GsdHeader::new(application, schema, schema_version);
        writer
            .seek(SeekFrom::Start(0))
            .and_then(|_| writer.write_all(&header.to_bytes()))
            .map_err(|e| TrajectoryError::io(&path, e))?;

        Ok(Self {
            writer,
            path,
            header,
            names: Vec::new(),
            name_ids: FxHashMap::default(),
            index: Vec::new(),
            pending: Vec::new(),
            frame: 0,
            position: HEADER_SIZE as u64,
        })
    }

    /// Index of the frame currently being written.
    pub fn frame(&self) -> usize {
        self.frame as usize
    }

    /// Write an `n x m` chunk into the current frame.
    pub fn write_chunk<T: ChunkElement>(
        &mut self,
        name: &str,
        n: usize,
        m: usize,
        data: &[T],
    ) -> Result<(), TrajectoryError> {
        self.write_typed(name, n, m, T::TYPE, data)
    }

    /// Write one string per row as a character chunk.
    pub fn write_strings(&mut self, name: &str, rows: &[&str]) -> Result<(), TrajectoryError> {
        let width = rows.iter().map(|s| s.len()).max().unwrap_or(0) + 1;
        let mut data = vec![0u8; rows.len() * width];
        for (row, s) in data.chunks_mut(width).zip(rows) {
            row[..s.len()].copy_from_slice(s.as_bytes());
        }
        self.write_typed(name, rows.len(), width, GsdType::Character, &data)
    }

    fn write_typed<T: ChunkElement>(
        &mut self,
        name: &str,
        n: usize,
        m: usize,
        ty: GsdType,
        data: &[T],
    ) -> Result<(), TrajectoryError> {
        if m == 0 || m > u32::MAX as usize {
            return Err(TrajectoryError::invalid(format!(
                "chunk `{}` has invalid column count {}",
                name, m
            )));
        }
        if n.checked_mul(m) != Some(data.len()) {
            return Err(TrajectoryError::invalid(format!(
                "chunk `{}` declares {}x{} but holds {} values",
                name,
                n,
                m,
                data.len()
            )));
        }

        let id = self.name_id(name)?;
        if self.pending.iter().any(|e| e.id == id) {
            return Err(TrajectoryError::invalid(format!(
                "chunk `{}` written twice in frame {}",
                name, self.frame
            )));
        }

        let mut bytes = Vec::with_capacity(data.len() * ty.size());
        for &value in data {
            value.extend_le(&mut bytes);
        }
        self.writer
            .write_all(&bytes)
            .map_err(|e| TrajectoryError::io(&self.path, e))?;

        self.pending.push(IndexEntry {
            frame: self.frame,
            n: n as u64,
            location: self.position as i64,
            m: m as u32,
            id,
            type_code: ty as u8,
            flags: 0,
        });
        self.position += bytes.len() as u64;
        Ok(())
    }

    /// Close the current frame. Empty frames at the end of a file are not
    /// visible to readers.
    pub fn end_frame(&mut self) {
        self.pending.sort_by_key(|e| e.id);
        self.index.append(&mut self.pending);
        self.frame += 1;
    }

    /// Write the index, namelist and final header. Chunks of an unclosed
    /// frame are committed first.
    pub fn finish(mut self) -> Result<W, TrajectoryError> {
        if !self.pending.is_empty() {
            self.end_frame();
        }

        let mut index_bytes = Vec::with_capacity(self.index.len().max(1) * INDEX_ENTRY_SIZE);
        for entry in &self.index {
            index_bytes.extend_from_slice(&entry.to_bytes());
        }
        if self.index.is_empty() {
            index_bytes.extend_from_slice(&[0u8; INDEX_ENTRY_SIZE]);
        }

        let mut namelist = Vec::new();
        for name in &self.names {
            namelist.extend_from_slice(name.as_bytes());
            namelist.push(0);
        }
        namelist.push(0);

        self.header.index_location = self.position;
        self.header.index_allocated_entries = (index_bytes.len() / INDEX_ENTRY_SIZE) as u64;
        self.header.namelist_location = self.position + index_bytes.len() as u64;
        self.header.namelist_allocated_entries = namelist.len() as u64;

        let header = self.header.to_bytes();
        let path = self.path;
        let mut writer = self.writer;
        writer
            .write_all(&index_bytes)
            .and_then(|_| writer.write_all(&namelist))
            .and_then(|_| writer.seek(SeekFrom::Start(0)))
            .and_then(|_| writer.write_all(&header))
            .and_then(|_| writer.flush())
            .map_err(|e| TrajectoryError::io(&path, e))?;

        debug!(
            "finished GSD `{}`: {} chunks over {} frames",
            path.display(),
            self.index.len(),
            self.frame
        );
        Ok(writer)
    }

    fn name_id(&mut self, name: &str) -> Result<u16, TrajectoryError> {
        if let Some(&id) = self.name_ids.get(name) {
            return Ok(id);
        }
        if name.is_empty() || name.contains('\0') {
            return Err(TrajectoryError::invalid(format!("invalid chunk name {:?}", name)));
        }
        let id = u16::try_from(self.names.len())
            .map_err(|_| TrajectoryError::invalid("too many distinct chunk names"))?;
        self.names.push(name.to_string());
        self.name_ids.insert(name.to_string(), id);
        Ok(id)
    }
}

// ============================================================================
// Internal Implementation
// ============================================================================

/// Error from a header-relative read, before the path is attached.
enum LayoutError {
    Io(std::io::Error),
    Invalid(String),
}

impl LayoutError {
    fn at(self, path: &Path) -> TrajectoryError {
        match self {
            LayoutError::Io(e) => TrajectoryError::io(path, e),
            LayoutError::Invalid(message) => TrajectoryError::InvalidFormat(message),
        }
    }
}

impl From<std::io::Error> for LayoutError {
    fn from(e: std::io::Error) -> Self {
        LayoutError::Io(e)
    }
}

/// Read valid index entries, stopping at the first unused slot.
///
/// Every entry must lie within the first `file_len` bytes of the stream.
fn read_index<R: Read + Seek>(
    reader: &mut R,
    header: &GsdHeader,
    file_len: u64,
) -> Result<Vec<IndexEntry>, LayoutError> {
    reader.seek(SeekFrom::Start(header.index_location))?;

    let mut index = Vec::new();
    let mut buf = [0u8; INDEX_ENTRY_SIZE];
    for _ in 0..header.index_allocated_entries {
        reader.read_exact(&mut buf)?;
        let entry = IndexEntry::parse(&buf);
        if entry.location == 0 {
            break;
        }
        if entry.location < 0 || entry.gsd_type().is_none() {
            return Err(LayoutError::Invalid(format!(
                "corrupt index entry {}: location {}, type {}",
                index.len(),
                entry.location,
                entry.type_code
            )));
        }
        let end = entry
            .byte_len()
            .ok()
            .and_then(|len| (entry.location as u64).checked_add(len as u64));
        if end.map_or(true, |end| end > file_len) {
            return Err(LayoutError::Invalid(format!(
                "index entry {} ({}x{} at offset {}) runs past the end of the file ({} bytes)",
                index.len(),
                entry.n,
                entry.m,
                entry.location,
                file_len
            )));
        }
        index.push(entry);
    }

    // 1.x writers do not keep entries ordered within a frame
    index.sort_by_key(|e| (e.frame, e.id));
    Ok(index)
}

fn read_namelist<R: Read + Seek>(
    reader: &mut R,
    header: &GsdHeader,
) -> Result<Vec<String>, LayoutError> {
    reader.seek(SeekFrom::Start(header.namelist_location))?;

    let (major, _) = header.version();
    let names = if major < 2 {
        let mut names = Vec::new();
        let mut buf = [0u8; V1_NAME_SIZE];
        for _ in 0..header.namelist_allocated_entries {
            reader.read_exact(&mut buf)?;
            let name = c_string(&buf);
            if name.is_empty() {
                break;
            }
            names.push(name);
        }
        names
    } else {
        let mut buf = Vec::new();
        reader
            .by_ref()
            .take(header.namelist_allocated_entries)
            .read_to_end(&mut buf)?;
        if (buf.len() as u64) < header.namelist_allocated_entries {
            return Err(LayoutError::Invalid("truncated namelist".to_string()));
        }
        buf.split(|&b| b == 0)
            .take_while(|name| !name.is_empty())
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .collect()
    };
    Ok(names)
}

fn expect_rows<T>(
    chunk: Chunk<T>,
    n: usize,
    m: usize,
    name: &str,
) -> Result<Chunk<T>, TrajectoryError> {
    if chunk.n != n || chunk.m != m {
        return Err(TrajectoryError::invalid(format!(
            "`{}` is {}x{}, expected {}x{}",
            name, chunk.n, chunk.m, n, m
        )));
    }
    Ok(chunk)
}

fn u64_at(buf: &[u8], offset: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(b)
}

fn u32_at(buf: &[u8], offset: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(b)
}

/// Text up to the first NUL byte.
fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Copy `s` into a fixed field, truncating so a NUL always remains.
fn put_c_string(field: &mut [u8], s: &str) {
    let len = s.len().min(field.len() - 1);
    field[..len].copy_from_slice(&s.as_bytes()[..len]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frame_positions(frame: usize, n: usize) -> Vec<f32> {
        (0..n)
            .flat_map(|i| {
                let base = (frame * 100 + i) as f32;
                [base, base + 0.25, base + 0.5]
            })
            .collect()
    }

    /// Five frames of ten particles; only frame 0 stores `particles/N`,
    /// the box and the bond list.
    fn sample_stream() -> Cursor<Vec<u8>> {
        let mut writer =
            GsdWriter::new(Cursor::new(Vec::new()), "polykit", HOOMD_SCHEMA, HOOMD_SCHEMA_VERSION)
                .unwrap();
        for frame in 0..5 {
            writer.write_chunk(STEP, 1, 1, &[frame as u64 * 1000]).unwrap();
            if frame == 0 {
                writer.write_chunk(PARTICLE_COUNT, 1, 1, &[10u32]).unwrap();
                writer
                    .write_chunk(BOX, 1, 6, &[20.0f32, 20.0, 20.0, 0.0, 0.0, 0.0])
                    .unwrap();
                let bonds: Vec<u32> = (0..9).flat_map(|i| [i, i + 1]).collect();
                writer.write_chunk(BOND_GROUP, 9, 2, &bonds).unwrap();
                writer.write_strings(TYPES, &["A", "B"]).unwrap();
            }
            writer
                .write_chunk(POSITION, 10, 3, &frame_positions(frame, 10))
                .unwrap();
            writer.end_frame();
        }
        let mut cursor = writer.finish().unwrap();
        cursor.set_position(0);
        cursor
    }

    #[test]
    fn test_header_round_trip() {
        let header = GsdHeader::new("polykit", HOOMD_SCHEMA, HOOMD_SCHEMA_VERSION);
        let parsed = GsdHeader::parse(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.version(), (2, 0));
        assert_eq!(parsed.schema_version_parts(), (1, 4));
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = GsdHeader::new("x", "y", 0).to_bytes();
        bytes[0] = 0;
        let err = GsdHeader::parse(&bytes).unwrap_err();
        assert!(matches!(err, TrajectoryError::InvalidFormat(_)));
    }

    #[test]
    fn test_unsupported_version() {
        let mut header = GsdHeader::new("x", "y", 0);
        header.gsd_version = make_version(3, 0);
        let err = GsdHeader::parse(&header.to_bytes()).unwrap_err();
        assert!(matches!(
            err,
            TrajectoryError::UnsupportedVersion { major: 3, .. }
        ));
    }

    #[test]
    fn test_read_sample_stream() {
        let mut reader = GsdReader::from_reader(sample_stream()).unwrap();
        assert_eq!(reader.n_frames(), 5);
        assert_eq!(reader.header().schema, HOOMD_SCHEMA);
        assert_eq!(reader.header().application, "polykit");
        assert!(reader.chunk_names().iter().any(|n| n == POSITION));

        let positions = reader.positions(3).unwrap();
        assert_eq!(positions.len(), 10);
        assert_eq!(positions[0], [300.0, 300.25, 300.5]);
        assert_eq!(positions[9], [309.0, 309.25, 309.5]);
    }

    #[test]
    fn test_hoomd_fallback_to_frame_zero() {
        let mut reader = GsdReader::from_reader(sample_stream()).unwrap();
        assert!(!reader.chunk_exists(2, BOX));
        assert!(reader.chunk_exists(0, BOX));

        let frame = reader.read_frame(2).unwrap();
        assert_eq!(frame.step, 2000);
        assert_eq!(frame.box_dims, [20.0, 20.0, 20.0, 0.0, 0.0, 0.0]);
        assert_eq!(frame.n_particles(), 10);
        assert_eq!(frame.bonds.len(), 9);
        assert_eq!(frame.bonds[8], [8, 9]);
        assert_eq!(frame.types, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(frame.typeid, vec![0; 10]);
    }

    #[test]
    fn test_missing_positions_inherit_frame_zero() {
        let mut writer =
            GsdWriter::new(Cursor::new(Vec::new()), "polykit", HOOMD_SCHEMA, HOOMD_SCHEMA_VERSION)
                .unwrap();
        writer.write_chunk(POSITION, 2, 3, &[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        writer.end_frame();
        writer.write_chunk(STEP, 1, 1, &[10u64]).unwrap();
        writer.end_frame();
        let mut cursor = writer.finish().unwrap();
        cursor.set_position(0);

        let mut reader = GsdReader::from_reader(cursor).unwrap();
        assert_eq!(reader.n_frames(), 2);
        assert_eq!(reader.positions(1).unwrap(), reader.positions(0).unwrap());
    }

    #[test]
    fn test_schema_defaults_without_positions() {
        let mut writer =
            GsdWriter::new(Cursor::new(Vec::new()), "polykit", HOOMD_SCHEMA, HOOMD_SCHEMA_VERSION)
                .unwrap();
        writer.write_chunk(PARTICLE_COUNT, 1, 1, &[4u32]).unwrap();
        writer.end_frame();
        let cursor = writer.finish().unwrap().into_inner();

        let mut reader = GsdReader::from_reader(Cursor::new(cursor)).unwrap();
        let frame = reader.read_frame(0).unwrap();
        assert_eq!(frame.positions, vec![[0.0; 3]; 4]);
        assert_eq!(frame.step, 0);
        assert_eq!(frame.box_dims, [1.0, 1.0, 1.0, 0.0, 0.0, 0.0]);
        assert!(frame.bonds.is_empty());
    }

    #[test]
    fn test_frame_out_of_range() {
        let mut reader = GsdReader::from_reader(sample_stream()).unwrap();
        let err = reader.positions(5).unwrap_err();
        assert!(matches!(
            err,
            TrajectoryError::FrameOutOfRange {
                index: 5,
                n_frames: 5
            }
        ));
    }

    #[test]
    fn test_type_mismatch() {
        let mut reader = GsdReader::from_reader(sample_stream()).unwrap();
        let err = reader.read_chunk::<f64>(0, POSITION).unwrap_err();
        assert!(matches!(
            err,
            TrajectoryError::TypeMismatch {
                expected: "double",
                found: "float",
                ..
            }
        ));
    }

    #[test]
    fn test_missing_chunk() {
        let mut reader = GsdReader::from_reader(sample_stream()).unwrap();
        let err = reader.read_chunk::<f32>(1, "particles/velocity").unwrap_err();
        assert!(matches!(err, TrajectoryError::MissingChunk { frame: 1, .. }));
    }

    #[test]
    fn test_writer_rejects_bad_chunks() {
        let mut writer = GsdWriter::new(Cursor::new(Vec::new()), "polykit", "test", 0).unwrap();
        assert!(writer.write_chunk(POSITION, 2, 3, &[0.0f32; 5]).is_err());
        assert!(writer.write_chunk(POSITION, 1, 0, &[0.0f32; 0]).is_err());
        writer.write_chunk(STEP, 1, 1, &[1u64]).unwrap();
        assert!(writer.write_chunk(STEP, 1, 1, &[2u64]).is_err());
    }

    #[test]
    fn test_empty_file_has_no_frames() {
        let writer = GsdWriter::new(Cursor::new(Vec::new()), "polykit", "test", 0).unwrap();
        let cursor = writer.finish().unwrap().into_inner();
        let reader = GsdReader::from_reader(Cursor::new(cursor)).unwrap();
        assert_eq!(reader.n_frames(), 0);
        assert!(reader.chunk_names().is_empty());
    }

    #[test]
    fn test_index_sorted_by_name_id_within_frame() {
        let mut writer = GsdWriter::new(Cursor::new(Vec::new()), "polykit", "test", 0).unwrap();
        writer.write_chunk("a", 1, 1, &[1u8]).unwrap();
        writer.write_chunk("b", 1, 1, &[2u8]).unwrap();
        writer.end_frame();
        // reverse insertion order in the second frame
        writer.write_chunk("b", 1, 1, &[4u8]).unwrap();
        writer.write_chunk("a", 1, 1, &[3u8]).unwrap();
        writer.end_frame();
        let cursor = writer.finish().unwrap().into_inner();

        let mut reader = GsdReader::from_reader(Cursor::new(cursor)).unwrap();
        assert_eq!(reader.read_chunk::<u8>(1, "a").unwrap().data, vec![3]);
        assert_eq!(reader.read_chunk::<u8>(1, "b").unwrap().data, vec![4]);
    }

    #[test]
    fn test_version_one_namelist() {
        // Hand-built 1.0 file: one frame with a single uint8 chunk "x".
        let mut header = GsdHeader::new("legacy", "test", 0);
        header.gsd_version = make_version(1, 0);
        let data_location = HEADER_SIZE as u64;
        header.index_location = data_location + 1;
        header.index_allocated_entries = 2;
        header.namelist_location = header.index_location + 2 * INDEX_ENTRY_SIZE as u64;
        header.namelist_allocated_entries = 2;

        let mut bytes = header.to_bytes().to_vec();
        bytes.push(42);
        let entry = IndexEntry {
            frame: 0,
            n: 1,
            location: data_location as i64,
            m: 1,
            id: 0,
            type_code: GsdType::U8 as u8,
            flags: 0,
        };
        bytes.extend_from_slice(&entry.to_bytes());
        bytes.extend_from_slice(&[0u8; INDEX_ENTRY_SIZE]);
        let mut name = [0u8; V1_NAME_SIZE];
        name[0] = b'x';
        bytes.extend_from_slice(&name);
        bytes.extend_from_slice(&[0u8; V1_NAME_SIZE]);

        let mut reader = GsdReader::from_reader(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.n_frames(), 1);
        assert_eq!(reader.chunk_names(), ["x".to_string()]);
        assert_eq!(reader.read_chunk::<u8>(0, "x").unwrap().data, vec![42]);
    }

    /// A file with one `particles/position` chunk declaring `rows` rows,
    /// backed by a single row of data.
    fn single_position_file(rows: u64) -> Vec<u8> {
        let mut header = GsdHeader::new("corrupt", HOOMD_SCHEMA, HOOMD_SCHEMA_VERSION);
        let data_location = HEADER_SIZE as u64;
        header.index_location = data_location + 12;
        header.index_allocated_entries = 1;
        header.namelist_location = header.index_location + INDEX_ENTRY_SIZE as u64;
        header.namelist_allocated_entries = POSITION.len() as u64 + 1;

        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 12]);
        let entry = IndexEntry {
            frame: 0,
            n: rows,
            location: data_location as i64,
            m: 3,
            id: 0,
            type_code: GsdType::F32 as u8,
            flags: 0,
        };
        bytes.extend_from_slice(&entry.to_bytes());
        bytes.extend_from_slice(POSITION.as_bytes());
        bytes.push(0);
        bytes
    }

    #[test]
    fn test_chunk_within_file_reads() {
        let mut reader = GsdReader::from_reader(Cursor::new(single_position_file(1))).unwrap();
        assert_eq!(reader.positions(0).unwrap(), vec![[0.0; 3]]);
    }

    #[test]
    fn test_oversized_chunk_rejected_at_open() {
        let err = GsdReader::from_reader(Cursor::new(single_position_file(1 << 40)))
            .err()
            .unwrap();
        assert!(matches!(err, TrajectoryError::InvalidFormat(_)), "{}", err);
    }

    #[test]
    fn test_truncated_chunk_rejected_at_open() {
        let err = GsdReader::from_reader(Cursor::new(single_position_file(2)))
            .err()
            .unwrap();
        assert!(matches!(err, TrajectoryError::InvalidFormat(_)), "{}", err);
    }
}

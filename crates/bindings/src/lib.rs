#![allow(clippy::useless_conversion)]
#![allow(clippy::too_many_arguments)]

use ndarray::Array2;
use numpy::{
    PyArray2, PyArray3, PyArrayDescrMethods, PyReadonlyArray2, PyReadonlyArray3,
    PyUntypedArrayMethods, ToPyArray,
};
use pyo3::exceptions::{PyIOError, PyIndexError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList};

use pk_core::config::{ProjectionConfig, RasterConfig};
use pk_core::error::{LoadError, RasterError, TrajectoryError};
use pk_core::projection::{voxels_to_pixels_rgb, Colormap, ProjectionMode};
use pk_core::raster::rasterize;
use pk_core::trajectory::dcd::{read_dcd_header, DcdReader};
use pk_core::trajectory::gsd::GsdReader;
use pk_core::trajectory::{load, load_dcd, load_gsd};

// ============================================================================
// Helpers
// ============================================================================

fn coords_to_array2(coords: &[[f64; 3]]) -> Array2<f64> {
    let mut result = Array2::<f64>::zeros((coords.len(), 3));
    for (i, &[x, y, z]) in coords.iter().enumerate() {
        result[[i, 0]] = x;
        result[[i, 1]] = y;
        result[[i, 2]] = z;
    }
    result
}

fn array2_to_coords(arr: &ndarray::ArrayView2<f64>) -> PyResult<Vec<[f64; 3]>> {
    if arr.shape()[1] != 3 {
        return Err(PyValueError::new_err(format!(
            "positions must have shape (N, 3), got {:?}",
            arr.shape()
        )));
    }
    Ok((0..arr.shape()[0])
        .map(|i| [arr[[i, 0]], arr[[i, 1]], arr[[i, 2]]])
        .collect())
}

fn trajectory_err(e: TrajectoryError) -> PyErr {
    match e {
        TrajectoryError::FrameOutOfRange { .. } => PyIndexError::new_err(e.to_string()),
        TrajectoryError::Io { .. } => PyIOError::new_err(e.to_string()),
        _ => PyValueError::new_err(e.to_string()),
    }
}

fn load_err(e: LoadError) -> PyErr {
    match e {
        LoadError::Uri(e) => PyValueError::new_err(e.to_string()),
        LoadError::Trajectory(e) => trajectory_err(e),
    }
}

fn raster_err(e: RasterError) -> PyErr {
    PyValueError::new_err(e.to_string())
}

// ============================================================================
// LOADERS
// ============================================================================

/// Load particle positions from `"<path>::<frame>"`, picking the format
/// from the file extension.
#[pyfunction]
#[pyo3(name = "load")]
fn load_py<'py>(py: Python<'py>, uri: &str) -> PyResult<Bound<'py, PyArray2<f64>>> {
    let positions = py.allow_threads(|| load(uri)).map_err(load_err)?;
    Ok(coords_to_array2(&positions).to_pyarray_bound(py))
}

/// Load particle positions from a GSD frame, `"<path>::<frame>"`.
#[pyfunction]
#[pyo3(name = "load_gsd")]
fn load_gsd_py<'py>(py: Python<'py>, uri: &str) -> PyResult<Bound<'py, PyArray2<f64>>> {
    let positions = py.allow_threads(|| load_gsd(uri)).map_err(load_err)?;
    Ok(coords_to_array2(&positions).to_pyarray_bound(py))
}

/// Load particle positions from a DCD frame, `"<path>::<frame>"`.
#[pyfunction]
#[pyo3(name = "load_dcd")]
fn load_dcd_py<'py>(py: Python<'py>, uri: &str) -> PyResult<Bound<'py, PyArray2<f64>>> {
    let positions = py.allow_threads(|| load_dcd(uri)).map_err(load_err)?;
    Ok(coords_to_array2(&positions).to_pyarray_bound(py))
}

// ============================================================================
// GSD TRAJECTORY
// ============================================================================

#[pyclass(name = "GsdReader")]
struct PyGsdReader {
    reader: GsdReader,
}

#[pymethods]
impl PyGsdReader {
    #[new]
    fn new(path: &str) -> PyResult<Self> {
        let reader = GsdReader::open(path).map_err(trajectory_err)?;
        Ok(PyGsdReader { reader })
    }

    #[getter]
    fn n_frames(&self) -> usize {
        self.reader.n_frames()
    }

    #[getter]
    fn application(&self) -> String {
        self.reader.header().application.clone()
    }

    #[getter]
    fn schema(&self) -> String {
        self.reader.header().schema.clone()
    }

    #[getter]
    fn chunk_names(&self) -> Vec<String> {
        self.reader.chunk_names().to_vec()
    }

    fn __len__(&self) -> usize {
        self.reader.n_frames()
    }

    fn positions<'py>(
        &mut self,
        py: Python<'py>,
        frame: usize,
    ) -> PyResult<Bound<'py, PyArray2<f64>>> {
        let positions = self.reader.positions(frame).map_err(trajectory_err)?;
        Ok(coords_to_array2(&positions).to_pyarray_bound(py))
    }

    /// Read a frame under the HOOMD schema as a dict.
    fn read_frame<'py>(&mut self, py: Python<'py>, frame: usize) -> PyResult<Bound<'py, PyDict>> {
        let frame = self.reader.read_frame(frame).map_err(trajectory_err)?;

        let bonds = Array2::from_shape_fn((frame.bonds.len(), 2), |(i, j)| frame.bonds[i][j]);

        let dict = PyDict::new_bound(py);
        dict.set_item("step", frame.step)?;
        dict.set_item("box", frame.box_dims.to_vec())?;
        dict.set_item("positions", coords_to_array2(&frame.positions).to_pyarray_bound(py))?;
        dict.set_item("typeid", frame.typeid.to_pyarray_bound(py))?;
        dict.set_item("types", PyList::new_bound(py, &frame.types))?;
        dict.set_item("bonds", bonds.to_pyarray_bound(py))?;
        Ok(dict)
    }
}

// ============================================================================
// DCD TRAJECTORY
// ============================================================================

#[pyclass(name = "DcdReader")]
struct PyDcdReader {
    reader: DcdReader,
}

#[pymethods]
impl PyDcdReader {
    #[new]
    fn new(path: &str) -> PyResult<Self> {
        let reader = DcdReader::open(path).map_err(trajectory_err)?;
        Ok(PyDcdReader { reader })
    }

    #[getter]
    fn n_frames(&self) -> usize {
        self.reader.n_frames()
    }

    #[getter]
    fn n_atoms(&self) -> usize {
        self.reader.n_atoms()
    }

    #[getter]
    fn has_unit_cell(&self) -> bool {
        self.reader.header().has_unit_cell
    }

    #[getter]
    fn current_frame(&self) -> usize {
        self.reader.current_frame()
    }

    fn seek(&mut self, frame: usize) -> PyResult<()> {
        self.reader.seek_frame(frame).map_err(trajectory_err)
    }

    fn read_frame<'py>(
        &mut self,
        py: Python<'py>,
    ) -> PyResult<Option<(Bound<'py, PyArray2<f64>>, Option<Vec<f64>>)>> {
        match self.reader.read_frame().map_err(trajectory_err)? {
            Some(frame) => Ok(Some((
                coords_to_array2(&frame.positions).to_pyarray_bound(py),
                frame.unit_cell.map(|c| c.to_vec()),
            ))),
            None => Ok(None),
        }
    }

    fn read_frame_at<'py>(
        &mut self,
        py: Python<'py>,
        frame_index: usize,
    ) -> PyResult<Option<(Bound<'py, PyArray2<f64>>, Option<Vec<f64>>)>> {
        self.seek(frame_index)?;
        self.read_frame(py)
    }
}

#[pyfunction]
#[pyo3(name = "read_dcd_header")]
fn read_dcd_header_py<'py>(py: Python<'py>, path: &str) -> PyResult<Bound<'py, PyDict>> {
    let header = read_dcd_header(path).map_err(trajectory_err)?;

    let dict = PyDict::new_bound(py);
    dict.set_item("n_frames", header.n_frames)?;
    dict.set_item("declared_frames", header.declared_frames)?;
    dict.set_item("n_atoms", header.n_atoms)?;
    dict.set_item("start_timestep", header.start_timestep)?;
    dict.set_item("timestep_interval", header.timestep_interval)?;
    dict.set_item("timestep", header.timestep)?;
    dict.set_item("has_unit_cell", header.has_unit_cell)?;
    dict.set_item("is_charmm", header.is_charmm)?;
    dict.set_item("is_big_endian", header.is_big_endian)?;
    dict.set_item("titles", PyList::new_bound(py, &header.titles))?;

    Ok(dict)
}

// ============================================================================
// RASTERIZATION
// ============================================================================

#[pyfunction]
#[pyo3(
    name = "rasterize",
    signature = (positions, box_size, resolution=100.0, length_unit=50.0, gaussian_width=250.0, normalize=false)
)]
fn rasterize_py<'py>(
    py: Python<'py>,
    positions: &Bound<'py, numpy::PyUntypedArray>,
    box_size: f64,
    resolution: f64,
    length_unit: f64,
    gaussian_width: f64,
    normalize: bool,
) -> PyResult<Bound<'py, PyArray3<f64>>> {
    // Polymer snapshots are often float32
    let is_f32 = positions
        .dtype()
        .is_equiv_to(&numpy::dtype_bound::<f32>(py));
    let positions_f64: PyReadonlyArray2<'py, f64> = if is_f32 {
        let arr = positions.call_method1("astype", (numpy::dtype_bound::<f64>(py),))?;
        arr.extract()?
    } else {
        positions.extract()?
    };
    let coords = array2_to_coords(&positions_f64.as_array())?;

    let config = RasterConfig {
        resolution,
        length_unit,
        gaussian_width,
        normalize,
    };
    let raster = py
        .allow_threads(|| rasterize(&coords, box_size, &config))
        .map_err(raster_err)?;
    Ok(raster.to_pyarray_bound(py))
}

#[pyfunction]
#[pyo3(
    name = "voxels_to_pixels_rgb",
    signature = (raster, cmap="viridis", vmin=None, vmax=None, mode="max", axis=2)
)]
fn voxels_to_pixels_rgb_py<'py>(
    py: Python<'py>,
    raster: PyReadonlyArray3<'py, f64>,
    cmap: &str,
    vmin: Option<f64>,
    vmax: Option<f64>,
    mode: &str,
    axis: usize,
) -> PyResult<Bound<'py, PyArray3<f64>>> {
    let config = ProjectionConfig {
        colormap: cmap.parse::<Colormap>().map_err(raster_err)?,
        vmin,
        vmax,
        mode: mode.parse::<ProjectionMode>().map_err(raster_err)?,
        axis,
    };
    let raster = raster.as_array().to_owned();
    let rgb = py
        .allow_threads(|| voxels_to_pixels_rgb(&raster, &config))
        .map_err(raster_err)?;
    Ok(rgb.to_pyarray_bound(py))
}

// ============================================================================
// MODULE DEFINITION
// ============================================================================

#[pymodule]
fn polykit(m: &Bound<'_, PyModule>) -> PyResult<()> {
    // Loaders
    m.add_function(wrap_pyfunction!(load_py, m)?)?;
    m.add_function(wrap_pyfunction!(load_gsd_py, m)?)?;
    m.add_function(wrap_pyfunction!(load_dcd_py, m)?)?;

    // GSD
    m.add_class::<PyGsdReader>()?;

    // DCD
    m.add_class::<PyDcdReader>()?;
    m.add_function(wrap_pyfunction!(read_dcd_header_py, m)?)?;

    // Rendering helpers
    m.add_function(wrap_pyfunction!(rasterize_py, m)?)?;
    m.add_function(wrap_pyfunction!(voxels_to_pixels_rgb_py, m)?)?;

    Ok(())
}

//! Persistence for height maps.
//!
//! Processed maps are stored as FITS: a single double-precision image HDU
//! named `SURFACE`. FITS puts the origin bottom-left, so rows are flipped on
//! write and flipped back on read; a map survives a round trip unchanged.
//!
//! Raw measurements saved by the interferometer service are HDF5 files with
//! the map in `measurement0/genraw/data`. Reading them needs the `h5` feature,
//! which links the native HDF5 library. Measurement folders may also hold FITS
//! frames.

use std::path::{Path, PathBuf};

use fitsio::compat::fitsfile::FitsFile;
use fitsio::compat::images::{ImageDescription, ImageType, ReadImage, WriteImage};
use ndarray::{s, Array2, ArrayView2};
use thiserror::Error;
use tracing::{debug, warn};

use crate::aperture::ApertureError;
use crate::surface::RawFrame;

/// Extension of the measurement files the interferometer service saves.
pub const MEASUREMENT_EXTENSION: &str = "h5";

/// Extension of processed surfaces.
pub const SURFACE_EXTENSION: &str = "fits";

/// Dataset holding the height map inside a measurement file.
pub const MEASUREMENT_DATASET: &str = "measurement0/genraw/data";

/// Pixels at or above this value are invalid when the file does not say.
#[cfg(feature = "h5")]
const DEFAULT_INVALID: f64 = 1e38;

const SURFACE_HDU: &str = "SURFACE";

#[derive(Error, Debug)]
pub enum SurfaceFileError {
    #[error("FITS I/O error: {0}")]
    FitsIo(#[from] fitsio::compat::errors::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "h5")]
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),

    #[error("{0}: reading HDF5 measurements needs the `h5` feature")]
    Hdf5Unsupported(PathBuf),

    #[error("{path}: expected a 2-D image, found NAXIS={naxis}")]
    NotAnImage { path: PathBuf, naxis: i64 },

    #[error("{path}: image data does not match its {rows}x{cols} header")]
    ShapeMismatch {
        path: PathBuf,
        rows: usize,
        cols: usize,
    },

    #[error("{path}: {source}")]
    Aperture {
        path: PathBuf,
        #[source]
        source: ApertureError,
    },

    #[error("no measurement files in {0}")]
    NoMeasurements(PathBuf),
}

/// Write a height map to a FITS file, replacing any existing file.
pub fn save_surface_map<P: AsRef<Path>>(
    heights: ArrayView2<f64>,
    path: P,
) -> Result<(), SurfaceFileError> {
    let (rows, cols) = heights.dim();
    let mut fptr = FitsFile::create(&path).overwrite().open()?;

    let name = SURFACE_HDU.to_string();
    let description = ImageDescription {
        data_type: ImageType::Double,
        dimensions: vec![cols, rows],
    };
    let hdu = fptr.create_image(&name, &description)?;

    let flat: Vec<f64> = heights.slice(s![..;-1, ..]).iter().copied().collect();
    f64::write_image(&mut fptr, &hdu, &flat)?;
    hdu.write_key(&mut fptr, "EXTNAME", &name.clone())?;

    debug!("Saved {}x{} surface to {}", rows, cols, path.as_ref().display());
    Ok(())
}

/// Read the first image HDU of a FITS file as a height map.
pub fn load_surface_map<P: AsRef<Path>>(path: P) -> Result<Array2<f64>, SurfaceFileError> {
    let path_buf = path.as_ref().to_path_buf();
    let fptr = FitsFile::open(&path)?;
    let hdu = fptr.hdu(0)?;

    let naxis = hdu.read_key::<i64>(&fptr, "NAXIS").unwrap_or(0);
    if naxis != 2 {
        return Err(SurfaceFileError::NotAnImage {
            path: path_buf,
            naxis,
        });
    }
    let cols = hdu.read_key::<i64>(&fptr, "NAXIS1").unwrap_or(0) as usize;
    let rows = hdu.read_key::<i64>(&fptr, "NAXIS2").unwrap_or(0) as usize;

    let data = f64::read_image(&fptr, &hdu)?;
    let shape_mismatch = |_| SurfaceFileError::ShapeMismatch {
        path: path_buf.clone(),
        rows,
        cols,
    };
    let stored = Array2::from_shape_vec((rows, cols), data).map_err(shape_mismatch)?;

    Ok(stored.slice(s![..;-1, ..]).to_owned())
}

/// Read the height map of an interferometer measurement file.
///
/// Pixels flagged invalid by the dataset's `invalid` attribute, or
/// non-finite, become NaN. Heights stay in the units the service wrote.
#[cfg(feature = "h5")]
pub fn load_measurement_map<P: AsRef<Path>>(path: P) -> Result<Array2<f64>, SurfaceFileError> {
    let path_buf = path.as_ref().to_path_buf();
    let file = hdf5::File::open(&path)?;
    let dataset = file.dataset(MEASUREMENT_DATASET)?;

    let shape = dataset.shape();
    let &[rows, cols] = shape.as_slice() else {
        return Err(SurfaceFileError::NotAnImage {
            path: path_buf,
            naxis: shape.len() as i64,
        });
    };

    let invalid = dataset
        .attr("invalid")
        .and_then(|attr| attr.read_scalar::<f64>())
        .unwrap_or(DEFAULT_INVALID);
    let data: Vec<f64> = dataset
        .read_raw::<f64>()?
        .into_iter()
        .map(|v| {
            if v.is_finite() && v < invalid {
                v
            } else {
                f64::NAN
            }
        })
        .collect();

    let shape_mismatch = |_| SurfaceFileError::ShapeMismatch {
        path: path_buf.clone(),
        rows,
        cols,
    };
    let heights = Array2::from_shape_vec((rows, cols), data).map_err(shape_mismatch)?;
    debug!("Loaded {}x{} measurement from {}", rows, cols, path_buf.display());
    Ok(heights)
}

/// Without the `h5` feature measurement files cannot be decoded.
#[cfg(not(feature = "h5"))]
pub fn load_measurement_map<P: AsRef<Path>>(path: P) -> Result<Array2<f64>, SurfaceFileError> {
    Err(SurfaceFileError::Hdf5Unsupported(path.as_ref().to_path_buf()))
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|s| s.to_str())
}

/// Load a measurement file and detect its aperture circle.
///
/// HDF5 files go through [`load_measurement_map`], anything else is read as
/// FITS.
pub fn load_raw_frame<P: AsRef<Path>>(path: P) -> Result<RawFrame, SurfaceFileError> {
    let path = path.as_ref();
    let heights = match extension(path) {
        Some(MEASUREMENT_EXTENSION) => load_measurement_map(path)?,
        _ => load_surface_map(path)?,
    };
    RawFrame::with_detected_circle(heights).map_err(|source| SurfaceFileError::Aperture {
        path: path.to_path_buf(),
        source,
    })
}

/// List measurement files (`.h5` or `.fits`) in a folder, sorted by name.
pub fn list_measurement_files<P: AsRef<Path>>(folder: P) -> Result<Vec<PathBuf>, SurfaceFileError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(folder)? {
        let path = entry?.path();
        let is_frame = matches!(
            extension(&path),
            Some(MEASUREMENT_EXTENSION) | Some(SURFACE_EXTENSION)
        );
        if path.is_file() && is_frame {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Load every measurement file in a folder as a raw frame.
///
/// Files whose aperture cannot be detected are skipped with a warning; an
/// unreadable file is an error.
pub fn load_measurement_folder<P: AsRef<Path>>(
    folder: P,
) -> Result<Vec<RawFrame>, SurfaceFileError> {
    let folder = folder.as_ref();
    let mut frames = Vec::new();
    for path in list_measurement_files(folder)? {
        match load_raw_frame(&path) {
            Ok(frame) => frames.push(frame),
            Err(SurfaceFileError::Aperture { path, source }) => {
                warn!("Skipping {}: {}", path.display(), source);
            }
            Err(e) => return Err(e),
        }
    }
    if frames.is_empty() {
        return Err(SurfaceFileError::NoMeasurements(folder.to_path_buf()));
    }
    Ok(frames)
}

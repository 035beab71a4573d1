//! Registration and averaging of interferometer frames.
//!
//! Frames in a batch are taken with the mirror at slightly different positions
//! in the aperture. Each frame is re-expressed on the batch's average circle,
//! stripped of its own piston, tip, tilt and power (mechanical jitter between
//! frames would otherwise smear the average), and the results are averaged
//! pixelwise.

use ndarray::Array2;
use thiserror::Error;
use tracing::{debug, info};

use crate::aperture::{ApertureCircle, ApertureError};
use crate::modal::{fit_and_remove, ModalError};
use crate::surface::{flip_vertical, nan_mean, RawFrame, RegisteredSurface, SurfaceMap};
use crate::zernike::{mode_index, ZernikeBasis};

/// Inner-radius crop applied to the clear aperture by default.
pub const DEFAULT_ID_CROP_FACTOR: f64 = 1.25;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistrationError {
    #[error("no frames to register")]
    EmptyBatch,

    #[error("frame {index} has grid {found:?}, expected {expected:?}")]
    GridMismatch {
        index: usize,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("invalid aperture circle: {0}")]
    InvalidCircle(#[from] ApertureError),

    #[error("invalid clear aperture: outer {outer} m, inner {inner} m")]
    InvalidClearAperture { outer: f64, inner: f64 },

    #[error("frame {index} normalisation failed: {source}")]
    Normalization {
        index: usize,
        #[source]
        source: ModalError,
    },
}

/// Annular pupil on the average circle, in normalised radius.
#[derive(Debug, Clone, Copy)]
struct Pupil {
    circle: ApertureCircle,
    inner_ratio: f64,
}

impl Pupil {
    fn contains(&self, row: usize, col: usize) -> bool {
        let (rho, _) = self.circle.polar(row, col);
        rho <= 1.0 && rho >= self.inner_ratio
    }
}

/// Register a batch of frames on their average circle and average them.
///
/// # Arguments
/// * `raw_frames` - Frames sharing one pixel grid
/// * `clear_outer` - Outer clear-aperture radius in metres
/// * `clear_inner` - Inner clear-aperture radius in metres
/// * `basis` - Basis used for the per-frame tip/tilt/power normalisation
/// * `id_crop_factor` - Multiplier on `clear_inner` for the inner mask
///
/// The result shares the input grid, is NaN outside the cropped annulus, and
/// is flipped vertically to the reporting orientation.
pub fn register_and_average(
    raw_frames: &[RawFrame],
    clear_outer: f64,
    clear_inner: f64,
    basis: &ZernikeBasis,
    id_crop_factor: f64,
) -> Result<RegisteredSurface, RegistrationError> {
    let first = raw_frames.first().ok_or(RegistrationError::EmptyBatch)?;
    let dim = first.dim();
    for (index, frame) in raw_frames.iter().enumerate() {
        if frame.dim() != dim {
            return Err(RegistrationError::GridMismatch {
                index,
                expected: dim,
                found: frame.dim(),
            });
        }
    }

    if !(clear_outer > 0.0) || clear_inner < 0.0 {
        return Err(RegistrationError::InvalidClearAperture {
            outer: clear_outer,
            inner: clear_inner,
        });
    }

    let circles: Vec<ApertureCircle> = raw_frames.iter().map(|f| *f.circle()).collect();
    let average = ApertureCircle::average(&circles)?;
    let pupil = Pupil {
        circle: average,
        inner_ratio: clear_inner * id_crop_factor / clear_outer,
    };
    debug!(
        "Average circle ({:.2}, {:.2}) r={:.2}, inner ratio {:.3}",
        average.center_x, average.center_y, average.radius, pupil.inner_ratio
    );

    let maps = raw_frames
        .iter()
        .enumerate()
        .map(|(index, frame)| {
            let heights = frame.heights();
            let masked = Array2::from_shape_fn(dim, |(r, c)| {
                if pupil.contains(r, c) {
                    heights[[r, c]]
                } else {
                    f64::NAN
                }
            });
            fit_and_remove(
                masked.view(),
                &average,
                basis,
                &mode_index::FRAME_NORMALIZATION,
            )
            .map_err(|source| RegistrationError::Normalization { index, source })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let averaged = nan_mean(&maps).ok_or(RegistrationError::EmptyBatch)?;
    let flipped = flip_vertical(averaged.view());

    info!("Registered {} frames on a {}x{} grid", maps.len(), dim.0, dim.1);

    Ok(RegisteredSurface::new(
        SurfaceMap::new(flipped, average.flipped_vertically(dim.0)),
        raw_frames.len(),
    ))
}

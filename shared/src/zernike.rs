//! Zernike modal basis and the bench's two index conventions.
//!
//! # Ordering
//!
//! Modes use the sequential ANSI/OSA single index `j`, with
//! `j = (n(n + 2) + m) / 2`:
//!
//! | j  | (n, m)  | name                |
//! |----|---------|---------------------|
//! | 0  | (0, 0)  | piston              |
//! | 1  | (1, -1) | tip                 |
//! | 2  | (1, 1)  | tilt                |
//! | 3  | (2, -2) | astigmatism         |
//! | 4  | (2, 0)  | power (defocus)     |
//! | 12 | (4, 0)  | primary spherical   |
//! | 24 | (6, 0)  | secondary spherical |
//! | 40 | (8, 0)  | tertiary spherical  |
//!
//! # Two conventions
//!
//! The interferometer's live coefficient vector puts power at index 3 while
//! the mode-removal lists used for surface reporting put power at index 4.
//! Both are calibrated into the bench and are kept as separate constant sets:
//! [`mode_index`] for removal lists and [`live_index`] for live vectors.
//! Whether the divergence is intentional has never been established.

use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aperture::ApertureCircle;

/// Mode indices used in removal lists and basis reconstruction.
pub mod mode_index {
    pub const PISTON: usize = 0;
    pub const TIP: usize = 1;
    pub const TILT: usize = 2;
    pub const ASTIGMATISM: usize = 3;
    pub const POWER: usize = 4;
    pub const PRIMARY_SPHERICAL: usize = 12;
    pub const SECONDARY_SPHERICAL: usize = 24;
    pub const TERTIARY_SPHERICAL: usize = 40;

    /// Modes fitted out of every frame before averaging.
    pub const FRAME_NORMALIZATION: [usize; 4] = [PISTON, TIP, TILT, POWER];
}

/// Indices into the live coefficient vector returned during alignment.
///
/// Index 3 is power here, not astigmatism.
pub mod live_index {
    pub const TIP: usize = 1;
    pub const TILT: usize = 2;
    pub const POWER: usize = 3;
}

/// Highest mode index of the bench's standard basis.
pub const DEFAULT_ORDER: usize = 44;

/// A named list of modes to strip from a surface before reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovalPreset {
    pub name: &'static str,
    pub modes: &'static [usize],
}

pub const UNCORRECTED: RemovalPreset = RemovalPreset {
    name: "uncorrected",
    modes: &[0, 1, 2, 4],
};

pub const SPHERICAL_CORRECTED: RemovalPreset = RemovalPreset {
    name: "sph corrected",
    modes: &[0, 1, 2, 4, 12, 24, 40],
};

pub const TREFOIL_CORRECTED: RemovalPreset = RemovalPreset {
    name: "trefoil corrected",
    modes: &[
        0, 1, 2, 3, 4, 5, 6, 9, 10, 14, 15, 20, 21, 27, 28, 35, 36, 44,
    ],
};

pub const REMOVAL_PRESETS: [RemovalPreset; 3] =
    [UNCORRECTED, SPHERICAL_CORRECTED, TREFOIL_CORRECTED];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ZernikeError {
    #[error("outer radius must be positive, got {0} µm")]
    InvalidOuterRadius(u32),

    #[error("inner radius {inner} µm must be smaller than outer radius {outer} µm")]
    InvalidInnerRadius { inner: u32, outer: u32 },
}

/// Radial and azimuthal order of one mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZernikeMode {
    pub n: u32,
    pub m: i32,
}

impl ZernikeMode {
    /// Convert an ANSI single index to `(n, m)`.
    pub fn from_index(j: usize) -> Self {
        let mut n = 0usize;
        while (n + 1) * (n + 2) / 2 <= j {
            n += 1;
        }
        let m = 2 * j as i64 - (n * (n + 2)) as i64;
        Self {
            n: n as u32,
            m: m as i32,
        }
    }

    /// ANSI single index of this mode.
    pub fn index(&self) -> usize {
        let n = self.n as i64;
        ((n * (n + 2) + self.m as i64) / 2) as usize
    }

    /// Evaluate the unit-disk-normalised mode at polar coordinates.
    pub fn evaluate(&self, rho: f64, theta: f64) -> f64 {
        let m_abs = self.m.unsigned_abs();
        let radial = radial_polynomial(self.n, m_abs, rho);
        if self.m == 0 {
            ((self.n + 1) as f64).sqrt() * radial
        } else {
            let norm = (2.0 * (self.n + 1) as f64).sqrt();
            if self.m > 0 {
                norm * radial * (self.m as f64 * theta).cos()
            } else {
                norm * radial * (m_abs as f64 * theta).sin()
            }
        }
    }
}

fn factorial(k: u32) -> f64 {
    (1..=k).fold(1.0, |acc, v| acc * v as f64)
}

fn radial_polynomial(n: u32, m: u32, rho: f64) -> f64 {
    if (n - m) % 2 != 0 {
        return 0.0;
    }
    let half_sum = (n + m) / 2;
    let half_diff = (n - m) / 2;
    (0..=half_diff)
        .map(|k| {
            let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
            sign * factorial(n - k)
                / (factorial(k) * factorial(half_sum - k) * factorial(half_diff - k))
                * rho.powi((n - 2 * k) as i32)
        })
        .sum()
}

/// Zernike basis over an annular clear aperture.
///
/// Built once from `(order, outer_radius_um, inner_radius_um)` and immutable
/// afterwards. The radii set the annulus `obscuration_ratio() <= rho <= 1`
/// that fits sample. Sampling is a pure function of the triple and the pupil
/// geometry, so repeated fits produce identical coefficients.
#[derive(Debug, Clone, PartialEq)]
pub struct ZernikeBasis {
    order: usize,
    outer_radius_um: u32,
    inner_radius_um: u32,
    modes: Vec<ZernikeMode>,
}

impl ZernikeBasis {
    /// Build a basis with modes `0..=order`.
    pub fn new(
        order: usize,
        outer_radius_um: u32,
        inner_radius_um: u32,
    ) -> Result<Self, ZernikeError> {
        if outer_radius_um == 0 {
            return Err(ZernikeError::InvalidOuterRadius(outer_radius_um));
        }
        if inner_radius_um >= outer_radius_um {
            return Err(ZernikeError::InvalidInnerRadius {
                inner: inner_radius_um,
                outer: outer_radius_um,
            });
        }
        let modes = (0..=order).map(ZernikeMode::from_index).collect();
        Ok(Self {
            order,
            outer_radius_um,
            inner_radius_um,
            modes,
        })
    }

    /// Build from clear-aperture radii given in metres, truncated to µm.
    pub fn from_clear_aperture(
        order: usize,
        clear_outer_m: f64,
        clear_inner_m: f64,
    ) -> Result<Self, ZernikeError> {
        Self::new(
            order,
            (clear_outer_m * 1e6) as u32,
            (clear_inner_m * 1e6) as u32,
        )
    }

    /// Highest mode index.
    pub fn order(&self) -> usize {
        self.order
    }

    pub fn num_modes(&self) -> usize {
        self.modes.len()
    }

    pub fn outer_radius_um(&self) -> u32 {
        self.outer_radius_um
    }

    pub fn inner_radius_um(&self) -> u32 {
        self.inner_radius_um
    }

    /// Central obscuration as a fraction of the outer radius.
    pub fn obscuration_ratio(&self) -> f64 {
        self.inner_radius_um as f64 / self.outer_radius_um as f64
    }

    pub fn mode(&self, index: usize) -> Option<ZernikeMode> {
        self.modes.get(index).copied()
    }

    /// Sample the requested modes at the given pixels.
    ///
    /// Returns a `pixels.len() x modes.len()` column-major matrix. Indices
    /// beyond the basis are the caller's responsibility to reject.
    pub fn design_matrix(
        &self,
        circle: &ApertureCircle,
        pixels: &[(usize, usize)],
        modes: &[usize],
    ) -> nalgebra::DMatrix<f64> {
        let polar: Vec<(f64, f64)> = pixels.iter().map(|&(r, c)| circle.polar(r, c)).collect();

        let columns: Vec<Vec<f64>> = modes
            .par_iter()
            .map(|&j| {
                let mode = ZernikeMode::from_index(j);
                polar
                    .iter()
                    .map(|&(rho, theta)| mode.evaluate(rho, theta))
                    .collect()
            })
            .collect();

        nalgebra::DMatrix::from_fn(pixels.len(), modes.len(), |r, c| columns[c][r])
    }

    /// Render a single mode over a grid; pixels outside the unit circle are NaN.
    pub fn mode_map(
        &self,
        index: usize,
        dim: (usize, usize),
        circle: &ApertureCircle,
    ) -> Array2<f64> {
        let mode = ZernikeMode::from_index(index);
        Array2::from_shape_fn(dim, |(r, c)| {
            let (rho, theta) = circle.polar(r, c);
            if rho <= 1.0 {
                mode.evaluate(rho, theta)
            } else {
                f64::NAN
            }
        })
    }
}

/// Coefficient vector reported live by the interferometer during alignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveZernikeCoefficients(Vec<f64>);

impl LiveZernikeCoefficients {
    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn tip(&self) -> Option<f64> {
        self.0.get(live_index::TIP).copied()
    }

    pub fn tilt(&self) -> Option<f64> {
        self.0.get(live_index::TILT).copied()
    }

    pub fn power(&self) -> Option<f64> {
        self.0.get(live_index::POWER).copied()
    }
}

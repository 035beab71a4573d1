//! Modal decomposition of surface maps.
//!
//! A surface is fitted against a [`ZernikeBasis`] by least squares over its
//! finite pixels inside the aperture circle. Modes can then be subtracted
//! individually, which is how alignment terms are separated from figure error.

use nalgebra::{DMatrix, DVector};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::aperture::ApertureCircle;
use crate::surface::SurfaceMap;
use crate::zernike::ZernikeBasis;

/// Inches to metres.
pub const INCH_M: f64 = 25.4e-3;

/// Relative singular value threshold for the normal matrix.
const RANK_TOLERANCE: f64 = 1e-12;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModalError {
    /// Fewer usable pixels than modes, or a numerically singular fit.
    #[error("rank deficient fit: {valid_pixels} valid pixels for {modes} modes")]
    RankDeficient { valid_pixels: usize, modes: usize },

    #[error("mode {index} outside basis of {available} modes")]
    ModeOutOfRange { index: usize, available: usize },

    #[error("projection has {projection} modes but basis has {basis}")]
    BasisMismatch { projection: usize, basis: usize },
}

/// Sampled basis and surface data for one decomposition (the `M` of a fit).
#[derive(Debug, Clone)]
pub struct ModalProjection {
    heights: Array2<f64>,
    circle: ApertureCircle,
    pixels: Vec<(usize, usize)>,
    design: DMatrix<f64>,
}

impl ModalProjection {
    /// Pixels that took part in the fit, as `(row, col)`.
    pub fn pixels(&self) -> &[(usize, usize)] {
        &self.pixels
    }

    /// Design matrix: one row per fitted pixel, one column per mode.
    pub fn design(&self) -> &DMatrix<f64> {
        &self.design
    }

    pub fn num_modes(&self) -> usize {
        self.design.ncols()
    }
}

/// Least-squares modal coefficients (the `C` of a fit).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModalCoefficients(Vec<f64>);

impl ModalCoefficients {
    pub fn values(&self) -> &[f64] {
        &self.0
    }

    pub fn get(&self, index: usize) -> Option<f64> {
        self.0.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Finite pixels inside the basis annulus: `obscuration <= rho <= 1` on
/// `circle`.
fn fit_pixels(
    heights: ArrayView2<f64>,
    circle: &ApertureCircle,
    basis: &ZernikeBasis,
) -> Vec<(usize, usize)> {
    let obscuration = basis.obscuration_ratio();
    heights
        .indexed_iter()
        .filter(|(_, v)| v.is_finite())
        .map(|(idx, _)| idx)
        .filter(|&(r, c)| {
            let rho = circle.polar(r, c).0;
            (obscuration..=1.0).contains(&rho)
        })
        .collect()
}

/// Solve `design * x = samples` through the normal equations.
fn solve_least_squares(
    design: &DMatrix<f64>,
    samples: &DVector<f64>,
) -> Result<DVector<f64>, ModalError> {
    let rank_error = ModalError::RankDeficient {
        valid_pixels: design.nrows(),
        modes: design.ncols(),
    };
    if design.nrows() < design.ncols() {
        return Err(rank_error);
    }

    let normal = design.transpose() * design;
    let rhs = design.transpose() * samples;

    let svd = normal.svd(true, true);
    let max_sv = svd.singular_values.max();
    if !(max_sv > 0.0) || svd.rank(max_sv * RANK_TOLERANCE) < design.ncols() {
        return Err(rank_error);
    }

    svd.solve(&rhs, max_sv * RANK_TOLERANCE)
        .map_err(|_| rank_error)
}

/// Project a surface onto every mode of `basis`.
///
/// NaN pixels and pixels outside the basis annulus (the aperture circle minus
/// the central obscuration) are left out of the fit.
///
/// # Errors
/// [`ModalError::RankDeficient`] when fewer pixels than modes remain or the
/// sampled modes are linearly dependent on the remaining pixels.
pub fn decompose(
    surface: &SurfaceMap,
    basis: &ZernikeBasis,
) -> Result<(ModalProjection, ModalCoefficients), ModalError> {
    let circle = *surface.circle();
    let pixels = fit_pixels(surface.heights(), &circle, basis);
    let modes: Vec<usize> = (0..basis.num_modes()).collect();

    if pixels.len() < modes.len() {
        return Err(ModalError::RankDeficient {
            valid_pixels: pixels.len(),
            modes: modes.len(),
        });
    }

    let design = basis.design_matrix(&circle, &pixels, &modes);
    let heights = surface.heights();
    let samples = DVector::from_iterator(pixels.len(), pixels.iter().map(|&p| heights[p]));
    let coefficients = solve_least_squares(&design, &samples)?;

    debug!("Decomposed {} pixels onto {} modes", pixels.len(), modes.len());

    Ok((
        ModalProjection {
            heights: heights.to_owned(),
            circle,
            pixels,
            design,
        },
        ModalCoefficients(coefficients.iter().copied().collect()),
    ))
}

/// Rebuild the surface with the listed modes subtracted.
///
/// Content not described by the listed modes, including the fit residual, is
/// carried over unchanged; an empty list returns the original map. Pixels that
/// did not take part in the fit keep their original value.
pub fn remove_modes(
    projection: &ModalProjection,
    coefficients: &ModalCoefficients,
    basis: &ZernikeBasis,
    mode_indices: &[usize],
) -> Result<SurfaceMap, ModalError> {
    if projection.num_modes() != basis.num_modes() {
        return Err(ModalError::BasisMismatch {
            projection: projection.num_modes(),
            basis: basis.num_modes(),
        });
    }
    let available = coefficients.len().min(basis.num_modes());
    if let Some(&index) = mode_indices.iter().find(|&&i| i >= available) {
        return Err(ModalError::ModeOutOfRange { index, available });
    }

    let mut heights = projection.heights.clone();
    for &mode in mode_indices {
        let c = coefficients.0[mode];
        let column = projection.design.column(mode);
        for (k, &pixel) in projection.pixels.iter().enumerate() {
            heights[pixel] -= c * column[k];
        }
    }

    Ok(SurfaceMap::new(heights, projection.circle))
}

/// Fit only `modes` on a map and return the map with them subtracted.
///
/// Used for per-frame normalisation where the full basis is not needed.
pub fn fit_and_remove(
    heights: ArrayView2<f64>,
    circle: &ApertureCircle,
    basis: &ZernikeBasis,
    modes: &[usize],
) -> Result<Array2<f64>, ModalError> {
    if let Some(&index) = modes.iter().find(|&&i| i >= basis.num_modes()) {
        return Err(ModalError::ModeOutOfRange {
            index,
            available: basis.num_modes(),
        });
    }

    let pixels = fit_pixels(heights, circle, basis);
    let design = basis.design_matrix(circle, &pixels, modes);
    let samples = DVector::from_iterator(pixels.len(), pixels.iter().map(|&p| heights[p]));
    let fitted = solve_least_squares(&design, &samples)?;
    let model = &design * &fitted;

    let mut out = heights.to_owned();
    for (k, &pixel) in pixels.iter().enumerate() {
        out[pixel] -= model[k];
    }
    Ok(out)
}

/// Physical radii of the clear-aperture annulus kept by [`crop_to_annulus`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnnulusBounds {
    /// Inner radius in metres
    pub inner_m: f64,
    /// Outer radius in metres
    pub outer_m: f64,
}

impl Default for AnnulusBounds {
    fn default() -> Self {
        Self {
            inner_m: 3.0 * INCH_M,
            outer_m: 15.0 * INCH_M,
        }
    }
}

/// Mask every pixel whose physical radius falls outside `bounds`.
///
/// Pixel distances are scaled so that the surface's aperture radius equals
/// `outer_diameter / 2`. Pixels inside the annulus are returned untouched.
pub fn crop_to_annulus(
    surface: &SurfaceMap,
    outer_diameter: f64,
    bounds: AnnulusBounds,
) -> SurfaceMap {
    let circle = surface.circle();
    let metres_per_pixel = (outer_diameter / 2.0) / circle.radius;

    let mut heights = surface.heights().to_owned();
    for ((r, c), value) in heights.indexed_iter_mut() {
        let radius_m = circle.distance(r, c) * metres_per_pixel;
        if radius_m < bounds.inner_m || radius_m > bounds.outer_m {
            *value = f64::NAN;
        }
    }
    SurfaceMap::new(heights, *circle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zernike::mode_index;
    use approx::assert_relative_eq;

    const GRID: usize = 41;

    fn test_circle() -> ApertureCircle {
        ApertureCircle::new(20.0, 20.0, 18.0).unwrap()
    }

    fn test_basis() -> ZernikeBasis {
        ZernikeBasis::new(14, 400_000, 40_000).unwrap()
    }

    fn synthetic_surface(terms: &[(usize, f64)]) -> SurfaceMap {
        let basis = test_basis();
        let circle = test_circle();
        let mut heights = Array2::<f64>::zeros((GRID, GRID));
        for &(mode, amp) in terms {
            heights = heights + basis.mode_map(mode, (GRID, GRID), &circle) * amp;
        }
        SurfaceMap::new(heights, circle)
    }

    #[test]
    fn test_decompose_recovers_coefficients() {
        let surface = synthetic_surface(&[
            (mode_index::POWER, 0.7),
            (mode_index::TIP, -0.2),
            (7, 0.05),
        ]);
        let basis = test_basis();

        let (_, coeffs) = decompose(&surface, &basis).unwrap();

        assert_relative_eq!(coeffs.get(mode_index::POWER).unwrap(), 0.7, epsilon = 1e-8);
        assert_relative_eq!(coeffs.get(mode_index::TIP).unwrap(), -0.2, epsilon = 1e-8);
        assert_relative_eq!(coeffs.get(7).unwrap(), 0.05, epsilon = 1e-8);
        assert_relative_eq!(coeffs.get(mode_index::TILT).unwrap(), 0.0, epsilon = 1e-8);
    }

    #[test]
    fn test_remove_nothing_is_identity() {
        let mut surface = synthetic_surface(&[(mode_index::POWER, 0.3), (5, 0.1)]);
        let mut heights = surface.heights().to_owned();
        heights[[20, 21]] += 0.01;
        surface = SurfaceMap::new(heights, *surface.circle());
        let basis = test_basis();

        let (projection, coeffs) = decompose(&surface, &basis).unwrap();
        let rebuilt = remove_modes(&projection, &coeffs, &basis, &[]).unwrap();

        for (a, b) in rebuilt.heights().iter().zip(surface.heights().iter()) {
            if a.is_nan() {
                assert!(b.is_nan());
            } else {
                assert_relative_eq!(*a, *b, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_remove_modes_keeps_unlisted_content() {
        let surface = synthetic_surface(&[
            (mode_index::PISTON, 1.0),
            (mode_index::POWER, 0.5),
            (12, 0.2),
        ]);
        let figure_only = synthetic_surface(&[(12, 0.2)]);
        let basis = test_basis();

        let (projection, coeffs) = decompose(&surface, &basis).unwrap();
        let cleaned = remove_modes(&projection, &coeffs, &basis, &[0, 1, 2, 4]).unwrap();

        let circle = test_circle();
        for ((r, c), a) in cleaned.heights().indexed_iter() {
            let b = figure_only.heights()[[r, c]];
            if b.is_finite() && circle.polar(r, c).0 >= basis.obscuration_ratio() {
                assert_relative_eq!(*a, b, epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn test_remove_modes_out_of_range() {
        let surface = synthetic_surface(&[(0, 1.0)]);
        let basis = test_basis();
        let (projection, coeffs) = decompose(&surface, &basis).unwrap();

        let err = remove_modes(&projection, &coeffs, &basis, &[0, 99]).unwrap_err();
        assert_eq!(
            err,
            ModalError::ModeOutOfRange {
                index: 99,
                available: 15
            }
        );
    }

    #[test]
    fn test_decompose_too_few_pixels_is_rank_deficient() {
        let mut heights = Array2::from_elem((GRID, GRID), f64::NAN);
        for c in 5..10 {
            heights[[20, c]] = 1.0;
        }
        let surface = SurfaceMap::new(heights, test_circle());

        let err = decompose(&surface, &test_basis()).unwrap_err();
        assert!(matches!(err, ModalError::RankDeficient { valid_pixels: 5, .. }));
    }

    #[test]
    fn test_decompose_collinear_pixels_is_rank_deficient() {
        // A single row holds enough pixels but cannot separate the modes.
        let mut heights = Array2::from_elem((GRID, GRID), f64::NAN);
        for c in 3..38 {
            heights[[20, c]] = 0.0;
        }
        let surface = SurfaceMap::new(heights, test_circle());

        let err = decompose(&surface, &test_basis()).unwrap_err();
        assert!(matches!(err, ModalError::RankDeficient { .. }));
    }

    #[test]
    fn test_central_obscuration_is_not_fitted() {
        // Power across the aperture plus a spike confined to rho < 0.3.
        let mut surface = synthetic_surface(&[(mode_index::POWER, 0.7)]);
        let circle = test_circle();
        let mut heights = surface.heights().to_owned();
        for ((r, c), v) in heights.indexed_iter_mut() {
            if circle.polar(r, c).0 < 0.3 {
                *v += 5.0;
            }
        }
        surface = SurfaceMap::new(heights, circle);

        let obscured = ZernikeBasis::new(14, 400_000, 160_000).unwrap();
        let (projection, wide) = decompose(&surface, &obscured).unwrap();
        assert_relative_eq!(wide.get(mode_index::POWER).unwrap(), 0.7, epsilon = 1e-8);
        assert_relative_eq!(wide.get(mode_index::PISTON).unwrap(), 0.0, epsilon = 1e-8);
        assert!(projection
            .pixels()
            .iter()
            .all(|&(r, c)| circle.polar(r, c).0 >= 0.4));

        let (_, narrow) = decompose(&surface, &test_basis()).unwrap();
        assert_ne!(wide, narrow);
        assert!(narrow.get(mode_index::PISTON).unwrap() > 0.01);
    }

    #[test]
    fn test_decompose_is_deterministic() {
        let surface = synthetic_surface(&[(3, 0.4), (8, -0.1)]);
        let basis = test_basis();

        let (_, a) = decompose(&surface, &basis).unwrap();
        let (_, b) = decompose(&surface, &basis).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_fit_and_remove_tip_tilt_power() {
        let surface = synthetic_surface(&[(0, 2.0), (1, 0.3), (2, -0.4), (4, 0.8)]);
        let cleaned = fit_and_remove(
            surface.heights(),
            surface.circle(),
            &test_basis(),
            &mode_index::FRAME_NORMALIZATION,
        )
        .unwrap();

        for v in cleaned.iter().filter(|v| v.is_finite()) {
            assert_relative_eq!(*v, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_crop_to_annulus() {
        let circle = ApertureCircle::new(20.0, 20.0, 20.0).unwrap();
        let surface = SurfaceMap::new(Array2::from_elem((GRID, GRID), 1.5), circle);
        // 20 px == 0.4 m radius, so 1 px == 0.02 m.
        let bounds = AnnulusBounds {
            inner_m: 0.1,
            outer_m: 0.3,
        };

        let cropped = crop_to_annulus(&surface, 0.8, bounds);

        for ((r, c), v) in cropped.heights().indexed_iter() {
            let radius_m = circle.distance(r, c) * 0.02;
            if radius_m > 0.1 + 1e-9 && radius_m < 0.3 - 1e-9 {
                assert_eq!(*v, 1.5, "pixel ({r}, {c}) inside annulus changed");
            } else if radius_m < 0.1 - 1e-9 || radius_m > 0.3 + 1e-9 {
                assert!(v.is_nan(), "pixel ({r}, {c}) outside annulus kept");
            }
        }
    }

    #[test]
    fn test_default_annulus_bounds() {
        let bounds = AnnulusBounds::default();
        assert_relative_eq!(bounds.inner_m, 0.0762, epsilon = 1e-12);
        assert_relative_eq!(bounds.outer_m, 0.381, epsilon = 1e-12);
    }
}

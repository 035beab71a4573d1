//! Height maps with NaN as the missing-data marker.
//!
//! ndarray reductions do not skip NaN, so every reduction here counts the
//! finite samples explicitly instead of relying on NaN propagation.

use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::aperture::{ApertureCircle, ApertureError};

/// One acquired interferometer measurement.
#[derive(Debug, Clone)]
pub struct RawFrame {
    heights: Array2<f64>,
    circle: ApertureCircle,
}

impl RawFrame {
    /// Build a frame with a known aperture circle.
    pub fn new(heights: Array2<f64>, circle: ApertureCircle) -> Result<Self, ApertureError> {
        circle.validate()?;
        Ok(Self { heights, circle })
    }

    /// Build a frame and detect its aperture from the valid-pixel footprint.
    pub fn with_detected_circle(heights: Array2<f64>) -> Result<Self, ApertureError> {
        let circle = ApertureCircle::detect(heights.view())?;
        Ok(Self { heights, circle })
    }

    pub fn heights(&self) -> ArrayView2<'_, f64> {
        self.heights.view()
    }

    pub fn circle(&self) -> &ApertureCircle {
        &self.circle
    }

    /// Grid shape as `(rows, cols)`.
    pub fn dim(&self) -> (usize, usize) {
        self.heights.dim()
    }
}

/// A height map together with the aperture it is expressed against.
#[derive(Debug, Clone)]
pub struct SurfaceMap {
    heights: Array2<f64>,
    circle: ApertureCircle,
}

impl SurfaceMap {
    pub fn new(heights: Array2<f64>, circle: ApertureCircle) -> Self {
        Self { heights, circle }
    }

    pub fn heights(&self) -> ArrayView2<'_, f64> {
        self.heights.view()
    }

    pub fn into_heights(self) -> Array2<f64> {
        self.heights
    }

    pub fn circle(&self) -> &ApertureCircle {
        &self.circle
    }

    pub fn dim(&self) -> (usize, usize) {
        self.heights.dim()
    }

    /// Number of finite pixels.
    pub fn valid_count(&self) -> usize {
        self.heights.iter().filter(|v| v.is_finite()).count()
    }

    /// Pixelwise difference `self - other`; NaN where either side is NaN.
    ///
    /// Returns `None` when the grids differ.
    pub fn difference(&self, other: &SurfaceMap) -> Option<SurfaceMap> {
        if self.dim() != other.dim() {
            return None;
        }
        let heights = &self.heights - &other.heights;
        Some(SurfaceMap::new(heights, self.circle))
    }

    pub fn stats(&self) -> Option<SurfaceStats> {
        SurfaceStats::compute(self.heights.view())
    }
}

/// Output of frame registration: an averaged, vertically flipped surface.
#[derive(Debug, Clone)]
pub struct RegisteredSurface {
    surface: SurfaceMap,
    frame_count: usize,
}

impl RegisteredSurface {
    pub(crate) fn new(surface: SurfaceMap, frame_count: usize) -> Self {
        Self {
            surface,
            frame_count,
        }
    }

    pub fn surface(&self) -> &SurfaceMap {
        &self.surface
    }

    pub fn into_surface(self) -> SurfaceMap {
        self.surface
    }

    /// Number of raw frames averaged into this surface.
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }
}

/// Summary statistics over the finite pixels of a map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SurfaceStats {
    pub mean: f64,
    /// RMS about the mean
    pub rms: f64,
    pub peak_to_valley: f64,
    pub valid_pixels: usize,
}

impl SurfaceStats {
    /// Compute statistics, or `None` if no pixel is finite.
    pub fn compute(heights: ArrayView2<f64>) -> Option<Self> {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for &v in heights.iter().filter(|v| v.is_finite()) {
            count += 1;
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }
        if count == 0 {
            return None;
        }

        let mean = sum / count as f64;
        let sq: f64 = heights
            .iter()
            .filter(|v| v.is_finite())
            .map(|&v| (v - mean) * (v - mean))
            .sum();

        Some(Self {
            mean,
            rms: (sq / count as f64).sqrt(),
            peak_to_valley: max - min,
            valid_pixels: count,
        })
    }
}

/// Pixelwise mean ignoring NaN samples.
///
/// A pixel is NaN in the result only if it is NaN in every map. All maps must
/// share the shape of the first one; callers check this beforehand.
pub fn nan_mean(maps: &[Array2<f64>]) -> Option<Array2<f64>> {
    let first = maps.first()?;
    let mut sum = Array2::<f64>::zeros(first.dim());
    let mut count = Array2::<u32>::zeros(first.dim());

    for map in maps {
        ndarray::Zip::from(&mut sum)
            .and(&mut count)
            .and(map)
            .for_each(|s, n, &v| {
                if v.is_finite() {
                    *s += v;
                    *n += 1;
                }
            });
    }

    Some(ndarray::Zip::from(&sum).and(&count).map_collect(|&s, &n| {
        if n == 0 {
            f64::NAN
        } else {
            s / n as f64
        }
    }))
}

/// Flip rows so the first row becomes the last.
pub fn flip_vertical(heights: ArrayView2<f64>) -> Array2<f64> {
    heights.slice(s![..;-1, ..]).to_owned()
}

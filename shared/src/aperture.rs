//! Aperture circle geometry for interferometer frames.
//!
//! Every frame reported by the interferometer carries the circle that bounds
//! the illuminated part of the mirror. A batch of frames is registered on the
//! componentwise mean of those circles.

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while building or averaging aperture circles.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApertureError {
    /// Radius was zero, negative, or not a finite number.
    #[error("invalid aperture radius {0}")]
    InvalidRadius(f64),

    /// Centre coordinates were not finite.
    #[error("invalid aperture centre ({0}, {1})")]
    InvalidCenter(f64, f64),

    /// Averaging requested over an empty batch.
    #[error("cannot average zero aperture circles")]
    EmptyBatch,

    /// The map holds no finite pixel to detect a footprint from.
    #[error("no valid pixels to detect an aperture from")]
    NoValidPixels,
}

/// Circle bounding the mirror aperture in pixel coordinates.
///
/// `center_x` runs along columns, `center_y` along rows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ApertureCircle {
    pub center_x: f64,
    pub center_y: f64,
    pub radius: f64,
}

impl ApertureCircle {
    /// Create a circle, rejecting non-positive or non-finite radii.
    pub fn new(center_x: f64, center_y: f64, radius: f64) -> Result<Self, ApertureError> {
        if !center_x.is_finite() || !center_y.is_finite() {
            return Err(ApertureError::InvalidCenter(center_x, center_y));
        }
        if !(radius.is_finite() && radius > 0.0) {
            return Err(ApertureError::InvalidRadius(radius));
        }
        Ok(Self {
            center_x,
            center_y,
            radius,
        })
    }

    /// Check the invariants of a circle built without [`new`](Self::new).
    pub fn validate(&self) -> Result<(), ApertureError> {
        Self::new(self.center_x, self.center_y, self.radius).map(|_| ())
    }

    /// Componentwise mean of a batch of circles.
    ///
    /// Fails fast on an empty batch or if any member is invalid.
    pub fn average(circles: &[ApertureCircle]) -> Result<Self, ApertureError> {
        if circles.is_empty() {
            return Err(ApertureError::EmptyBatch);
        }
        for circle in circles {
            circle.validate()?;
        }

        let n = circles.len() as f64;
        let (sx, sy, sr) = circles.iter().fold((0.0, 0.0, 0.0), |acc, c| {
            (acc.0 + c.center_x, acc.1 + c.center_y, acc.2 + c.radius)
        });
        Self::new(sx / n, sy / n, sr / n)
    }

    /// Distance of a pixel centre from the circle centre, in pixels.
    pub fn distance(&self, row: usize, col: usize) -> f64 {
        let dx = col as f64 - self.center_x;
        let dy = row as f64 - self.center_y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Normalised polar coordinates `(rho, theta)` of a pixel.
    ///
    /// `rho` is 1.0 on the circle edge.
    pub fn polar(&self, row: usize, col: usize) -> (f64, f64) {
        let dx = col as f64 - self.center_x;
        let dy = row as f64 - self.center_y;
        ((dx * dx + dy * dy).sqrt() / self.radius, dy.atan2(dx))
    }

    /// The same circle expressed in a grid flipped upside down.
    pub fn flipped_vertically(&self, rows: usize) -> Self {
        Self {
            center_x: self.center_x,
            center_y: (rows as f64 - 1.0) - self.center_y,
            radius: self.radius,
        }
    }

    /// Estimate the aperture from the footprint of finite pixels.
    ///
    /// The centre is the midpoint of the valid extent along each axis and the
    /// radius is half the mean of the two extents. A central obscuration does
    /// not bias the estimate because only the outer extent is used.
    pub fn detect(heights: ArrayView2<f64>) -> Result<Self, ApertureError> {
        let mut row_range: Option<(usize, usize)> = None;
        let mut col_range: Option<(usize, usize)> = None;

        for ((row, col), value) in heights.indexed_iter() {
            if !value.is_finite() {
                continue;
            }
            row_range = Some(match row_range {
                Some((lo, hi)) => (lo.min(row), hi.max(row)),
                None => (row, row),
            });
            col_range = Some(match col_range {
                Some((lo, hi)) => (lo.min(col), hi.max(col)),
                None => (col, col),
            });
        }

        let ((r0, r1), (c0, c1)) = match (row_range, col_range) {
            (Some(r), Some(c)) => (r, c),
            _ => return Err(ApertureError::NoValidPixels),
        };

        let extent_y = (r1 - r0 + 1) as f64;
        let extent_x = (c1 - c0 + 1) as f64;
        Self::new(
            (c0 + c1) as f64 / 2.0,
            (r0 + r1) as f64 / 2.0,
            (extent_x + extent_y) / 4.0,
        )
    }
}

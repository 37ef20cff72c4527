//! Geometric value types shared by the quantizers and the post-processor.
//!
//! The same shapes appear twice in the pipeline: as integer bin indices
//! parsed out of generated text, and as floating-point pixel positions after
//! dequantization. Neither type enforces `min <= max`; generated text may
//! violate it and the values are passed through unchanged.

use serde::{Deserialize, Serialize};

/// Axis-aligned box in `(xmin, ymin, xmax, ymax)` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BoundingBox<T> {
    pub xmin: T,
    pub ymin: T,
    pub xmax: T,
    pub ymax: T,
}

impl<T: Copy> BoundingBox<T> {
    #[must_use]
    pub const fn new(xmin: T, ymin: T, xmax: T, ymax: T) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }

    /// Builds a box from the first four values of `values`.
    ///
    /// Returns [`None`] when fewer than four values are supplied.
    #[must_use]
    pub fn from_slice(values: &[T]) -> Option<Self> {
        match values {
            [xmin, ymin, xmax, ymax, ..] => Some(Self::new(*xmin, *ymin, *xmax, *ymax)),
            _ => None,
        }
    }
}

/// A single point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Coordinates<T> {
    pub x: T,
    pub y: T,
}

impl<T: Copy> Coordinates<T> {
    #[must_use]
    pub const fn new(x: T, y: T) -> Self {
        Self { x, y }
    }
}

/// Width and height of the original image in pixels.
///
/// Results are expressed in this coordinate space, not the model's crop size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl From<(u32, u32)> for ImageSize {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

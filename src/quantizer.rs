//! Reversible mapping between pixel coordinates and the model's bin grid.
//!
//! Florence-2 emits positions as `<loc_N>` pseudo-tokens where `N` indexes a
//! fixed grid laid over the image. [`BoxQuantizer`] handles 4-tuples and
//! [`CoordinatesQuantizer`] handles points; both apply the grid
//! independently per axis and reconstruct positions at the bin centre, so a
//! round trip is only accurate to one bin width.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geometry::{BoundingBox, Coordinates, ImageSize};

/// Quantization strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantizerMode {
    /// `bin = floor(v / bin_size)`, reconstructed at `(bin + 0.5) * bin_size`.
    #[default]
    Floor,
}

/// Errors raised for grids or images that cannot be divided into bins.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum QuantizerError {
    #[error("bin counts must be positive, got {width}x{height}")]
    NonPositiveBins { width: u32, height: u32 },
    #[error("image size must be positive, got {width}x{height}")]
    NonPositiveSize { width: u32, height: u32 },
}

/// Bin counts along each axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BinGrid {
    width: u32,
    height: u32,
}

impl BinGrid {
    fn new((width, height): (u32, u32)) -> Result<Self, QuantizerError> {
        if width == 0 || height == 0 {
            return Err(QuantizerError::NonPositiveBins { width, height });
        }
        Ok(Self { width, height })
    }

    /// Pixel extent of one bin along each axis.
    #[expect(clippy::cast_precision_loss, reason = "image and bin sizes are far below 2^24")]
    fn bin_extent(self, size: ImageSize) -> Result<(f32, f32), QuantizerError> {
        if size.width == 0 || size.height == 0 {
            return Err(QuantizerError::NonPositiveSize {
                width: size.width,
                height: size.height,
            });
        }
        Ok((
            size.width as f32 / self.width as f32,
            size.height as f32 / self.height as f32,
        ))
    }
}

#[expect(clippy::cast_precision_loss, reason = "bin counts are far below 2^24")]
#[expect(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    reason = "value is floored and clamped into [0, bins - 1] first"
)]
fn quantize_axis(mode: QuantizerMode, value: f32, extent: f32, bins: u32) -> u32 {
    match mode {
        QuantizerMode::Floor => {
            let upper = (bins - 1) as f32;
            (value / extent).floor().clamp(0.0, upper) as u32
        }
    }
}

#[expect(clippy::cast_precision_loss, reason = "bin indices are far below 2^24")]
fn dequantize_axis(mode: QuantizerMode, bin: u32, extent: f32) -> f32 {
    match mode {
        QuantizerMode::Floor => (bin as f32 + 0.5) * extent,
    }
}

/// Quantizer for `(xmin, ymin, xmax, ymax)` boxes.
///
/// # Examples
///
/// ```
/// use florence2::geometry::{BoundingBox, ImageSize};
/// use florence2::quantizer::{BoxQuantizer, QuantizerMode};
///
/// let quantizer = BoxQuantizer::new(QuantizerMode::Floor, (1000, 1000)).unwrap();
/// let boxes = quantizer
///     .dequantize(&[BoundingBox::new(0, 0, 500, 500)], ImageSize::new(1000, 1000))
///     .unwrap();
/// assert_eq!(boxes[0], BoundingBox::new(0.5, 0.5, 500.5, 500.5));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxQuantizer {
    mode: QuantizerMode,
    bins: BinGrid,
}

impl BoxQuantizer {
    /// Creates a quantizer for a `(width_bins, height_bins)` grid.
    ///
    /// # Errors
    ///
    /// Returns [`QuantizerError::NonPositiveBins`] when either bin count is zero.
    pub fn new(mode: QuantizerMode, bins: (u32, u32)) -> Result<Self, QuantizerError> {
        Ok(Self {
            mode,
            bins: BinGrid::new(bins)?,
        })
    }

    /// Maps pixel boxes onto the bin grid.
    ///
    /// # Errors
    ///
    /// Returns [`QuantizerError::NonPositiveSize`] for an empty image.
    pub fn quantize(
        &self,
        boxes: &[BoundingBox<f32>],
        size: ImageSize,
    ) -> Result<Vec<BoundingBox<u32>>, QuantizerError> {
        let (extent_w, extent_h) = self.bins.bin_extent(size)?;
        let (bins_w, bins_h) = (self.bins.width, self.bins.height);
        Ok(boxes
            .iter()
            .map(|b| BoundingBox {
                xmin: quantize_axis(self.mode, b.xmin, extent_w, bins_w),
                ymin: quantize_axis(self.mode, b.ymin, extent_h, bins_h),
                xmax: quantize_axis(self.mode, b.xmax, extent_w, bins_w),
                ymax: quantize_axis(self.mode, b.ymax, extent_h, bins_h),
            })
            .collect())
    }

    /// Maps bin boxes back to pixel space at bin centres.
    ///
    /// # Errors
    ///
    /// Returns [`QuantizerError::NonPositiveSize`] for an empty image.
    pub fn dequantize(
        &self,
        boxes: &[BoundingBox<u32>],
        size: ImageSize,
    ) -> Result<Vec<BoundingBox<f32>>, QuantizerError> {
        let (extent_w, extent_h) = self.bins.bin_extent(size)?;
        Ok(boxes
            .iter()
            .map(|b| BoundingBox {
                xmin: dequantize_axis(self.mode, b.xmin, extent_w),
                ymin: dequantize_axis(self.mode, b.ymin, extent_h),
                xmax: dequantize_axis(self.mode, b.xmax, extent_w),
                ymax: dequantize_axis(self.mode, b.ymax, extent_h),
            })
            .collect())
    }
}

/// Quantizer for single `(x, y)` points, used by OCR quads and polygons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatesQuantizer {
    mode: QuantizerMode,
    bins: BinGrid,
}

impl CoordinatesQuantizer {
    /// Creates a quantizer for a `(width_bins, height_bins)` grid.
    ///
    /// # Errors
    ///
    /// Returns [`QuantizerError::NonPositiveBins`] when either bin count is zero.
    pub fn new(mode: QuantizerMode, bins: (u32, u32)) -> Result<Self, QuantizerError> {
        Ok(Self {
            mode,
            bins: BinGrid::new(bins)?,
        })
    }

    /// Maps pixel points onto the bin grid.
    ///
    /// # Errors
    ///
    /// Returns [`QuantizerError::NonPositiveSize`] for an empty image.
    pub fn quantize(
        &self,
        points: &[Coordinates<f32>],
        size: ImageSize,
    ) -> Result<Vec<Coordinates<u32>>, QuantizerError> {
        let (extent_w, extent_h) = self.bins.bin_extent(size)?;
        Ok(points
            .iter()
            .map(|p| Coordinates {
                x: quantize_axis(self.mode, p.x, extent_w, self.bins.width),
                y: quantize_axis(self.mode, p.y, extent_h, self.bins.height),
            })
            .collect())
    }

    /// Maps bin points back to pixel space at bin centres.
    ///
    /// # Errors
    ///
    /// Returns [`QuantizerError::NonPositiveSize`] for an empty image.
    pub fn dequantize(
        &self,
        points: &[Coordinates<u32>],
        size: ImageSize,
    ) -> Result<Vec<Coordinates<f32>>, QuantizerError> {
        let (extent_w, extent_h) = self.bins.bin_extent(size)?;
        Ok(points
            .iter()
            .map(|p| Coordinates {
                x: dequantize_axis(self.mode, p.x, extent_w),
                y: dequantize_axis(self.mode, p.y, extent_h),
            })
            .collect())
    }
}

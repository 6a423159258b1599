//! Image planes: typed 2D pixel buffers with their stack coordinates.
//!
//! A plane is either grayscale (`u8`, `u16`, `f32`), RGB, or a binary
//! label mask. Binary planes are always `u16` and carry the threshold
//! range that produced them. The RGB/binary exclusion is structural: a
//! binary plane can only be built from a `u16` buffer.

use image::{GrayImage, ImageBuffer, Luma, RgbImage};
use serde::{Deserialize, Serialize};

use crate::types::{Dimensions, PipelineError};

/// 16-bit grayscale buffer, the working format of most commands.
pub type Gray16Image = ImageBuffer<Luma<u16>, Vec<u16>>;

/// 32-bit float grayscale buffer.
pub type Gray32FImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Logical position of a plane inside a multi-dimensional stack.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct PlaneId {
    /// Image series.
    pub series: u32,
    /// Focal plane.
    pub z: u32,
    /// Time point.
    pub t: u32,
    /// Channel.
    pub c: u32,
}

impl PlaneId {
    /// Create a plane identifier.
    #[must_use]
    pub const fn new(series: u32, z: u32, t: u32, c: u32) -> Self {
        Self { series, z, t, c }
    }

    /// Same position, different channel.
    #[must_use]
    pub const fn with_channel(self, c: u32) -> Self {
        Self { c, ..self }
    }
}

impl std::fmt::Display for PlaneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}z{}t{}c{}", self.series, self.z, self.t, self.c)
    }
}

/// Element type of a pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PixelType {
    /// 8-bit unsigned.
    U8,
    /// 16-bit unsigned.
    U16,
    /// 32-bit float.
    F32,
}

/// The pixel storage of a plane.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelBuffer {
    /// 8-bit grayscale.
    Gray8(GrayImage),
    /// 16-bit grayscale (the working format of most commands).
    Gray16(Gray16Image),
    /// 32-bit float grayscale.
    Gray32F(Gray32FImage),
    /// 8-bit RGB.
    Rgb8(RgbImage),
}

impl PixelBuffer {
    /// Buffer dimensions.
    #[must_use]
    pub fn dimensions(&self) -> Dimensions {
        let (width, height) = match self {
            Self::Gray8(img) => img.dimensions(),
            Self::Gray16(img) => img.dimensions(),
            Self::Gray32F(img) => img.dimensions(),
            Self::Rgb8(img) => img.dimensions(),
        };
        Dimensions { width, height }
    }

    /// Element type of the buffer.
    #[must_use]
    pub const fn pixel_type(&self) -> PixelType {
        match self {
            Self::Gray8(_) | Self::Rgb8(_) => PixelType::U8,
            Self::Gray16(_) => PixelType::U16,
            Self::Gray32F(_) => PixelType::F32,
        }
    }

    /// Convert to 16-bit grayscale.
    ///
    /// 8-bit values are stretched by 257 so that 255 maps to 65535. Float
    /// values are rounded and clamped. RGB is reduced to luminance
    /// (Rec. 601 weights).
    #[must_use]
    pub fn to_gray16(&self) -> Gray16Image {
        match self {
            Self::Gray16(img) => img.clone(),
            Self::Gray8(img) => Gray16Image::from_fn(img.width(), img.height(), |x, y| {
                Luma([u16::from(img.get_pixel(x, y).0[0]) * 257])
            }),
            Self::Gray32F(img) => Gray16Image::from_fn(img.width(), img.height(), |x, y| {
                Luma([saturate_u16(f64::from(img.get_pixel(x, y).0[0]))])
            }),
            Self::Rgb8(img) => Gray16Image::from_fn(img.width(), img.height(), |x, y| {
                let [r, g, b] = img.get_pixel(x, y).0;
                let luma = 0.114f64.mul_add(
                    f64::from(b),
                    0.299f64.mul_add(f64::from(r), 0.587 * f64::from(g)),
                );
                Luma([saturate_u16(luma * 257.0)])
            }),
        }
    }
}

/// Round and clamp a float into the `u16` range. NaN maps to 0.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn saturate_u16(v: f64) -> u16 {
    if v.is_nan() {
        0
    } else {
        v.round().clamp(0.0, f64::from(u16::MAX)) as u16
    }
}

/// The threshold range that produced a binary plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedThreshold {
    /// Lower bound (inclusive) actually applied.
    pub min: u16,
    /// Upper bound (inclusive) actually applied.
    pub max: u16,
}

/// A single 2D plane plus its identity and interpretation flags.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePlane {
    buffer: PixelBuffer,
    id: PlaneId,
    binary: bool,
    applied_threshold: Option<AppliedThreshold>,
}

impl ImagePlane {
    /// Wrap a pixel buffer as a grayscale (or RGB) plane.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if either dimension is zero.
    pub fn new(buffer: PixelBuffer, id: PlaneId) -> Result<Self, PipelineError> {
        let dims = buffer.dimensions();
        if dims.width == 0 || dims.height == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "image plane {id} has empty dimensions {}x{}",
                dims.width, dims.height
            )));
        }
        Ok(Self {
            buffer,
            id,
            binary: false,
            applied_threshold: None,
        })
    }

    /// A 16-bit grayscale plane.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if either dimension is zero.
    pub fn gray16(image: Gray16Image, id: PlaneId) -> Result<Self, PipelineError> {
        Self::new(PixelBuffer::Gray16(image), id)
    }

    /// A binary label plane.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if either dimension is zero.
    pub fn binary(
        labels: Gray16Image,
        id: PlaneId,
        applied_threshold: Option<AppliedThreshold>,
    ) -> Result<Self, PipelineError> {
        let mut plane = Self::new(PixelBuffer::Gray16(labels), id)?;
        plane.binary = true;
        plane.applied_threshold = applied_threshold;
        Ok(plane)
    }

    /// A zero-valued 16-bit plane.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if either dimension is zero.
    pub fn blank(dims: Dimensions, id: PlaneId) -> Result<Self, PipelineError> {
        Self::gray16(Gray16Image::new(dims.width, dims.height), id)
    }

    /// Same identity and flags, new 16-bit buffer of the same kind.
    ///
    /// Binary planes stay binary and keep their applied threshold.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if either dimension is zero.
    pub fn derive_gray16(&self, image: Gray16Image) -> Result<Self, PipelineError> {
        if self.binary {
            Self::binary(image, self.id, self.applied_threshold)
        } else {
            Self::gray16(image, self.id)
        }
    }

    /// Pixel storage.
    #[must_use]
    pub const fn buffer(&self) -> &PixelBuffer {
        &self.buffer
    }

    /// Stack position.
    #[must_use]
    pub const fn id(&self) -> PlaneId {
        self.id
    }

    /// Plane dimensions.
    #[must_use]
    pub fn dimensions(&self) -> Dimensions {
        self.buffer.dimensions()
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.dimensions().width
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.dimensions().height
    }

    /// Returns `true` if pixels are RGB.
    #[must_use]
    pub const fn is_rgb(&self) -> bool {
        matches!(self.buffer, PixelBuffer::Rgb8(_))
    }

    /// Returns `true` if pixels are class labels.
    #[must_use]
    pub const fn is_binary(&self) -> bool {
        self.binary
    }

    /// The threshold that produced this plane (binary planes only).
    #[must_use]
    pub const fn applied_threshold(&self) -> Option<AppliedThreshold> {
        self.applied_threshold
    }

    /// The 16-bit buffer, if stored as such.
    #[must_use]
    pub const fn as_gray16(&self) -> Option<&Gray16Image> {
        match &self.buffer {
            PixelBuffer::Gray16(img) => Some(img),
            _ => None,
        }
    }

    /// 16-bit view of the plane (converted if necessary).
    #[must_use]
    pub fn to_gray16(&self) -> Gray16Image {
        self.buffer.to_gray16()
    }

    /// Pixel value as `u16` at `(x, y)`.
    ///
    /// Coordinates must be inside the plane.
    #[must_use]
    pub fn value_u16(&self, x: u32, y: u32) -> u16 {
        match &self.buffer {
            PixelBuffer::Gray16(img) => img.get_pixel(x, y).0[0],
            PixelBuffer::Gray8(img) => u16::from(img.get_pixel(x, y).0[0]) * 257,
            PixelBuffer::Gray32F(img) => saturate_u16(f64::from(img.get_pixel(x, y).0[0])),
            PixelBuffer::Rgb8(_) => self.buffer.to_gray16().get_pixel(x, y).0[0],
        }
    }

    /// Pixel value as `f64` at `(x, y)` in the buffer's native scale.
    ///
    /// Coordinates must be inside the plane.
    #[must_use]
    pub fn value_f64(&self, x: u32, y: u32) -> f64 {
        match &self.buffer {
            PixelBuffer::Gray16(img) => f64::from(img.get_pixel(x, y).0[0]),
            PixelBuffer::Gray8(img) => f64::from(img.get_pixel(x, y).0[0]),
            PixelBuffer::Gray32F(img) => f64::from(img.get_pixel(x, y).0[0]),
            PixelBuffer::Rgb8(_) => f64::from(self.value_u16(x, y)),
        }
    }

    /// Full 65 536-bin histogram of the 16-bit view.
    #[must_use]
    pub fn histogram16(&self) -> Vec<u64> {
        let mut hist = vec![0u64; usize::from(u16::MAX) + 1];
        for p in self.to_gray16().pixels() {
            hist[usize::from(p.0[0])] += 1;
        }
        hist
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn id() -> PlaneId {
        PlaneId::new(0, 0, 0, 1)
    }

    #[test]
    fn zero_sized_plane_rejected() {
        let err = ImagePlane::gray16(Gray16Image::new(0, 4), id()).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn gray8_stretches_to_full_range() {
        let img = GrayImage::from_pixel(2, 2, Luma([255]));
        let plane = ImagePlane::new(PixelBuffer::Gray8(img), id()).unwrap();
        assert_eq!(plane.value_u16(1, 1), u16::MAX);
        assert!(!plane.is_binary());
    }

    #[test]
    fn binary_keeps_threshold_through_derive() {
        let labels = Gray16Image::from_pixel(3, 3, Luma([2]));
        let threshold = AppliedThreshold { min: 100, max: 200 };
        let plane = ImagePlane::binary(labels, id(), Some(threshold)).unwrap();
        let derived = plane.derive_gray16(Gray16Image::new(3, 3)).unwrap();
        assert!(derived.is_binary());
        assert_eq!(derived.applied_threshold(), Some(threshold));
    }

    #[test]
    fn rgb_is_never_binary() {
        let plane = ImagePlane::new(PixelBuffer::Rgb8(RgbImage::new(2, 2)), id()).unwrap();
        assert!(plane.is_rgb());
        assert!(!plane.is_binary());
    }

    #[test]
    fn histogram_counts_every_pixel() {
        let mut img = Gray16Image::from_pixel(4, 4, Luma([10]));
        img.put_pixel(0, 0, Luma([40000]));
        let plane = ImagePlane::gray16(img, id()).unwrap();
        let hist = plane.histogram16();
        assert_eq!(hist[10], 15);
        assert_eq!(hist[40000], 1);
        assert_eq!(hist.iter().sum::<u64>(), 16);
    }

    #[test]
    fn saturate_clamps_and_handles_nan() {
        assert_eq!(saturate_u16(-5.0), 0);
        assert_eq!(saturate_u16(1e9), u16::MAX);
        assert_eq!(saturate_u16(f64::NAN), 0);
        assert_eq!(saturate_u16(41.6), 42);
    }
}

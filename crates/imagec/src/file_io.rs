//! [`ImageIo`] over ordinary image files.
//!
//! Each file holds one 2D plane. A path containing `{c}` names one file
//! per channel: `{c}` is replaced by 0, 1, 2, … until a file is missing.
//! Files are decoded once when the image is opened; tiles are cropped
//! from the decoded planes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::DynamicImage;
use imagec_pipeline::image_plane::PixelBuffer;
use imagec_pipeline::io::{ImageMetadata, PlaneCounts, crop_buffer};
use imagec_pipeline::{ImageIo, ImagePlane, PipelineError, PlaneId, TileInfo};

/// Placeholder for the channel index in a path.
pub const CHANNEL_PLACEHOLDER: &str = "{c}";

/// A decoded image: one buffer per channel.
#[derive(Debug)]
pub struct DecodedImage {
    metadata: ImageMetadata,
    channels: Vec<PixelBuffer>,
}

/// Reads PNG, TIFF, JPEG, and BMP files with the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileImageIo;

impl FileImageIo {
    /// Files making up the image at `path`, in channel order.
    #[must_use]
    pub fn channel_paths(path: &Path) -> Vec<PathBuf> {
        let template = path.to_string_lossy();
        if !template.contains(CHANNEL_PLACEHOLDER) {
            return vec![path.to_path_buf()];
        }
        (0u32..)
            .map(|c| PathBuf::from(template.replace(CHANNEL_PLACEHOLDER, &c.to_string())))
            .take_while(|p| p.exists())
            .collect()
    }
}

/// Keep the stored element type where the pipeline has a buffer for it.
fn to_buffer(image: DynamicImage) -> PixelBuffer {
    match image {
        DynamicImage::ImageLuma8(img) => PixelBuffer::Gray8(img),
        DynamicImage::ImageLuma16(img) => PixelBuffer::Gray16(img),
        DynamicImage::ImageRgb8(img) => PixelBuffer::Rgb8(img),
        DynamicImage::ImageLumaA8(_) => PixelBuffer::Gray8(image.to_luma8()),
        DynamicImage::ImageRgba8(_) => PixelBuffer::Rgb8(image.to_rgb8()),
        DynamicImage::ImageRgb32F(_) | DynamicImage::ImageRgba32F(_) => {
            PixelBuffer::Gray32F(image.to_luma32f())
        }
        other => PixelBuffer::Gray16(other.to_luma16()),
    }
}

fn external(path: &Path, err: impl std::fmt::Display) -> PipelineError {
    PipelineError::External(format!("{}: {err}", path.display()))
}

impl ImageIo for FileImageIo {
    type Handle = Arc<DecodedImage>;

    fn open_image(&self, path: &Path) -> Result<Self::Handle, PipelineError> {
        let paths = Self::channel_paths(path);
        if paths.is_empty() {
            return Err(external(path, "no channel files found"));
        }
        let channels = paths
            .iter()
            .map(|p| image::open(p).map(to_buffer).map_err(|e| external(p, e)))
            .collect::<Result<Vec<_>, _>>()?;

        let first = &channels[0];
        let dims = first.dimensions();
        if let Some((p, _)) = paths
            .iter()
            .zip(&channels)
            .find(|(_, c)| c.dimensions() != dims)
        {
            return Err(external(p, "channel size differs from channel 0"));
        }
        let metadata = ImageMetadata {
            width: dims.width,
            height: dims.height,
            n_series: 1,
            planes: PlaneCounts {
                z: 1,
                t: 1,
                c: u32::try_from(channels.len()).unwrap_or(u32::MAX),
            },
            pixel_type: first.pixel_type(),
            physical_pixel_size_unit: "px".to_owned(),
        };
        tracing::debug!(path = %path.display(), ?metadata, "image opened");
        Ok(Arc::new(DecodedImage { metadata, channels }))
    }

    fn metadata(&self, handle: &Self::Handle) -> Result<ImageMetadata, PipelineError> {
        Ok(handle.metadata.clone())
    }

    fn read_tile(
        &self,
        handle: &Self::Handle,
        plane: PlaneId,
        tile: &TileInfo,
    ) -> Result<ImagePlane, PipelineError> {
        let buffer = (plane.series == 0 && plane.z == 0 && plane.t == 0)
            .then(|| handle.channels.get(plane.c as usize))
            .flatten()
            .ok_or_else(|| PipelineError::External(format!("image has no plane {plane}")))?;
        ImagePlane::new(crop_buffer(buffer, tile.region), plane)
    }
}

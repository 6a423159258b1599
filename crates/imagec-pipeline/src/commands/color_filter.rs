//! Reduce an RGB plane to one grayscale channel.
//!
//! Optionally keeps only pixels whose hue lies in a window. After this
//! step the pipeline is grayscale: later source reads return luminance.

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactSet, InOut, OutputKind};
use crate::command::{BuildEnv, Command, StepSettings, settings_command};
use crate::context::ProcessContext;
use crate::image_plane::{Gray16Image, ImagePlane, PixelBuffer};
use crate::object_list::ObjectList;
use crate::types::PipelineError;

/// Which value becomes the gray level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColorChannel {
    /// Rec. 601 luminance.
    #[default]
    Luminance,
    /// Red component.
    Red,
    /// Green component.
    Green,
    /// Blue component.
    Blue,
}

/// Inclusive hue window in degrees; wraps when `min > max`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HueRange {
    /// Lower hue.
    pub min: f32,
    /// Upper hue.
    pub max: f32,
}

impl HueRange {
    fn contains(self, hue: f32) -> bool {
        if self.min <= self.max {
            (self.min..=self.max).contains(&hue)
        } else {
            hue >= self.min || hue <= self.max
        }
    }
}

/// Color-filter options.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ColorFilterSettings {
    /// Output channel.
    pub channel: ColorChannel,
    /// Pixels outside this hue window become 0.
    pub hue_range: Option<HueRange>,
}

impl StepSettings for ColorFilterSettings {
    fn in_out(&self) -> InOut {
        InOut::new(ArtifactSet::IMAGE, OutputKind::Image)
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(ColorFilter(self.clone())))
    }
}

settings_command!(ColorFilter, ColorFilterSettings, "colorFilter");

impl ColorFilter {
    fn run(
        &self,
        ctx: &mut ProcessContext<'_>,
        image: &mut ImagePlane,
        _objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        let gray = match image.buffer() {
            PixelBuffer::Rgb8(rgb) => self.reduce(rgb),
            _ => image.to_gray16(),
        };
        *image = ImagePlane::gray16(gray, image.id())?;
        ctx.set_grayscale();
        Ok(())
    }

    fn reduce(&self, rgb: &RgbImage) -> Gray16Image {
        Gray16Image::from_fn(rgb.width(), rgb.height(), |x, y| {
            let [r, g, b] = rgb.get_pixel(x, y).0;
            if let Some(range) = self.0.hue_range
                && !range.contains(hue(r, g, b))
            {
                return image::Luma([0]);
            }
            let value = match self.0.channel {
                ColorChannel::Luminance => luminance(r, g, b),
                ColorChannel::Red => r,
                ColorChannel::Green => g,
                ColorChannel::Blue => b,
            };
            image::Luma([u16::from(value) * 257])
        })
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn luminance(r: u8, g: u8, b: u8) -> u8 {
    let luma = 0.114f32.mul_add(
        f32::from(b),
        0.299f32.mul_add(f32::from(r), 0.587 * f32::from(g)),
    );
    luma.round().clamp(0.0, 255.0) as u8
}

/// Hue in degrees `[0, 360)`; 0 for grays.
fn hue(r: u8, g: u8, b: u8) -> f32 {
    let (r, g, b) = (f32::from(r), f32::from(g), f32::from(b));
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    if delta <= 0.0 {
        return 0.0;
    }
    let h = if (max - r).abs() < f32::EPSILON {
        ((g - b) / delta).rem_euclid(6.0)
    } else if (max - g).abs() < f32::EPSILON {
        (b - r) / delta + 2.0
    } else {
        (r - g) / delta + 4.0
    };
    h * 60.0
}

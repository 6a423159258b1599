//! Render a control image of the tile for visual inspection.
//!
//! The canvas (a plane scaled down to 8 bit, or a solid colour) gets the
//! objects of the selected classes painted on top, each class in its own
//! colour. The result goes to the publisher with the tile's other
//! results; the active artifacts are left unchanged.

use std::fmt;
use std::str::FromStr;

use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactSet, InOut};
use crate::class_id::ClassIdIn;
use crate::command::{BuildEnv, Command, StepSettings, settings_command};
use crate::commands::measure_intensity::ImageRef;
use crate::commands::objects_to_image::DrawStyle;
use crate::context::ProcessContext;
use crate::diagnostics::StepLog;
use crate::image_plane::ImagePlane;
use crate::object::Object;
use crate::object_list::ObjectList;
use crate::raster::{draw_outline, draw_rect};
use crate::sink::ControlImage;
use crate::types::PipelineError;

/// An sRGB colour written as `#rrggbb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color(pub [u8; 3]);

impl Color {
    /// Opaque yellow.
    pub const YELLOW: Self = Self([255, 255, 0]);
}

impl FromStr for Color {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PipelineError::InvalidConfig(format!("invalid colour {s:?}, expected #rrggbb"));
        let hex = s.strip_prefix('#').ok_or_else(invalid)?;
        if hex.len() != 6 || !hex.is_ascii() {
            return Err(invalid());
        }
        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| invalid());
        Ok(Self([channel(0)?, channel(2)?, channel(4)?]))
    }
}

impl TryFrom<String> for Color {
    type Error = PipelineError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Color> for String {
    fn from(c: Color) -> Self {
        c.to_string()
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [r, g, b] = self.0;
        write!(f, "#{r:02x}{g:02x}{b:02x}")
    }
}

/// Background of the control image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Canvas {
    /// The active plane.
    #[default]
    ActiveImage,
    /// The plane named by `planeIn`.
    ImagePlane,
    Black,
    White,
}

/// How one class is drawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SaveClass {
    /// Class to draw.
    pub class_in: ClassIdIn,
    /// Paint colour.
    pub color: Color,
    /// Outline or fill.
    pub style: DrawStyle,
    /// Also draw each bounding box.
    pub paint_bounding_box: bool,
}

impl Default for SaveClass {
    fn default() -> Self {
        Self {
            class_in: ClassIdIn::Default,
            color: Color::YELLOW,
            style: DrawStyle::Outlined,
            paint_bounding_box: false,
        }
    }
}

/// Save-image options.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageSaverSettings {
    /// Classes to draw, in painting order.
    pub classes_in: Vec<SaveClass>,
    /// Background.
    pub canvas: Canvas,
    /// Plane for [`Canvas::ImagePlane`].
    pub plane_in: Option<ImageRef>,
    /// Appended to the generated file name.
    pub name_prefix: String,
}

impl StepSettings for ImageSaverSettings {
    fn in_out(&self) -> InOut {
        InOut::pass_through(ArtifactSet::ANY)
    }

    fn check(&self, log: &mut StepLog<'_>) {
        if self.canvas == Canvas::ImagePlane && self.plane_in.is_none() {
            log.error("canvas IMAGE_PLANE needs planeIn");
        }
        if self.classes_in.is_empty() {
            log.info("no classes selected, only the canvas is saved");
        }
        log.require(
            !self.name_prefix.contains(['/', '\\']),
            "namePrefix must not contain path separators",
        );
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(ImageSaver(self.clone())))
    }
}

settings_command!(ImageSaver, ImageSaverSettings, "imageSaver");

impl ImageSaver {
    fn run(
        &self,
        ctx: &mut ProcessContext<'_>,
        image: &mut ImagePlane,
        objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        let s = &self.0;
        let (width, height) = (image.width(), image.height());
        let mut canvas = match s.canvas {
            Canvas::ActiveImage => to_rgb8(image),
            Canvas::ImagePlane => match s.plane_in {
                Some(plane_ref) => to_rgb8(&plane_ref.load(ctx)?.1),
                None => to_rgb8(image),
            },
            Canvas::Black => RgbImage::new(width, height),
            Canvas::White => RgbImage::from_pixel(width, height, Rgb([255, 255, 255])),
        };
        for class in &s.classes_in {
            for object in objects.class(ctx.resolve(class.class_in)) {
                draw_object(&mut canvas, object, class);
            }
        }

        let tile = ctx.tile();
        let plane = ctx.plane();
        let name = format!(
            "{}__{}x{}__{}-{}-{}{}.png",
            ctx.identity().image_id,
            tile.tile_x,
            tile.tile_y,
            image.id().c,
            plane.z,
            plane.t,
            s.name_prefix
        );
        tracing::debug!(%name, "control image rendered");
        ctx.push_control_image(ControlImage {
            name,
            image: canvas,
        });
        Ok(())
    }
}

/// 8-bit RGB rendering of a plane (16-bit values keep their high byte).
fn to_rgb8(plane: &ImagePlane) -> RgbImage {
    if let crate::image_plane::PixelBuffer::Rgb8(rgb) = plane.buffer() {
        return rgb.clone();
    }
    let gray = plane.to_gray16();
    RgbImage::from_fn(gray.width(), gray.height(), |x, y| {
        let v = gray.get_pixel(x, y).0[0].to_be_bytes()[0];
        Rgb([v, v, v])
    })
}

fn draw_object(canvas: &mut RgbImage, object: &Object, class: &SaveClass) {
    let color = Rgb(class.color.0);
    if class.style == DrawStyle::Filled {
        for (x, y) in object.pixels() {
            if x < canvas.width() && y < canvas.height() {
                canvas.put_pixel(x, y, color);
            }
        }
    }
    draw_outline(canvas, object.contour(), color);
    if class.paint_bounding_box {
        draw_rect(canvas, object.bbox(), color);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::class_id::ClassId;
    use crate::commands::tests::gray;
    use crate::context::tests::Harness;
    use crate::object::tests::square;
    use crate::types::Dimensions;

    fn save(settings: ImageSaverSettings) -> Vec<ControlImage> {
        let mut h = Harness::new(Dimensions::new(12, 12));
        let mut image = gray(12, 12, |_, _| 0x4000);
        let mut objects = ObjectList::new();
        objects.push(square(100, 2, 2, 2, 6));
        h.with_ctx(1, |ctx| {
            ImageSaver(settings)
                .execute(ctx, &mut image, &mut objects)
                .unwrap();
        });
        assert_eq!(image.value_u16(0, 0), 0x4000);
        h.state.control_images
    }

    #[test]
    fn colour_parsing() {
        assert_eq!("#ff8000".parse::<Color>().unwrap(), Color([255, 128, 0]));
        assert!("ff8000".parse::<Color>().is_err());
        assert!("#ff80".parse::<Color>().is_err());
        assert_eq!(Color([1, 2, 255]).to_string(), "#0102ff");
        let c: Color = serde_json::from_str(r##""#00ff00""##).unwrap();
        assert_eq!(c, Color([0, 255, 0]));
    }

    #[test]
    fn outlined_class_on_active_image() {
        let images = save(ImageSaverSettings {
            classes_in: vec![SaveClass {
                class_in: ClassIdIn::Class(ClassId::new(2)),
                color: Color([255, 0, 0]),
                ..SaveClass::default()
            }],
            name_prefix: "_ctrl".into(),
            ..ImageSaverSettings::default()
        });
        assert_eq!(images.len(), 1);
        let img = &images[0].image;
        assert_eq!(img.get_pixel(2, 2).0, [255, 0, 0]);
        assert_eq!(img.get_pixel(4, 4).0, [0x40, 0x40, 0x40]);
        assert!(images[0].name.ends_with("_ctrl.png"));
    }

    #[test]
    fn filled_on_white() {
        let images = save(ImageSaverSettings {
            classes_in: vec![SaveClass {
                class_in: ClassIdIn::Class(ClassId::new(2)),
                color: Color([0, 0, 255]),
                style: DrawStyle::Filled,
                paint_bounding_box: false,
            }],
            canvas: Canvas::White,
            ..ImageSaverSettings::default()
        });
        let img = &images[0].image;
        assert_eq!(img.get_pixel(4, 4).0, [0, 0, 255]);
        assert_eq!(img.get_pixel(0, 0).0, [255, 255, 255]);
    }

    #[test]
    fn image_plane_canvas_needs_a_plane() {
        let mut log = crate::diagnostics::CompileLog::new();
        ImageSaverSettings {
            canvas: Canvas::ImagePlane,
            ..ImageSaverSettings::default()
        }
        .check(&mut log.step("p", 0));
        assert!(log.has_errors());
    }
}

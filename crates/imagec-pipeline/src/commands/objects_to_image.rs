//! Paint objects into a grayscale plane.

use image::Luma;
use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactSet, InOut, OutputKind};
use crate::class_id::ClassIdIn;
use crate::command::{BuildEnv, Command, StepSettings, settings_command};
use crate::context::ProcessContext;
use crate::diagnostics::StepLog;
use crate::image_plane::{Gray16Image, ImagePlane};
use crate::object::Object;
use crate::object_list::ObjectList;
use crate::raster::{draw_outline, draw_rect};
use crate::types::PipelineError;

/// How an object is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DrawStyle {
    /// Contour only.
    Outlined,
    /// Every mask pixel.
    #[default]
    Filled,
}

/// What the objects are painted onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Background {
    /// A zero plane.
    #[default]
    Black,
    /// The active plane.
    ActiveImage,
}

/// Objects-to-image options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectsToImageSettings {
    /// Classes to paint, in order; later classes paint over earlier ones.
    pub classes_in: Vec<ClassIdIn>,
    /// Outline or fill.
    pub style: DrawStyle,
    /// Also draw each bounding box.
    pub draw_bounding_box: bool,
    /// Paint each object with its identifier instead of `intensity`.
    pub paint_object_id: bool,
    /// Paint value.
    pub intensity: u16,
    /// Canvas.
    pub background: Background,
}

impl Default for ObjectsToImageSettings {
    fn default() -> Self {
        Self {
            classes_in: vec![ClassIdIn::Default],
            style: DrawStyle::Filled,
            draw_bounding_box: false,
            paint_object_id: false,
            intensity: u16::MAX,
            background: Background::Black,
        }
    }
}

impl StepSettings for ObjectsToImageSettings {
    fn in_out(&self) -> InOut {
        InOut::new(ArtifactSet::OBJECT, OutputKind::Image)
    }

    fn check(&self, log: &mut StepLog<'_>) {
        log.require(!self.classes_in.is_empty(), "at least one input class is required");
        if !self.paint_object_id && self.intensity == 0 {
            log.warning("intensity 0 paints nothing on a black canvas");
        }
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(ObjectsToImage(self.clone())))
    }
}

settings_command!(ObjectsToImage, ObjectsToImageSettings, "objectsToImage");

impl ObjectsToImage {
    fn run(
        &self,
        ctx: &mut ProcessContext<'_>,
        image: &mut ImagePlane,
        objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        let s = &self.0;
        let mut canvas = match s.background {
            Background::Black => Gray16Image::new(image.width(), image.height()),
            Background::ActiveImage => image.to_gray16(),
        };
        for class in &s.classes_in {
            for object in objects.class(ctx.resolve(*class)) {
                self.paint(&mut canvas, object);
            }
        }
        *image = ImagePlane::gray16(canvas, image.id())?;
        Ok(())
    }

    fn paint(&self, canvas: &mut Gray16Image, object: &Object) {
        let value = if self.0.paint_object_id {
            id_value(object)
        } else {
            self.0.intensity
        };
        match self.0.style {
            DrawStyle::Filled => {
                for (x, y) in object.pixels() {
                    if x < canvas.width() && y < canvas.height() {
                        canvas.put_pixel(x, y, Luma([value]));
                    }
                }
            }
            DrawStyle::Outlined => draw_outline(canvas, object.contour(), Luma([value])),
        }
        if self.0.draw_bounding_box {
            draw_rect(canvas, object.bbox(), Luma([value]));
        }
    }
}

/// Object identifier folded into `1..=65535`.
#[allow(clippy::cast_possible_truncation)]
fn id_value(object: &Object) -> u16 {
    (object.id().get().wrapping_sub(1) % u64::from(u16::MAX)) as u16 + 1
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::class_id::ClassId;
    use crate::commands::tests::{gray, run};
    use crate::object::tests::square;

    fn paint(settings: ObjectsToImageSettings) -> ImagePlane {
        let mut objects = ObjectList::new();
        objects.push(square(100, 1, 2, 2, 5));
        let mut image = gray(10, 10, |_, _| 7);
        run(&ObjectsToImage(settings), &mut image, &mut objects).unwrap();
        image
    }

    fn painted(image: &ImagePlane, value: u16) -> usize {
        image.to_gray16().pixels().filter(|p| p.0[0] == value).count()
    }

    #[test]
    fn filled_on_black() {
        let image = paint(ObjectsToImageSettings {
            classes_in: vec![ClassIdIn::Class(ClassId::new(1))],
            ..ObjectsToImageSettings::default()
        });
        assert!(!image.is_binary());
        assert_eq!(painted(&image, u16::MAX), 25);
        assert_eq!(painted(&image, 0), 75);
    }

    #[test]
    fn outline_over_active_image() {
        let image = paint(ObjectsToImageSettings {
            style: DrawStyle::Outlined,
            background: Background::ActiveImage,
            intensity: 500,
            ..ObjectsToImageSettings::default()
        });
        assert_eq!(image.value_u16(2, 2), 500);
        assert_eq!(image.value_u16(4, 4), 7);
        assert_eq!(image.value_u16(0, 0), 7);
    }

    #[test]
    fn object_id_paint_value() {
        let image = paint(ObjectsToImageSettings {
            paint_object_id: true,
            draw_bounding_box: true,
            ..ObjectsToImageSettings::default()
        });
        assert_eq!(image.value_u16(3, 3), 100);
    }
}

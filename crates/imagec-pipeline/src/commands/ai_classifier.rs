//! Objects from an external segmentation or detection model.
//!
//! The model is loaded once when the command is built and shared by
//! every tile. Per-pixel outputs are objectified per model class; box
//! outputs become one object per detection, shaped by its instance mask
//! when the model provides one.

use std::path::PathBuf;
use std::sync::Arc;

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactSet, InOut, OutputKind};
use crate::class_id::ClassIdIn;
use crate::command::{BuildEnv, Command, StepSettings};
use crate::commands::{ObjectFilter, objectify};
use crate::context::ProcessContext;
use crate::diagnostics::StepLog;
use crate::image_plane::ImagePlane;
use crate::io::{AiModel, BoxPrediction, Inference, InferenceParams, ModelArchitecture, ModelFormat};
use crate::object::{Object, ObjectId};
use crate::object_list::ObjectList;
use crate::raster::{FOREGROUND, label_mask};
use crate::types::{Dimensions, PipelineError};

/// Maps one model class to a pipeline class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AiClassEntry {
    /// Class index as emitted by the model.
    pub model_class: u32,
    /// Class of the produced objects.
    pub class_out: ClassIdIn,
    /// Size and shape gate.
    #[serde(flatten)]
    pub filter: ObjectFilter,
}

impl Default for AiClassEntry {
    fn default() -> Self {
        Self {
            model_class: 0,
            class_out: ClassIdIn::Default,
            filter: ObjectFilter::default(),
        }
    }
}

/// AI classifier options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AiClassifierSettings {
    /// Model file, resolved by the model loader.
    pub model_path: PathBuf,
    /// Serialisation format of the model.
    pub model_format: ModelFormat,
    /// Network architecture.
    pub model_architecture: ModelArchitecture,
    /// Thresholds and input shape.
    pub params: InferenceParams,
    /// Which model classes to keep, and as what.
    pub classes: Vec<AiClassEntry>,
}

impl Default for AiClassifierSettings {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            model_format: ModelFormat::Onnx,
            model_architecture: ModelArchitecture::YoloV5,
            params: InferenceParams::default(),
            classes: vec![AiClassEntry::default()],
        }
    }
}

impl StepSettings for AiClassifierSettings {
    fn in_out(&self) -> InOut {
        InOut::new(ArtifactSet::PIXELS, OutputKind::Object)
    }

    fn check(&self, log: &mut StepLog<'_>) {
        log.require(
            !self.model_path.as_os_str().is_empty(),
            "modelPath must be set",
        );
        log.require(
            (0.0..=1.0).contains(&self.params.class_threshold)
                && (0.0..=1.0).contains(&self.params.mask_threshold),
            "probability thresholds must be in [0, 1]",
        );
        log.require(!self.classes.is_empty(), "at least one model class is required");
        for entry in &self.classes {
            entry.filter.check(log);
        }
    }

    fn build(&self, env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        let loader = env.models.ok_or_else(|| {
            PipelineError::InvalidConfig("AI classifier needs a model loader".to_owned())
        })?;
        let model = loader.load_model(&self.model_path, self.model_format, self.model_architecture)?;
        tracing::info!(
            path = %self.model_path.display(),
            format = %self.model_format,
            architecture = %self.model_architecture,
            "model loaded"
        );
        Ok(Box::new(AiClassifier {
            settings: self.clone(),
            model,
        }))
    }
}

/// Runtime form of [`AiClassifierSettings`], holding the loaded model.
#[derive(Debug, Clone)]
pub struct AiClassifier {
    settings: AiClassifierSettings,
    model: Arc<dyn AiModel>,
}

impl Command for AiClassifier {
    fn name(&self) -> &'static str {
        "aiClassifier"
    }

    fn in_out(&self) -> InOut {
        self.settings.in_out()
    }

    fn execute(
        &self,
        ctx: &mut ProcessContext<'_>,
        image: &mut ImagePlane,
        objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        let inference = self.model.infer(image, &self.settings.params)?;
        let dims = image.dimensions();
        let mut found = Vec::new();
        for entry in &self.settings.classes {
            let class_out = ctx.resolve(entry.class_out);
            match &inference {
                Inference::Labels(labels) => {
                    let Ok(model_class) = u16::try_from(entry.model_class) else {
                        continue;
                    };
                    if model_class == 0 {
                        continue;
                    }
                    let mask = label_mask(labels, model_class);
                    found.extend(objectify(ctx, &mask, class_out, image.id(), &entry.filter, 1.0));
                }
                Inference::Boxes(boxes) => {
                    for prediction in boxes.iter().filter(|p| {
                        p.class_index == entry.model_class
                            && p.confidence >= self.settings.params.class_threshold
                    }) {
                        let Some(mut object) = Object::from_tile_mask(
                            ObjectId::new(0),
                            class_out,
                            image.id(),
                            &box_mask(prediction, dims),
                            prediction.confidence,
                        ) else {
                            continue;
                        };
                        if entry.filter.accepts(&object) {
                            object.set_id(ctx.next_id());
                            found.push(object);
                        }
                    }
                }
            }
        }
        tracing::debug!(count = found.len(), "ai objects");
        objects.extend(found);
        Ok(())
    }
}

/// Tile-sized mask of one detection, clipped to the tile.
fn box_mask(prediction: &BoxPrediction, dims: Dimensions) -> GrayImage {
    let b = prediction.bbox;
    let mut mask = GrayImage::new(dims.width, dims.height);
    for y in b.y..b.bottom().min(dims.height) {
        for x in b.x..b.right().min(dims.width) {
            let inside = prediction.mask.as_ref().is_none_or(|m| {
                m.get_pixel_checked(x - b.x, y - b.y).is_some_and(|p| p.0[0] != 0)
            });
            if inside {
                mask.put_pixel(x, y, FOREGROUND);
            }
        }
    }
    mask
}

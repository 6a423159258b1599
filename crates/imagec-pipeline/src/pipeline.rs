//! Pipelines: an ordered list of steps plus where their first image
//! comes from.

use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactKind;
use crate::cache::{MemoryIdx, MemoryKey};
use crate::class_id::ClassId;
use crate::diagnostics::CompileLog;
use crate::image_plane::PlaneId;
use crate::step::PipelineStep;

/// Where a pipeline's active image comes from when it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PipelineSource {
    /// The tile of one channel of the image file.
    FromFile {
        /// Channel index.
        channel: u32,
    },
    /// A zero-valued 16-bit plane of the tile size.
    Blank,
    /// A plane parked by an earlier pipeline of the same group.
    FromMemory(MemoryIdx),
}

impl Default for PipelineSource {
    fn default() -> Self {
        Self::FromFile { channel: 0 }
    }
}

impl PipelineSource {
    /// Cache key the source is read from, for an iteration on `plane`.
    #[must_use]
    pub const fn memory_key(self, plane: PlaneId) -> MemoryKey {
        match self {
            Self::FromFile { channel } => MemoryKey::Source(plane.with_channel(channel)),
            Self::Blank => MemoryKey::Blank,
            Self::FromMemory(idx) => MemoryKey::Slot(idx),
        }
    }
}

const fn default_source_kind() -> ArtifactKind {
    ArtifactKind::Image
}

/// An ordered sequence of steps with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    /// Unique name within an analysis.
    pub name: String,
    /// Class that `"$"` resolves to.
    pub default_class: ClassId,
    /// Initial active image.
    #[serde(default)]
    pub source: PipelineSource,
    /// Artifact kind of the source, as seen by the first step.
    #[serde(default = "default_source_kind")]
    pub source_kind: ArtifactKind,
    /// Steps in execution order.
    #[serde(default)]
    pub steps: Vec<PipelineStep>,
}

impl Pipeline {
    /// An empty pipeline reading channel 0 of the image file.
    #[must_use]
    pub fn new(name: impl Into<String>, default_class: ClassId) -> Self {
        Self {
            name: name.into(),
            default_class,
            source: PipelineSource::default(),
            source_kind: ArtifactKind::Image,
            steps: Vec::new(),
        }
    }

    /// The same pipeline with another source.
    #[must_use]
    pub const fn with_source(mut self, source: PipelineSource, kind: ArtifactKind) -> Self {
        self.source = source;
        self.source_kind = kind;
        self
    }

    /// The same pipeline with `step` appended.
    #[must_use]
    pub fn step(mut self, step: impl Into<PipelineStep>) -> Self {
        self.steps.push(step.into());
        self
    }

    /// Enabled steps with their positions.
    pub fn enabled_steps(&self) -> impl Iterator<Item = (usize, &PipelineStep)> {
        self.steps.iter().enumerate().filter(|(_, s)| !s.disabled)
    }

    /// Position of the first enabled breakpoint, where execution halts.
    #[must_use]
    pub fn break_point(&self) -> Option<usize> {
        self.enabled_steps()
            .find(|(_, s)| s.break_point)
            .map(|(i, _)| i)
    }

    /// Run every enabled step's `check()` and the pipeline-level checks.
    pub fn check(&self, log: &mut CompileLog) {
        let mut own = log.pipeline(&self.name);
        own.require(!self.name.is_empty(), "pipeline name must not be empty");
        own.require(
            self.default_class.is_user(),
            format!("default class {} cannot hold published objects", self.default_class),
        );
        if let PipelineSource::FromMemory(idx) = self.source {
            own.require(
                !idx.is_temp(),
                format!("source {idx} is cleared before any pipeline can read it"),
            );
        }
        if self.steps.is_empty() {
            own.info("pipeline has no steps");
        }
        let break_points = self.enabled_steps().filter(|(_, s)| s.break_point).count();
        if break_points > 1 {
            own.warning(format!(
                "{break_points} breakpoints set, execution halts at the first"
            ));
        }
        for (index, step) in self.enabled_steps() {
            step.command.check(&mut log.step(&self.name, index));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::commands::blur::BlurSettings;
    use crate::commands::classifier::ClassifierSettings;
    use crate::step::CommandSettings;

    fn blur(kernel_size: u32) -> CommandSettings {
        CommandSettings::Blur(BlurSettings {
            kernel_size,
            ..BlurSettings::default()
        })
    }

    #[test]
    fn deserializes_with_defaults() {
        let p: Pipeline = serde_json::from_str(
            r#"{"name": "nuclei", "defaultClass": 1, "steps": [{"blur": {}}]}"#,
        )
        .unwrap();
        assert_eq!(p.source, PipelineSource::FromFile { channel: 0 });
        assert_eq!(p.source_kind, ArtifactKind::Image);
        assert_eq!(p.steps.len(), 1);

        let p: Pipeline = serde_json::from_str(
            r#"{"name": "b", "defaultClass": 2, "source": {"fromMemory": "M03"}}"#,
        )
        .unwrap();
        assert_eq!(p.source, PipelineSource::FromMemory(MemoryIdx::M03));
        let p: Pipeline =
            serde_json::from_str(r#"{"name": "c", "defaultClass": 2, "source": "blank"}"#).unwrap();
        assert_eq!(p.source, PipelineSource::Blank);
    }

    #[test]
    fn first_enabled_break_point_wins() {
        let p = Pipeline::new("p", ClassId::new(1))
            .step(PipelineStep::new(blur(3)).with_break_point().disabled())
            .step(blur(3))
            .step(PipelineStep::new(blur(5)).with_break_point())
            .step(PipelineStep::new(blur(7)).with_break_point());
        assert_eq!(p.break_point(), Some(2));
        let mut log = CompileLog::new();
        p.check(&mut log);
        assert!(!log.has_errors());
        assert_eq!(log.count(crate::diagnostics::Severity::Warning), 1);
    }

    #[test]
    fn disabled_steps_are_not_checked() {
        let p = Pipeline::new("p", ClassId::new(1))
            .step(PipelineStep::new(blur(4)).disabled())
            .step(CommandSettings::Classifier(ClassifierSettings::default()));
        let mut log = CompileLog::new();
        p.check(&mut log);
        assert!(!log.has_errors(), "{}", log.report());

        let p = p.step(blur(4));
        let mut log = CompileLog::new();
        p.check(&mut log);
        assert_eq!(log.error_count(), 1);
        assert_eq!(log.entries().last().unwrap().step, Some(2));
    }

    #[test]
    fn pipeline_level_errors() {
        let mut log = CompileLog::new();
        Pipeline::new("", ClassId::NONE)
            .with_source(PipelineSource::FromMemory(MemoryIdx::Temp01), ArtifactKind::Image)
            .check(&mut log);
        assert_eq!(log.error_count(), 3);
    }

    #[test]
    fn source_keys() {
        let plane = PlaneId::new(0, 2, 1, 0);
        assert_eq!(
            PipelineSource::FromFile { channel: 3 }.memory_key(plane),
            MemoryKey::Source(PlaneId::new(0, 2, 1, 3))
        );
        assert_eq!(PipelineSource::Blank.memory_key(plane), MemoryKey::Blank);
    }
}

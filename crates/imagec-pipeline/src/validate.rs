//! Configuration-time validation.
//!
//! [`label_edges`] walks a pipeline and labels every enabled step with
//! the artifact kind reaching it and whether the step accepts that kind.
//! A step whose output is `OUTPUT_EQUAL_TO_INPUT` forwards the kind it
//! received; the walk starts from the pipeline's source kind. Disabled
//! steps are transparent. The walk is pure and gives the same labels on
//! every call.
//!
//! [`check_pipelines`] runs that walk for every pipeline together with
//! each step's own `check()` and collects everything into one
//! [`CompileLog`].

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactKind, ArtifactSet};
use crate::diagnostics::CompileLog;
use crate::pipeline::Pipeline;
use crate::types::PipelineError;

/// Verdict on the edge into one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "verdict")]
pub enum EdgeLabel {
    /// The step accepts the incoming kind.
    Valid,
    /// The step does not accept the incoming kind.
    Mismatch {
        /// The step's accepted input kinds.
        #[serde(with = "artifact_set_names")]
        expected: ArtifactSet,
    },
}

/// The edge into one enabled step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Zero-based index of the receiving step.
    pub step: usize,
    /// Effective output kind of everything before the step.
    pub incoming: ArtifactKind,
    /// Kind the step hands on.
    pub outgoing: ArtifactKind,
    /// Verdict.
    pub label: EdgeLabel,
}

impl Edge {
    /// Returns `true` for a mismatched edge.
    #[must_use]
    pub const fn is_mismatch(&self) -> bool {
        matches!(self.label, EdgeLabel::Mismatch { .. })
    }
}

/// Label the edge into every enabled step of `pipeline`.
#[must_use]
pub fn label_edges(pipeline: &Pipeline) -> Vec<Edge> {
    let mut kind = pipeline.source_kind;
    pipeline
        .enabled_steps()
        .map(|(step, s)| {
            let io = s.command.in_out();
            let label = if io.input.contains(kind) {
                EdgeLabel::Valid
            } else {
                EdgeLabel::Mismatch { expected: io.input }
            };
            let incoming = kind;
            kind = io.output.resolve(kind);
            Edge {
                step,
                incoming,
                outgoing: kind,
                label,
            }
        })
        .collect()
}

/// The first type mismatch of `pipeline`, as an error.
///
/// # Errors
///
/// Returns [`PipelineError::TypeMismatch`] naming the first incompatible
/// edge.
pub fn type_check(pipeline: &Pipeline) -> Result<(), PipelineError> {
    label_edges(pipeline)
        .into_iter()
        .find_map(|edge| match edge.label {
            EdgeLabel::Mismatch { expected } => Some(PipelineError::TypeMismatch {
                pipeline: pipeline.name.clone(),
                step: edge.step,
                expected,
                got: edge.incoming,
            }),
            EdgeLabel::Valid => None,
        })
        .map_or(Ok(()), Err)
}

/// Check every pipeline and collect the findings.
///
/// Each mismatched edge becomes an error entry; so do duplicate pipeline
/// names and whatever the steps' own checks report.
#[tracing::instrument(skip_all, fields(pipelines = pipelines.len()))]
#[must_use]
pub fn check_pipelines(pipelines: &[Pipeline]) -> CompileLog {
    let mut log = CompileLog::new();
    let mut names = HashSet::new();
    for pipeline in pipelines {
        if !names.insert(pipeline.name.as_str()) {
            log.pipeline(&pipeline.name)
                .error("another pipeline has the same name");
        }
        pipeline.check(&mut log);
        for edge in label_edges(pipeline) {
            if let EdgeLabel::Mismatch { expected } = edge.label {
                let command = pipeline.steps[edge.step].command.name();
                log.step(&pipeline.name, edge.step).error(format!(
                    "{command} expects {expected}, got {}",
                    edge.incoming
                ));
            }
        }
    }
    tracing::debug!(
        errors = log.error_count(),
        entries = log.entries().len(),
        "pipelines checked"
    );
    log
}

/// Serde support for [`ArtifactSet`] as a list of kind names.
mod artifact_set_names {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::artifact::{ArtifactKind, ArtifactSet};

    pub fn serialize<S: Serializer>(set: &ArtifactSet, serializer: S) -> Result<S::Ok, S::Error> {
        set.kinds().collect::<Vec<_>>().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ArtifactSet, D::Error> {
        let kinds = Vec::<ArtifactKind>::deserialize(deserializer)?;
        let mut kinds = kinds.into_iter().map(ArtifactSet::from);
        let first = kinds
            .next()
            .ok_or_else(|| serde::de::Error::custom("an artifact set must not be empty"))?;
        Ok(kinds.fold(first, ArtifactSet::union))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::class_id::ClassId;
    use crate::commands::blur::BlurSettings;
    use crate::commands::classifier::ClassifierSettings;
    use crate::commands::measure_intensity::MeasureIntensitySettings;
    use crate::commands::reclassify::ReclassifySettings;
    use crate::commands::threshold::ThresholdSettings;
    use crate::step::{CommandSettings, PipelineStep};

    fn blur() -> CommandSettings {
        CommandSettings::Blur(BlurSettings::default())
    }

    fn reclassify() -> CommandSettings {
        CommandSettings::Reclassify(ReclassifySettings::default())
    }

    fn counting() -> Pipeline {
        Pipeline::new("count", ClassId::new(1))
            .step(blur())
            .step(CommandSettings::Threshold(ThresholdSettings::default()))
            .step(CommandSettings::Classifier(ClassifierSettings::default()))
            .step(CommandSettings::MeasureIntensity(MeasureIntensitySettings::default()))
    }

    // --- edge labelling tests ---

    #[test]
    fn valid_chain_resolves_pass_through() {
        let edges = label_edges(&counting());
        assert!(edges.iter().all(|e| !e.is_mismatch()));
        let kinds: Vec<_> = edges.iter().map(|e| e.outgoing).collect();
        assert_eq!(
            kinds,
            [
                ArtifactKind::Image,
                ArtifactKind::Binary,
                ArtifactKind::Object,
                ArtifactKind::Object
            ]
        );
        assert!(type_check(&counting()).is_ok());
    }

    #[test]
    fn blur_then_reclassify_is_a_mismatch_on_step_one() {
        let p = Pipeline::new("p", ClassId::new(1)).step(blur()).step(reclassify());
        let err = type_check(&p).unwrap_err();
        assert!(
            matches!(
                err,
                PipelineError::TypeMismatch {
                    step: 1,
                    expected: ArtifactSet::OBJECT,
                    got: ArtifactKind::Image,
                    ..
                }
            ),
            "{err}"
        );
    }

    #[test]
    fn only_the_offending_edge_is_flagged() {
        let p = counting().step(blur());
        let edges = label_edges(&p);
        let flagged: Vec<_> = edges.iter().filter(|e| e.is_mismatch()).map(|e| e.step).collect();
        assert_eq!(flagged, [4]);
    }

    #[test]
    fn disabled_steps_are_transparent() {
        let p = Pipeline::new("p", ClassId::new(1))
            .step(PipelineStep::new(reclassify()).disabled())
            .step(blur());
        let edges = label_edges(&p);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].step, 1);
        assert!(!edges[0].is_mismatch());
    }

    #[test]
    fn labelling_is_idempotent() {
        let p = counting().step(reclassify()).step(blur());
        assert_eq!(label_edges(&p), label_edges(&p));
    }

    // --- compile log tests ---

    #[test]
    fn mismatches_and_duplicates_are_errors() {
        let bad = Pipeline::new("p", ClassId::new(1)).step(blur()).step(reclassify());
        let log = check_pipelines(&[bad, counting(), counting()]);
        assert_eq!(log.error_count(), 2, "{}", log.report());
        assert!(log.entries().iter().any(|e| e.step == Some(1) && e.message.contains("OBJECT")));
    }

    #[test]
    fn edge_serializes_expected_kinds() {
        let edge = Edge {
            step: 1,
            incoming: ArtifactKind::Image,
            outgoing: ArtifactKind::Image,
            label: EdgeLabel::Mismatch {
                expected: ArtifactSet::PIXELS,
            },
        };
        let json = serde_json::to_value(edge).unwrap();
        assert_eq!(json["label"]["expected"], serde_json::json!(["IMAGE", "BINARY"]));
        let back: Edge = serde_json::from_value(json).unwrap();
        assert_eq!(back, edge);
    }
}

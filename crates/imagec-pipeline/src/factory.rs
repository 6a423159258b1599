//! Turns declarative pipelines into runnable commands.
//!
//! Compilation happens once per run: every pipeline is checked, and only
//! if the combined compile log holds no error are the commands built.
//! Disabled steps are dropped here, so the executor never sees them, but
//! the surviving steps keep their original positions for reporting.

use crate::artifact::{ArtifactKind, InOut};
use crate::class_id::ClassId;
use crate::command::{BuildEnv, Command};
use crate::diagnostics::CompileLog;
use crate::pipeline::{Pipeline, PipelineSource};
use crate::step::PipelineStep;
use crate::types::PipelineError;
use crate::validate::check_pipelines;

/// A built step.
#[derive(Debug)]
pub struct CompiledStep {
    /// Position in the declared pipeline.
    pub index: usize,
    /// The runnable command.
    pub command: Box<dyn Command>,
    /// Halt the tile after this step.
    pub break_point: bool,
}

impl CompiledStep {
    /// Declared capabilities of the command.
    #[must_use]
    pub fn in_out(&self) -> InOut {
        self.command.in_out()
    }
}

/// A pipeline with its enabled steps built.
#[derive(Debug)]
pub struct CompiledPipeline {
    /// Pipeline name.
    pub name: String,
    /// Class that `"$"` resolves to.
    pub default_class: ClassId,
    /// Initial active image.
    pub source: PipelineSource,
    /// Artifact kind of the source.
    pub source_kind: ArtifactKind,
    /// Enabled steps in order.
    pub steps: Vec<CompiledStep>,
}

/// Build the command for one step.
///
/// # Errors
///
/// Returns [`PipelineError`] if the command needs a collaborator that is
/// missing or fails, e.g. an AI model that cannot be loaded.
pub fn build_step(
    index: usize,
    step: &PipelineStep,
    env: &BuildEnv<'_>,
) -> Result<CompiledStep, PipelineError> {
    Ok(CompiledStep {
        index,
        command: step.command.build(env)?,
        break_point: step.break_point,
    })
}

/// Build every enabled step of `pipeline`.
///
/// Does not check the pipeline; see [`compile`].
///
/// # Errors
///
/// Returns the first error raised by [`build_step`].
pub fn build_pipeline(
    pipeline: &Pipeline,
    env: &BuildEnv<'_>,
) -> Result<CompiledPipeline, PipelineError> {
    let steps = pipeline
        .enabled_steps()
        .map(|(index, step)| build_step(index, step, env))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CompiledPipeline {
        name: pipeline.name.clone(),
        default_class: pipeline.default_class,
        source: pipeline.source,
        source_kind: pipeline.source_kind,
        steps,
    })
}

/// Check and build a set of pipelines.
///
/// Returns the built pipelines together with the compile log, which then
/// holds warnings and notes only.
///
/// # Errors
///
/// Returns [`PipelineError::ConfigRejected`] if the compile log holds an
/// error, or whatever building a command fails with.
#[tracing::instrument(skip_all, fields(pipelines = pipelines.len()))]
pub fn compile(
    pipelines: &[Pipeline],
    env: &BuildEnv<'_>,
) -> Result<(Vec<CompiledPipeline>, CompileLog), PipelineError> {
    let log = check_pipelines(pipelines);
    if log.has_errors() {
        tracing::warn!(errors = log.error_count(), "configuration rejected");
        return Err(PipelineError::ConfigRejected(log));
    }
    let compiled = pipelines
        .iter()
        .map(|p| build_pipeline(p, env))
        .collect::<Result<Vec<_>, _>>()?;
    tracing::debug!(
        steps = compiled.iter().map(|p| p.steps.len()).sum::<usize>(),
        "pipelines compiled"
    );
    Ok((compiled, log))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::commands::ai_classifier::AiClassifierSettings;
    use crate::commands::blur::BlurSettings;
    use crate::commands::reclassify::ReclassifySettings;
    use crate::step::CommandSettings;

    fn blur() -> CommandSettings {
        CommandSettings::Blur(BlurSettings::default())
    }

    #[test]
    fn disabled_steps_are_dropped_with_positions_kept() {
        let p = Pipeline::new("p", ClassId::new(1))
            .step(PipelineStep::new(blur()).disabled())
            .step(PipelineStep::new(blur()).with_break_point());
        let (compiled, log) = compile(&[p], &BuildEnv::default()).unwrap();
        assert!(!log.has_errors());
        let steps = &compiled[0].steps;
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].index, 1);
        assert!(steps[0].break_point);
        assert_eq!(steps[0].command.name(), "blur");
    }

    #[test]
    fn type_mismatch_refuses_to_compile() {
        let p = Pipeline::new("p", ClassId::new(1))
            .step(blur())
            .step(CommandSettings::Reclassify(ReclassifySettings::default()));
        let err = compile(&[p], &BuildEnv::default()).unwrap_err();
        let PipelineError::ConfigRejected(log) = err else {
            unreachable!("expected a rejected configuration, got {err}");
        };
        assert_eq!(log.error_count(), 1);
        assert_eq!(log.entries()[0].step, Some(1));
    }

    #[test]
    fn ai_classifier_without_loader_fails_to_build() {
        let p = Pipeline::new("p", ClassId::new(1))
            .step(CommandSettings::AiClassifier(AiClassifierSettings::default()));
        assert!(build_pipeline(&p, &BuildEnv::default()).is_err());
    }
}

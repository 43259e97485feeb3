//! Command line construction contract.
//!
//! Runners treat the produced string as opaque. Only the remote staging
//! backend rewrites it, and only by path substitution.

use std::path::Path;

use crate::dataset::Dataset;
use crate::destination::JobDestination;
use crate::error::GantryError;
use crate::job::Job;

/// Everything a producer may consult for one job.
pub struct CommandContext<'a> {
    pub job: &'a Job,
    /// Input datasets in association order.
    pub inputs: &'a [Dataset],
    /// Output datasets in association order.
    pub outputs: &'a [Dataset],
    pub destination: &'a JobDestination,
    pub working_directory: &'a Path,
}

/// Supplies the executable command for a job.
pub trait CommandProducer: Send + Sync {
    fn build(&self, ctx: &CommandContext<'_>) -> Result<String, GantryError>;
}

/// Expands `$job_id`, `$working_directory`, `$input_N` and `$output_N`
/// (zero-based) in the job's command template.
#[derive(Debug, Clone, Default)]
pub struct TemplateCommandProducer;

impl TemplateCommandProducer {
    pub fn new() -> Self {
        Self
    }
}

impl CommandProducer for TemplateCommandProducer {
    fn build(&self, ctx: &CommandContext<'_>) -> Result<String, GantryError> {
        let template = ctx.job.command_template.as_deref().ok_or_else(|| {
            GantryError::Command(format!("job {} has no command template", ctx.job.id))
        })?;

        let mut command = template.to_string();
        // Highest index first so `$input_1` never clobbers `$input_10`.
        for (i, ds) in ctx.inputs.iter().enumerate().rev() {
            command = command.replace(&format!("$input_{}", i), &ds.file_path.to_string_lossy());
        }
        for (i, ds) in ctx.outputs.iter().enumerate().rev() {
            command = command.replace(&format!("$output_{}", i), &ds.file_path.to_string_lossy());
        }
        command = command
            .replace("$working_directory", &ctx.working_directory.to_string_lossy())
            .replace("$job_id", &ctx.job.id.to_string());

        if command.trim().is_empty() {
            return Err(GantryError::Command(format!(
                "job {} produced an empty command",
                ctx.job.id
            )));
        }
        Ok(command)
    }
}

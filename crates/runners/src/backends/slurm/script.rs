use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use gantry_core::{JobDestination, JobId};

/// Files a batch job writes into its working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFiles {
    pub script: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub exit_code: PathBuf,
}

impl JobFiles {
    pub fn new(working_directory: &Path, job_id: JobId) -> Self {
        let base = format!("gantry_{}", job_id);
        Self {
            script: working_directory.join(format!("{}.sh", base)),
            stdout: working_directory.join(format!("{}.o", base)),
            stderr: working_directory.join(format!("{}.e", base)),
            exit_code: working_directory.join(format!("{}.ec", base)),
        }
    }
}

/// `HH:MM:SS` for `--time`.
pub fn format_walltime(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Batch script for `command`. Destination params `partition`, `walltime`
/// (seconds), `mem`, `cpus` and `native_specification` become `#SBATCH`
/// directives.
pub fn render(
    job_id: JobId,
    command: &str,
    working_directory: &Path,
    files: &JobFiles,
    destination: &JobDestination,
) -> String {
    let mut script = String::from("#!/bin/sh\n");
    let mut directive = |line: String| {
        let _ = writeln!(script, "#SBATCH {}", line);
    };
    directive(format!("--job-name=gantry_{}", job_id));
    directive(format!("--output={}", files.stdout.display()));
    directive(format!("--error={}", files.stderr.display()));
    if let Some(partition) = destination.param("partition") {
        directive(format!("--partition={}", partition));
    }
    if let Some(secs) = destination.param_as::<u64>("walltime") {
        directive(format!("--time={}", format_walltime(secs)));
    }
    if let Some(mem) = destination.param("mem") {
        directive(format!("--mem={}", mem));
    }
    if let Some(cpus) = destination.param_as::<u32>("cpus") {
        directive(format!("--cpus-per-task={}", cpus));
    }
    if let Some(native) = destination.param("native_specification") {
        directive(native.trim().to_string());
    }

    let _ = writeln!(script, "cd '{}' || exit 1", working_directory.display());
    let _ = writeln!(script, "{}", command);
    let _ = writeln!(script, "echo $? > '{}'", files.exit_code.display());
    script
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walltime_formats_as_clock() {
        assert_eq!(format_walltime(59), "00:00:59");
        assert_eq!(format_walltime(3600 * 26 + 61), "26:01:01");
    }

    #[test]
    fn script_carries_destination_directives() {
        let dir = Path::new("/scratch/jobs/7");
        let files = JobFiles::new(dir, 7);
        let dest = JobDestination::new("slurm_long", "slurm")
            .with_param("partition", "long")
            .with_param("walltime", "7200")
            .with_param("native_specification", "--exclusive");
        let script = render(7, "bwa mem ref.fa reads.fq", dir, &files, &dest);

        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("#SBATCH --partition=long\n"));
        assert!(script.contains("#SBATCH --time=02:00:00\n"));
        assert!(script.contains("#SBATCH --exclusive\n"));
        assert!(script.contains("#SBATCH --output=/scratch/jobs/7/gantry_7.o\n"));
        assert!(!script.contains("--mem"));
        assert!(script.ends_with("echo $? > '/scratch/jobs/7/gantry_7.ec'\n"));
    }
}

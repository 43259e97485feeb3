//! Parsing of `sbatch`, `squeue` and `sacct` output.

use gantry_core::FailureKind;

use crate::monitor::RemoteStatus;

/// Job id from `sbatch` output (`Submitted batch job 11`). Also accepts the
/// bare id printed with `--parsable`, optionally followed by `;cluster`.
pub fn parse_job_id(output: &str) -> Option<String> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let id = match line.find("job ") {
        Some(idx) => line[idx + "job ".len()..].trim(),
        None => line.split(';').next().unwrap_or(line).trim(),
    };
    id.parse::<u64>().ok().map(|n| n.to_string())
}

/// First `|`-separated column of each non-empty line.
pub fn parse_states(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let state = line.split('|').next().unwrap_or(line).trim();
            (!state.is_empty()).then(|| normalize(state))
        })
        .collect()
}

/// `CANCELLED by 0` and `CANCELLED+` both normalize to `CANCELLED`.
pub fn normalize(state: &str) -> String {
    state
        .split(|c: char| c == '+' || c == ':' || c == '(' || c.is_whitespace())
        .next()
        .unwrap_or(state)
        .trim()
        .to_ascii_uppercase()
}

fn is_pending(state: &str) -> bool {
    matches!(
        state,
        "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED" | "RESV_DEL_HOLD"
            | "SUSPENDED"
    )
}

fn is_running(state: &str) -> bool {
    matches!(
        state,
        "RUNNING" | "COMPLETING" | "RESIZING" | "STAGE_IN" | "STAGE_OUT" | "SIGNALING"
    )
}

/// Map one normalized Slurm state to a [`RemoteStatus`]. `None` means the
/// state is not one we know.
pub fn classify(state: &str) -> Option<RemoteStatus> {
    let failed = |failure| RemoteStatus::Failed {
        failure,
        message: None,
    };
    let status = match state {
        s if is_pending(s) => RemoteStatus::Queued,
        s if is_running(s) => RemoteStatus::Running,
        // The exit code file decides between success and tool error.
        "COMPLETED" | "FAILED" => RemoteStatus::Finished,
        "TIMEOUT" | "DEADLINE" => failed(FailureKind::WalltimeExceeded),
        "OUT_OF_MEMORY" => failed(FailureKind::MemoryLimitExceeded),
        "NODE_FAIL" | "BOOT_FAIL" | "PREEMPTED" => failed(FailureKind::NodeFailure),
        "CANCELLED" | "REVOKED" => failed(FailureKind::Cancelled),
        "SPECIAL_EXIT" => failed(FailureKind::Unknown),
        _ => return None,
    };
    Some(status)
}

/// Combined status of all `sacct` rows (job plus steps). Any active row keeps
/// the job active; otherwise the first non-COMPLETED terminal row wins.
pub fn classify_all(states: &[String]) -> Option<RemoteStatus> {
    let classified: Vec<RemoteStatus> = states.iter().filter_map(|s| classify(s)).collect();
    if classified.is_empty() {
        return None;
    }
    if classified.contains(&RemoteStatus::Running) {
        return Some(RemoteStatus::Running);
    }
    if classified.contains(&RemoteStatus::Queued) {
        return Some(RemoteStatus::Queued);
    }
    classified
        .iter()
        .find(|s| matches!(s, RemoteStatus::Failed { .. }))
        .cloned()
        .or(Some(RemoteStatus::Finished))
}

//! Filesystem event handler for the notify watcher (hot-reload).

use std::path::Path;

use notify::event::{CreateKind, ModifyKind};
use notify::{Event, EventKind};
use tracing::{info, warn};

use super::core::{read_policy, PolicyHandle};

/// Handle a single filesystem event from the notify watcher.
pub(super) fn handle_fs_event(
    event: &Event,
    policy_path: &Path,
    known: &[String],
    handle: &PolicyHandle,
) {
    let touches_policy = event
        .paths
        .iter()
        .any(|p| p.file_name().is_some() && p.file_name() == policy_path.file_name());
    if !touches_policy {
        return;
    }

    match &event.kind {
        EventKind::Create(CreateKind::File)
        | EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Name(_))
        | EventKind::Modify(ModifyKind::Any) => reload(policy_path, known, handle),
        EventKind::Remove(_) => {
            warn!(path = %policy_path.display(), "routing policy file removed, keeping previous policy");
        }
        _ => {}
    }
}

pub(super) fn reload(policy_path: &Path, known: &[String], handle: &PolicyHandle) {
    match read_policy(policy_path, known) {
        Ok((policy, report)) => {
            report.log();
            info!(
                path = %policy_path.display(),
                tools = policy.tools.len(),
                valid = report.valid,
                "hot-reloaded routing policy"
            );
            handle.replace(policy);
        }
        Err(e) => {
            warn!(
                path = %policy_path.display(),
                error = %e,
                "failed to reload routing policy, keeping previous version"
            );
        }
    }
}

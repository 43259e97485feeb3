//! Destination resolution for jobs leaving admission.

use std::sync::Arc;

use gantry_core::{Dataset, Job, JobDestination};
use gantry_routing::loader::PolicyHandle;
use gantry_routing::{RouteRequest, RoutingError};
use tracing::{debug, info, warn};

use crate::features::job_features;
use crate::jobconf::JobConf;

/// Outcome of resolving a job's destination.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Destination(JobDestination),
    /// The policy sends the job to `fail`; the message is for the user.
    Rejected(String),
    /// No usable destination; the reason is for the logs.
    Misconfigured(String),
}

/// Picks a declared destination for a job, through the routing policy when
/// one is loaded and through the job configuration's static mapping
/// otherwise.
#[derive(Clone)]
pub struct DestinationResolver {
    jobconf: Arc<JobConf>,
    policy: Option<PolicyHandle>,
}

impl DestinationResolver {
    pub fn new(jobconf: Arc<JobConf>, policy: Option<PolicyHandle>) -> Self {
        Self { jobconf, policy }
    }

    pub fn resolve(&self, job: &Job, inputs: &[Dataset]) -> Resolution {
        // Already decided (a resubmission, or a job reset after restart).
        if let Some(dest) = job
            .destination_id
            .as_deref()
            .and_then(|id| self.jobconf.destination(id))
        {
            return Resolution::Destination(dest.clone());
        }

        let Some(handle) = &self.policy else {
            return match self.jobconf.static_destination(&job.tool_id) {
                Some(dest) => Resolution::Destination(dest.clone()),
                None => Resolution::Misconfigured(format!(
                    "no destination configured for tool '{}'",
                    job.tool_id
                )),
            };
        };

        let policy = handle.current();
        let required = policy.required_features(&job.tool_id);
        let request = RouteRequest {
            tool_id: &job.tool_id,
            user_email: job.owner.email(),
            features: job_features(job, inputs, &required),
            workflow_priority: job.workflow_priority.as_deref(),
            resource_priority: job.resource_params.get("priority").map(String::as_str),
        };

        match policy.resolve(&request) {
            Ok(decision) => match self.jobconf.destination(&decision.destination_id) {
                Some(dest) => {
                    if policy.verbose {
                        info!(job_id = job.id, tool = %job.tool_id, destination = %dest.id, source = ?decision.source, "destination resolved");
                    } else {
                        debug!(job_id = job.id, tool = %job.tool_id, destination = %dest.id, "destination resolved");
                    }
                    Resolution::Destination(dest.clone())
                }
                None => Resolution::Misconfigured(format!(
                    "routing policy chose undeclared destination '{}'",
                    decision.destination_id
                )),
            },
            Err(RoutingError::Rejected { message }) => {
                info!(job_id = job.id, tool = %job.tool_id, "job rejected by routing policy");
                Resolution::Rejected(message)
            }
            Err(RoutingError::Configuration(reason)) => {
                warn!(job_id = job.id, tool = %job.tool_id, reason = %reason, "routing failed");
                Resolution::Misconfigured(reason)
            }
        }
    }
}

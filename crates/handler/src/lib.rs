//! Job handler: admission, dispatch and cancellation of jobs.
//!
//! This crate provides:
//! - The YAML job configuration (runner plugins, destinations, limits)
//! - An explicit runner registry mapping plugin kinds to factories
//! - The admission controller with its readiness gates and quota pausing
//! - The cancellation queue and the dispatcher in front of the runners
//! - Startup recovery and the `gantry-handler` process wiring

pub mod admission;
pub mod cancellation;
pub mod destinations;
pub mod dispatcher;
pub mod error;
pub mod features;
pub mod glob;
pub mod handler;
pub mod jobconf;
pub mod recovery;
pub mod registry;

mod settle;

#[cfg(test)]
mod test_support;

pub use admission::readiness::Readiness;
pub use admission::{AdmissionController, AdmissionQueue, AdmissionSettings};
pub use cancellation::{CancelRequest, CancellationLoop, CancellationQueue};
pub use destinations::{DestinationResolver, Resolution};
pub use dispatcher::Dispatcher;
pub use error::{HandlerError, Result};
pub use handler::{JobHandler, JobHandlerBuilder};
pub use jobconf::{JobConf, Limits, RunnerSpec};
pub use recovery::{AnyTool, RecoverySummary, ToolCatalog};
pub use registry::{RunnerFactory, RunnerRegistry};

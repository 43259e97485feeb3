//! Shared model for the gantry job scheduler.
//!
//! Job and dataset records, destinations, the normalized failure taxonomy,
//! the job store contract every component reads and writes through, and the
//! environment-driven handler configuration.

pub mod command;
pub mod config;
pub mod dataset;
pub mod destination;
pub mod error;
pub mod failure;
pub mod job;
pub mod store;

pub use command::{CommandContext, CommandProducer, TemplateCommandProducer};
pub use config::Config;
pub use dataset::*;
pub use destination::*;
pub use error::*;
pub use failure::FailureKind;
pub use job::*;
pub use store::{JobFilter, JobStore, MemoryJobStore, StoreSnapshot};

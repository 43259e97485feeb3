//! Declarative destination routing.
//!
//! This crate provides:
//! - YAML routing policy validation in strict and corrective modes, with
//!   typo suggestions for destination ids
//! - Policy loader with hot-reload via `notify` watcher
//! - Rule matching on input size, dataset count, record count and tool
//!   arguments, with nice-value tie-breaks and priority-keyed destinations
//! - Binary byte-size parsing and rendering

pub mod bytes;
pub mod error;
pub mod loader;
pub mod resolver;
pub mod schema;
pub mod validation;

pub use bytes::{bytes_to_str, str_to_bytes, Bound};
pub use error::RoutingError;
pub use loader::{PolicyError, PolicyLoader};
pub use resolver::{JobFeatures, RouteDecision, RouteRequest, RouteSource};
pub use schema::{DestinationRef, DestinationRule, RoutingPolicy, RuleType, FAIL_DESTINATION};
pub use validation::{is_valid, validate_yaml, Validated, ValidationResult};

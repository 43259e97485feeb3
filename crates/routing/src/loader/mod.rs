//! Routing policy loader with hot-reload via `notify` watcher.
//!
//! Reads one YAML policy file, validates it in corrective mode against the
//! declared destinations and publishes the result behind a shared handle.
//! A reload that fails to parse keeps the previous policy.

mod core;
mod error;
mod watcher;


pub use self::core::{parse_policy, PolicyHandle, PolicyLoader};
pub use self::error::{PolicyError, Result};

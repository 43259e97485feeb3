use gantry_core::StoreError;
use gantry_routing::PolicyError;
use gantry_runners::RunnerError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),

    #[error("Routing policy error: {0}")]
    Policy(#[from] PolicyError),

    /// The job configuration parsed but is inconsistent.
    #[error("Job configuration error: {0}")]
    JobConf(String),
}

pub type Result<T> = std::result::Result<T, HandlerError>;

pub mod apply;
pub mod config;
pub mod consumer;
pub mod error;
pub mod replicator;

pub mod postgres;
pub mod target;

pub use config::Config;
pub use error::{Error, Result};
pub use replicator::{run_pipeline, PipelineOptions, Replicator};

pub mod config;
pub mod drain;
pub mod error;
pub mod pipeline;

pub use config::PipelineConfig;
pub use error::AuditError;
pub use pipeline::{Admission, AuditPipeline, ChainReport, DrainReport, EnqueueOptions};

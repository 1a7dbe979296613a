pub mod config;
pub mod constants;
pub mod domain;
pub mod error;
pub mod logging;
pub mod observability;
pub mod pipeline;
pub mod registry;

pub use config::CurateConfig;
pub use error::{CurateError, Result};
pub use pipeline::CurationOrchestrator;
pub use registry::DatasetRegistry;

pub mod api;
pub mod config;
pub mod error;
pub mod observability;
pub mod pipeline;
pub mod session;
pub mod types;
pub mod util;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{PipelineError, PipelineResult};

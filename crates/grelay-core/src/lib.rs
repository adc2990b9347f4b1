//! Request-handling engine of the proxy: model catalog, format
//! translation, the credential-backed upstream pipeline, and config.

pub mod catalog;
pub mod config;
pub mod envelope;
pub mod error;
pub mod onboard;
pub mod pipeline;
pub mod translate;
pub mod upstream;

pub use envelope::RequestEnvelope;
pub use error::RelayError;
pub use pipeline::{Pipeline, PipelineOutput};

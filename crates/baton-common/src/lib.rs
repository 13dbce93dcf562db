//! Shared plumbing for baton binaries.

pub mod logging;

pub use logging::{init_logging, LogFormat};

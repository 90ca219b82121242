//! Utility modules for the clone run.

pub mod errors;
pub mod logger;
pub mod report;

pub use errors::{CloneError, Result};
pub use report::ErrorReporter;

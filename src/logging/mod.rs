//! Logging setup for the binary.

mod format;

pub use format::StructuredLogger;

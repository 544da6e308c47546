//! memfeat: memory-forensics artifact normalization and feature extraction.
//!
//! Modular structure:
//! - [`runner`] — Extraction-tool plugins as isolated subprocesses
//! - [`parser`] — Versioned column layouts, raw plugin text → typed rows
//! - [`normalize`] — Rows of every plugin → one canonical artifact graph per dump
//! - [`features`] — Versioned feature schemas over the graph
//! - [`pipeline`] — Concurrent orchestration, persisted documents
//! - [`classify`] — Classifier and explainer boundary
//! - [`assistant`] — Conversational assistant boundary
//! - [`storage`] — SQLite feature cache
//! - [`logging`] — Structured logging

pub mod assistant;
pub mod classify;
pub mod config;
pub mod error;
pub mod features;
pub mod logging;
pub mod normalize;
pub mod parser;
pub mod pipeline;
pub mod runner;
pub mod storage;
pub mod warning;

pub use config::PipelineConfig;
pub use error::{PipelineError, PipelineResult};
pub use features::{FeatureExtractor, FeatureVector};
pub use logging::StructuredLogger;
pub use normalize::{CanonicalImage, Normalizer};
pub use pipeline::{Analysis, Pipeline};
pub use runner::{CancelToken, PluginResult, PluginRunner};
pub use storage::FeatureCache;
pub use warning::Warning;

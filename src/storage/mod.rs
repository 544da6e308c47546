//! Local storage for derived feature vectors.

mod cache;

pub use cache::FeatureCache;

#![forbid(unsafe_code)]

//! Metadata documents and the process-wide metadata cache.

/// Single-flight cache of metadata documents keyed by endpoint.
pub mod cache;
/// Raw metadata documents and model loaders.
pub mod document;

pub use cache::{BoundMetadata, MetadataCache, MetadataCacheEntry};
pub use document::{JsonModelLoader, MetadataDocument, ModelLoader, StaticModelLoader};

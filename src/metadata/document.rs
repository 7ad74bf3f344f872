use std::fmt;
use std::sync::Arc;

use crate::protocol::{
    detect::{document_tokens, header_tokens, resolve_version},
    ProtocolVersion,
};
use crate::query::metadata::{EntityModel, NavigationResolver};
use crate::types::{ProtocolError, Result};

/// Metadata document as fetched, together with the version tokens the
/// service advertised while serving it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetadataDocument {
    /// Document body.
    pub raw: String,
    /// Version tokens from the response headers.
    pub version_tokens: Vec<String>,
}

impl MetadataDocument {
    /// Document without header information.
    pub fn new(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            version_tokens: Vec::new(),
        }
    }

    /// Document with the version tokens found in `headers`.
    pub fn with_headers<'a, I>(raw: impl Into<String>, headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        Self {
            raw: raw.into(),
            version_tokens: header_tokens(headers),
        }
    }

    /// Version tokens declared inside the document.
    pub fn declared_tokens(&self) -> Vec<String> {
        document_tokens(&self.raw)
    }

    /// Detects the protocol version, headers first.
    pub fn detect_version(&self) -> Result<ProtocolVersion> {
        resolve_version(self.version_tokens.clone(), Some(&self.raw))
    }

    /// True when the body looks like the JSON encoding of a model.
    pub fn is_json(&self) -> bool {
        self.raw.trim_start().starts_with('{')
    }
}

/// Turns a metadata document into navigation facts.
pub trait ModelLoader: Send + Sync + fmt::Debug {
    /// Builds the resolver for `document`.
    fn load(&self, document: &MetadataDocument) -> Result<Arc<dyn NavigationResolver>>;
}

/// Reads the JSON encoding of [`EntityModel`].
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonModelLoader;

impl ModelLoader for JsonModelLoader {
    fn load(&self, document: &MetadataDocument) -> Result<Arc<dyn NavigationResolver>> {
        if !document.is_json() {
            return Err(ProtocolError::MalformedMetadata(
                "expected a JSON entity model; configure a model loader for EDMX documents".into(),
            )
            .into());
        }
        Ok(Arc::new(EntityModel::from_json(&document.raw)?))
    }
}

/// Serves a model supplied up front, whatever the document says.
#[derive(Clone)]
pub struct StaticModelLoader(pub Arc<dyn NavigationResolver>);

impl fmt::Debug for StaticModelLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticModelLoader").finish_non_exhaustive()
    }
}

impl ModelLoader for StaticModelLoader {
    fn load(&self, _document: &MetadataDocument) -> Result<Arc<dyn NavigationResolver>> {
        Ok(Arc::clone(&self.0))
    }
}

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::metadata::{JsonModelLoader, ModelLoader};
use crate::protocol::{AdapterFactory, AdapterOptions, UpdateMethod};
use crate::transport::Transport;
use crate::types::{Error, Result};

/// Session configuration.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Service root, e.g. `https://host/svc/`. Also the metadata cache key.
    pub base_uri: String,
    /// Metadata document supplied up front instead of fetched.
    pub metadata_document: Option<String>,
    /// Per-request timeout; `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    /// Create a new connection for every request.
    pub renew_connection: bool,
    /// Fail on filter fragments that target several entities.
    pub strict_filter_targets: bool,
    /// Render modern enum literals without the type prefix.
    pub enum_prefix_free: bool,
    /// Percent-escape literals inside query clauses.
    pub escape_literals: bool,
    /// Method used for updates that keep their key.
    pub preferred_update_method: UpdateMethod,
    /// Consulted before the built-in adapters.
    pub adapter_factory: Option<Arc<dyn AdapterFactory>>,
    /// Turns metadata documents into navigation facts.
    pub model_loader: Arc<dyn ModelLoader>,
    /// Sends requests; required for fetching metadata and executing.
    pub transport: Option<Arc<dyn Transport>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_uri: String::new(),
            metadata_document: None,
            request_timeout: Some(Duration::from_secs(100)),
            renew_connection: false,
            strict_filter_targets: false,
            enum_prefix_free: false,
            escape_literals: true,
            preferred_update_method: UpdateMethod::Patch,
            adapter_factory: None,
            model_loader: Arc::new(JsonModelLoader),
            transport: None,
        }
    }
}

impl Settings {
    /// Default settings for `base_uri`.
    pub fn new(base_uri: impl Into<String>) -> Self {
        Self {
            base_uri: base_uri.into(),
            ..Self::default()
        }
    }

    /// Settings for offline compilation against a known document.
    pub fn offline(base_uri: impl Into<String>, metadata_document: impl Into<String>) -> Self {
        Self {
            metadata_document: Some(metadata_document.into()),
            request_timeout: None,
            ..Self::new(base_uri)
        }
    }

    /// Rejects ambiguous filters and always replaces on update.
    pub fn strict(base_uri: impl Into<String>) -> Self {
        Self {
            strict_filter_targets: true,
            preferred_update_method: UpdateMethod::Put,
            ..Self::new(base_uri)
        }
    }

    /// Sets the metadata document.
    pub fn with_metadata_document(mut self, document: impl Into<String>) -> Self {
        self.metadata_document = Some(document.into());
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets whether each request gets a fresh connection.
    pub fn with_renew_connection(mut self, renew: bool) -> Self {
        self.renew_connection = renew;
        self
    }

    /// Sets strict filter targeting.
    pub fn with_strict_filter_targets(mut self, strict: bool) -> Self {
        self.strict_filter_targets = strict;
        self
    }

    /// Sets prefix-free enum literals.
    pub fn with_enum_prefix_free(mut self, prefix_free: bool) -> Self {
        self.enum_prefix_free = prefix_free;
        self
    }

    /// Sets literal escaping.
    pub fn with_escape_literals(mut self, escape: bool) -> Self {
        self.escape_literals = escape;
        self
    }

    /// Sets the update method.
    pub fn with_update_method(mut self, method: UpdateMethod) -> Self {
        self.preferred_update_method = method;
        self
    }

    /// Sets the custom adapter factory.
    pub fn with_adapter_factory(mut self, factory: Arc<dyn AdapterFactory>) -> Self {
        self.adapter_factory = Some(factory);
        self
    }

    /// Sets the model loader.
    pub fn with_model_loader(mut self, loader: Arc<dyn ModelLoader>) -> Self {
        self.model_loader = loader;
        self
    }

    /// Sets the transport.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Metadata cache key: the base URI without trailing slashes.
    pub fn metadata_key(&self) -> &str {
        self.base_uri.trim_end_matches('/')
    }

    /// Formatting switches handed to adapters.
    pub fn adapter_options(&self) -> AdapterOptions {
        AdapterOptions {
            escape_literals: self.escape_literals,
            enum_prefix_free: self.enum_prefix_free,
            strict_filter_targets: self.strict_filter_targets,
            update_method: self.preferred_update_method,
        }
    }

    /// Checks the settings can back a session.
    pub fn validate(&self) -> Result<()> {
        if self.metadata_key().trim().is_empty() {
            return Err(Error::Config("base_uri must not be empty".into()));
        }
        if self.request_timeout == Some(Duration::ZERO) {
            return Err(Error::Config("request_timeout must be positive".into()));
        }
        Ok(())
    }
}

/// Serializable subset of [`Settings`], read from TOML.
///
/// ```toml
/// base_uri = "https://services.odata.org/V4/Northwind/Northwind.svc/"
/// metadata_file = "northwind.json"
/// request_timeout_ms = 30000
/// update_method = "put"
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettingsFile {
    /// Service root.
    pub base_uri: String,
    /// Metadata document path, relative to the settings file.
    pub metadata_file: Option<PathBuf>,
    /// Request timeout in milliseconds; `0` disables it.
    pub request_timeout_ms: Option<u64>,
    /// Fresh connection per request.
    pub renew_connection: bool,
    /// Strict filter targeting.
    pub strict_filter_targets: bool,
    /// Prefix-free enum literals.
    pub enum_prefix_free: bool,
    /// Literal escaping; on unless disabled.
    pub escape_literals: Option<bool>,
    /// Update method.
    pub update_method: Option<UpdateMethod>,
}

impl SettingsFile {
    /// Parses TOML text.
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| Error::Config(err.to_string()))
    }

    /// Reads and parses `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("reading {}: {err}", path.display())))?;
        let mut file = Self::parse(&text)?;
        if let (Some(metadata), Some(dir)) = (file.metadata_file.as_mut(), path.parent()) {
            if metadata.is_relative() {
                *metadata = dir.join(&*metadata);
            }
        }
        Ok(file)
    }

    /// Renders the file back to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|err| Error::Config(err.to_string()))
    }

    /// Builds [`Settings`], reading the metadata file if one is named.
    pub fn into_settings(self) -> Result<Settings> {
        let metadata_document = match &self.metadata_file {
            Some(path) => Some(fs::read_to_string(path).map_err(|err| {
                Error::Config(format!("reading {}: {err}", path.display()))
            })?),
            None => None,
        };
        let defaults = Settings::default();
        let settings = Settings {
            base_uri: self.base_uri,
            metadata_document,
            request_timeout: match self.request_timeout_ms {
                Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
                None => defaults.request_timeout,
            },
            renew_connection: self.renew_connection,
            strict_filter_targets: self.strict_filter_targets,
            enum_prefix_free: self.enum_prefix_free,
            escape_literals: self.escape_literals.unwrap_or(defaults.escape_literals),
            preferred_update_method: self.update_method.unwrap_or_default(),
            ..defaults
        };
        settings.validate()?;
        Ok(settings)
    }
}

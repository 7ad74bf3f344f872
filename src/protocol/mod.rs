#![forbid(unsafe_code)]

//! Protocol adapters.
//!
//! A [`ProtocolAdapter`] turns a [`CommandState`] into an ordered clause list,
//! a resource path and an HTTP method for one protocol family. The legacy
//! family (OData 1.0 to 3.0) is served by [`V3Adapter`], the modern family
//! (4.0 and 4.01) by [`V4Adapter`]. Which one a session uses is decided once,
//! when the protocol version is detected.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::query::{
    analyze::EntityFilters,
    command::{CommandState, Entry, ExpandOptions},
    metadata::NavigationResolver,
};
use crate::types::{ProtocolError, Result};

/// Version detection from response headers and metadata documents.
pub mod detect;
/// Clause assembly shared by both adapters.
pub mod format;
/// Literal encoding per dialect.
pub mod literal;
/// Expression rendering.
pub mod render;
/// Legacy adapter.
pub mod v3;
/// Modern adapter.
pub mod v4;

pub use detect::detect_version;
pub use literal::{LegacyLiterals, LiteralConverter, ModernLiterals};
pub use v3::V3Adapter;
pub use v4::V4Adapter;

/// Protocol version advertised by a service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// OData 1.0
    #[serde(rename = "1.0")]
    V1,
    /// OData 2.0
    #[serde(rename = "2.0")]
    V2,
    /// OData 3.0
    #[serde(rename = "3.0")]
    V3,
    /// OData 4.0
    #[serde(rename = "4.0")]
    V4,
    /// OData 4.01
    #[serde(rename = "4.01")]
    V401,
}

impl ProtocolVersion {
    /// Every supported version, oldest first.
    pub const ALL: [ProtocolVersion; 5] = [
        ProtocolVersion::V1,
        ProtocolVersion::V2,
        ProtocolVersion::V3,
        ProtocolVersion::V4,
        ProtocolVersion::V401,
    ];

    /// Parses a version token such as `3.0` or `4.01`.
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim() {
            "1.0" | "1" => Some(ProtocolVersion::V1),
            "2.0" | "2" => Some(ProtocolVersion::V2),
            "3.0" | "3" => Some(ProtocolVersion::V3),
            "4.0" | "4" => Some(ProtocolVersion::V4),
            "4.01" => Some(ProtocolVersion::V401),
            _ => None,
        }
    }

    /// Canonical token.
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolVersion::V1 => "1.0",
            ProtocolVersion::V2 => "2.0",
            ProtocolVersion::V3 => "3.0",
            ProtocolVersion::V4 => "4.0",
            ProtocolVersion::V401 => "4.01",
        }
    }

    /// Dialect family of this version.
    pub fn dialect(self) -> Dialect {
        match self {
            ProtocolVersion::V1 | ProtocolVersion::V2 | ProtocolVersion::V3 => Dialect::Legacy,
            ProtocolVersion::V4 | ProtocolVersion::V401 => Dialect::Modern,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Syntax family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// OData 1.0 to 3.0.
    Legacy,
    /// OData 4.0 and later.
    Modern,
}

/// How function parameters are passed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FunctionStyle {
    /// `Fn?p=1`
    QueryParameters,
    /// `Fn(p=1)`
    PathSegment,
}

/// HTTP method of a compiled request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `PATCH`
    Patch,
    /// `DELETE`
    Delete,
}

impl HttpMethod {
    /// Method name on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Preferred method for updates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMethod {
    /// Partial update.
    #[default]
    Patch,
    /// Full replacement.
    Put,
}

/// Formatting switches shared by every adapter.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AdapterOptions {
    /// Percent-escape literals inside query clauses.
    pub escape_literals: bool,
    /// Render modern enum literals without the type prefix.
    pub enum_prefix_free: bool,
    /// Reject filter fragments that target several entities.
    pub strict_filter_targets: bool,
    /// Method used for updates that keep their key.
    pub update_method: UpdateMethod,
}

/// One `name=value` query parameter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryClause {
    /// Parameter name, e.g. `$filter`.
    pub name: String,
    /// Parameter value.
    pub value: String,
}

impl QueryClause {
    /// Creates a clause.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for QueryClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}={}", self.name, self.value)
        }
    }
}

/// Rendered predicates to nest into expand items, keyed by entity path.
pub type NestedFilters = BTreeMap<String, Vec<String>>;

/// Result of rendering the expand list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExpandRendering {
    /// `$expand` value, if anything is expanded.
    pub expand: Option<String>,
    /// Extra `$select` items contributed by expand options.
    pub select: Vec<String>,
}

/// Fully formatted request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompiledRequest {
    /// HTTP method.
    pub method: HttpMethod,
    /// Resource path relative to the service root.
    pub path: String,
    /// Query parameters in protocol order.
    pub clauses: Vec<QueryClause>,
    /// Rendered filter fragments per entity path.
    pub entity_filters: BTreeMap<String, Vec<String>>,
    /// Body for inserts, updates and modern actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Entry>,
}

impl CompiledRequest {
    /// Query string without the leading `?`.
    pub fn query_string(&self) -> String {
        self.clauses
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Path plus query string.
    pub fn relative_uri(&self) -> String {
        if self.clauses.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query_string())
        }
    }

    /// Value of the clause named `name`.
    pub fn clause(&self, name: &str) -> Option<&str> {
        self.clauses
            .iter()
            .find(|clause| clause.name == name)
            .map(|clause| clause.value.as_str())
    }
}

/// Formats commands for one protocol family.
pub trait ProtocolAdapter: Send + Sync {
    /// Version the adapter was created for.
    fn version(&self) -> ProtocolVersion;

    /// Dialect family.
    fn dialect(&self) -> Dialect {
        self.version().dialect()
    }

    /// Navigation facts of the bound model.
    fn resolver(&self) -> &dyn NavigationResolver;

    /// Formatting switches.
    fn options(&self) -> &AdapterOptions;

    /// Literal encoder.
    fn literals(&self) -> &dyn LiteralConverter;

    /// Function parameter passing style.
    fn function_style(&self) -> FunctionStyle;

    /// Clause requesting the inline total count.
    fn count_clause(&self) -> QueryClause;

    /// Path addressing the links of `navigation`, optionally to one target.
    fn link_path(&self, navigation: &str, target: Option<&str>) -> String;

    /// Renders the expand list, nesting `nested` predicates where supported.
    fn expand(
        &self,
        expands: &[(String, ExpandOptions)],
        nested: &NestedFilters,
    ) -> Result<ExpandRendering>;

    /// Partitions every stored filter expression of `command`.
    fn analyze(&self, command: &CommandState) -> Result<EntityFilters> {
        format::analyze_command(self, command)
    }

    /// Produces the ordered clause list.
    fn format(&self, command: &CommandState, filters: &EntityFilters) -> Result<Vec<QueryClause>> {
        format::format_clauses(self, command, filters)
    }

    /// Compiles `command` into a request.
    fn compile(&self, command: &CommandState) -> Result<CompiledRequest> {
        format::compile(self, command)
    }
}

impl fmt::Debug for dyn ProtocolAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolAdapter")
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

/// Builds adapters for detected versions.
pub trait AdapterFactory: Send + Sync + fmt::Debug {
    /// Returns an adapter for `version`, or `None` to defer to the built-in
    /// adapters.
    fn create(
        &self,
        version: ProtocolVersion,
        resolver: Arc<dyn NavigationResolver>,
        options: &AdapterOptions,
    ) -> Option<Arc<dyn ProtocolAdapter>>;
}

/// Built-in factory covering every [`ProtocolVersion`].
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultAdapterFactory;

impl AdapterFactory for DefaultAdapterFactory {
    fn create(
        &self,
        version: ProtocolVersion,
        resolver: Arc<dyn NavigationResolver>,
        options: &AdapterOptions,
    ) -> Option<Arc<dyn ProtocolAdapter>> {
        let adapter: Arc<dyn ProtocolAdapter> = match version.dialect() {
            Dialect::Legacy => Arc::new(V3Adapter::new(version, resolver, options.clone())),
            Dialect::Modern => Arc::new(V4Adapter::new(version, resolver, options.clone())),
        };
        Some(adapter)
    }
}

/// Creates the adapter for `version`, consulting `custom` first.
pub fn create_adapter(
    custom: Option<&dyn AdapterFactory>,
    version: ProtocolVersion,
    resolver: Arc<dyn NavigationResolver>,
    options: &AdapterOptions,
) -> Result<Arc<dyn ProtocolAdapter>> {
    let adapter = custom
        .and_then(|factory| factory.create(version, Arc::clone(&resolver), options))
        .or_else(|| DefaultAdapterFactory.create(version, resolver, options))
        .ok_or_else(|| ProtocolError::UnsupportedVersion {
            seen: vec![version.to_string()],
        })?;
    info!(version = %version, custom = custom.is_some(), "constructed protocol adapter");
    Ok(adapter)
}

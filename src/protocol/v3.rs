//! OData 1.0 to 3.0.

use std::sync::Arc;

use crate::protocol::{
    AdapterOptions, ExpandRendering, FunctionStyle, LegacyLiterals, LiteralConverter,
    NestedFilters, ProtocolAdapter, ProtocolVersion, QueryClause,
};
use crate::query::{command::ExpandOptions, metadata::NavigationResolver};
use crate::types::{Error, Result};

/// Adapter for the legacy protocol family.
///
/// Related-collection filters are always wrapped in `any()`, expansion is a
/// flat list of paths and function parameters travel in the query string.
pub struct V3Adapter {
    version: ProtocolVersion,
    resolver: Arc<dyn NavigationResolver>,
    options: AdapterOptions,
}

impl V3Adapter {
    /// Creates an adapter for `version`.
    pub fn new(
        version: ProtocolVersion,
        resolver: Arc<dyn NavigationResolver>,
        options: AdapterOptions,
    ) -> Self {
        Self {
            version,
            resolver,
            options,
        }
    }
}

impl ProtocolAdapter for V3Adapter {
    fn version(&self) -> ProtocolVersion {
        self.version
    }

    fn resolver(&self) -> &dyn NavigationResolver {
        self.resolver.as_ref()
    }

    fn options(&self) -> &AdapterOptions {
        &self.options
    }

    fn literals(&self) -> &dyn LiteralConverter {
        &LegacyLiterals
    }

    fn function_style(&self) -> FunctionStyle {
        FunctionStyle::QueryParameters
    }

    fn count_clause(&self) -> QueryClause {
        QueryClause::new("$inlinecount", "allpages")
    }

    fn link_path(&self, navigation: &str, target: Option<&str>) -> String {
        format!("$links/{navigation}{}", target.unwrap_or_default())
    }

    fn expand(
        &self,
        expands: &[(String, ExpandOptions)],
        _nested: &NestedFilters,
    ) -> Result<ExpandRendering> {
        let mut rendering = ExpandRendering::default();
        let mut paths = Vec::with_capacity(expands.len());
        for (path, options) in expands {
            if options.levels.is_some() {
                return Err(Error::unsupported("expand $levels", self.version));
            }
            if !options.order_by.is_empty() {
                return Err(Error::unsupported("expand $orderby", self.version));
            }
            if options.by_ref {
                return Err(Error::unsupported("expand $ref", self.version));
            }
            paths.push(path.clone());
            rendering
                .select
                .extend(options.select.iter().map(|item| format!("{path}/{item}")));
        }
        if !paths.is_empty() {
            rendering.expand = Some(paths.join(","));
        }
        Ok(rendering)
    }
}

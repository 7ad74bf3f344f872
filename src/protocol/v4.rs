//! OData 4.0 and 4.01.

use std::sync::Arc;

use crate::protocol::{
    format::order_list, AdapterOptions, ExpandRendering, FunctionStyle, LiteralConverter,
    ModernLiterals, NestedFilters, ProtocolAdapter, ProtocolVersion, QueryClause,
};
use crate::query::{
    command::{ExpandLevels, ExpandOptions},
    metadata::NavigationResolver,
};
use crate::types::Result;

/// Adapter for the modern protocol family.
///
/// Filters on expanded collections are nested into the expand item and
/// multi-segment expand paths become nested `$expand` options.
pub struct V4Adapter {
    version: ProtocolVersion,
    resolver: Arc<dyn NavigationResolver>,
    options: AdapterOptions,
    literals: ModernLiterals,
}

impl V4Adapter {
    /// Creates an adapter for `version`.
    pub fn new(
        version: ProtocolVersion,
        resolver: Arc<dyn NavigationResolver>,
        options: AdapterOptions,
    ) -> Self {
        let literals = ModernLiterals {
            enum_prefix_free: options.enum_prefix_free,
        };
        Self {
            version,
            resolver,
            options,
            literals,
        }
    }
}

#[derive(Default)]
struct ExpandNode {
    name: String,
    options: ExpandOptions,
    filters: Vec<String>,
    children: Vec<ExpandNode>,
}

impl ExpandNode {
    fn child<'a>(nodes: &'a mut Vec<ExpandNode>, name: &str) -> &'a mut ExpandNode {
        let index = match nodes
            .iter()
            .position(|node| node.name.eq_ignore_ascii_case(name))
        {
            Some(index) => index,
            None => {
                nodes.push(ExpandNode {
                    name: name.to_owned(),
                    ..ExpandNode::default()
                });
                nodes.len() - 1
            }
        };
        &mut nodes[index]
    }

    fn locate<'a>(nodes: &'a mut Vec<ExpandNode>, path: &str) -> &'a mut ExpandNode {
        let mut segments = path.split('/');
        let first = segments.next().unwrap_or(path);
        let mut node = Self::child(nodes, first);
        for segment in segments {
            node = Self::child(&mut node.children, segment);
        }
        node
    }

    fn render(&self) -> String {
        let mut options = Vec::new();
        if !self.filters.is_empty() {
            options.push(format!("$filter={}", self.filters.join(" and ")));
        }
        if !self.children.is_empty() {
            let children: Vec<String> = self.children.iter().map(ExpandNode::render).collect();
            options.push(format!("$expand={}", children.join(",")));
        }
        if !self.options.select.is_empty() {
            options.push(format!("$select={}", self.options.select.join(",")));
        }
        if !self.options.order_by.is_empty() {
            options.push(format!("$orderby={}", order_list(&self.options.order_by)));
        }
        match self.options.levels {
            Some(ExpandLevels::Depth(depth)) => options.push(format!("$levels={depth}")),
            Some(ExpandLevels::Max) => options.push("$levels=max".to_owned()),
            None => {}
        }
        let mut rendered = self.name.clone();
        if self.options.by_ref {
            rendered.push_str("/$ref");
        }
        if !options.is_empty() {
            rendered.push('(');
            rendered.push_str(&options.join(";"));
            rendered.push(')');
        }
        rendered
    }
}

impl ProtocolAdapter for V4Adapter {
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
        &self.literals
    }

    fn function_style(&self) -> FunctionStyle {
        FunctionStyle::PathSegment
    }

    fn count_clause(&self) -> QueryClause {
        QueryClause::new("$count", "true")
    }

    fn link_path(&self, navigation: &str, target: Option<&str>) -> String {
        format!("{navigation}{}/$ref", target.unwrap_or_default())
    }

    fn expand(
        &self,
        expands: &[(String, ExpandOptions)],
        nested: &NestedFilters,
    ) -> Result<ExpandRendering> {
        let mut roots: Vec<ExpandNode> = Vec::new();
        for (path, options) in expands {
            ExpandNode::locate(&mut roots, path).options = options.clone();
        }
        for (path, filters) in nested {
            ExpandNode::locate(&mut roots, path)
                .filters
                .extend(filters.iter().cloned());
        }
        let expand = (!roots.is_empty()).then(|| {
            roots
                .iter()
                .map(ExpandNode::render)
                .collect::<Vec<_>>()
                .join(",")
        });
        Ok(ExpandRendering {
            expand,
            select: Vec::new(),
        })
    }
}

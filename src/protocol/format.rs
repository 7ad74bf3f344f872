//! Clause assembly shared by every adapter.
//!
//! Clauses always come out in the same order, whatever order the fluent calls
//! were made in: `$filter`, `$search`, `$expand`, `$select`, `$orderby`,
//! `$skip`, `$top`, the inline count, custom query options and finally
//! query-style function parameters.

use std::collections::BTreeMap;

use tracing::debug;

use crate::protocol::{
    render::Renderer, CompiledRequest, Dialect, FunctionStyle, HttpMethod, NestedFilters,
    ProtocolAdapter, QueryClause, UpdateMethod,
};
use crate::query::{
    analyze::{validate_query_option, EntityFilters, ExpressionAnalyzer, FilterOptions},
    ast::{Expr, Operator},
    command::{CommandState, InvocationKind, KeyValues, Operation, OrderBy, Segment},
    value::Value,
};
use crate::types::{CompilationError, Error, Result};

/// Range variable used when wrapping nested predicates in `any()`.
const LAMBDA_VAR: &str = "x";

/// Range variable for a text filter on `entity`. Text filters name related
/// properties as `<navigation>/Property`, so inside `any()` every such
/// reference binds to the range variable.
fn range_variable(entity: &str) -> &str {
    entity.rsplit('/').next().unwrap_or(entity)
}

/// Strips the `<qualifier>/` prefix from every reference in `text`. Quoted
/// literals and longer paths ending in the qualifier are left alone.
fn unqualify(text: &str, qualifier: &str) -> String {
    let prefix = format!("{qualifier}/");
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    let mut in_literal = false;
    let mut prev: Option<char> = None;
    while let Some(ch) = rest.chars().next() {
        if !in_literal && !prev.is_some_and(continues_path) && rest.starts_with(&prefix) {
            rest = &rest[prefix.len()..];
            prev = Some('/');
            continue;
        }
        if ch == '\'' {
            in_literal = !in_literal;
        }
        out.push(ch);
        prev = Some(ch);
        rest = &rest[ch.len_utf8()..];
    }
    out
}

fn continues_path(ch: char) -> bool {
    ch.is_alphanumeric() || matches!(ch, '_' | '/' | '.')
}

/// Entity set a command resolves to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    /// Canonical collection name filters are analyzed against, when known.
    pub collection: Option<String>,
    /// Key under which the command stores filters for its own entity set.
    pub entity_key: String,
}

/// Walks the command chain to the entity set it addresses.
pub fn resolve_target<A: ProtocolAdapter + ?Sized>(
    adapter: &A,
    command: &CommandState,
) -> Result<Target> {
    let resolver = adapter.resolver();
    let mut collection: Option<String> = None;
    for node in command.chain() {
        match &node.segment {
            Some(Segment::Collection(name)) => {
                collection = Some(
                    resolver
                        .collection_name(name)
                        .ok_or_else(|| Error::unknown_entity(name))?,
                );
            }
            Some(Segment::Navigation(navigation)) => {
                collection = match collection {
                    Some(current) => {
                        let canonical = resolver
                            .navigation_name(&current, navigation)
                            .ok_or_else(|| Error::unknown_navigation(&current, navigation))?;
                        Some(resolver.navigation_partner(&current, &canonical)?)
                    }
                    None => None,
                };
            }
            Some(Segment::BatchReference(_)) => collection = None,
            Some(Segment::DerivedType(_)) | None => {}
        }
    }
    let entity_key = command
        .entity_name()
        .map(str::to_owned)
        .or_else(|| command.invocation.as_ref().map(|call| call.name.clone()))
        .ok_or(CompilationError::MissingCollection)?;
    Ok(Target {
        collection,
        entity_key,
    })
}

/// Partitions every stored filter expression.
///
/// The filter of the command's own entity set goes through the analyzer.
/// Filters stored for related entity paths are relative to that path and are
/// bucketed under it directly; in the legacy dialect their references are
/// expanded to full paths so every non-root bucket has the same shape.
pub fn analyze_command<A: ProtocolAdapter + ?Sized>(
    adapter: &A,
    command: &CommandState,
) -> Result<EntityFilters> {
    let target = resolve_target(adapter, command)?;
    let mut buckets = EntityFilters::new();
    let options = FilterOptions {
        dialect: adapter.dialect(),
        query_option: false,
        strict_targets: adapter.options().strict_filter_targets,
    };
    for (entity, expr) in command.filter_expressions() {
        if entity.eq_ignore_ascii_case(&target.entity_key) {
            let root = target
                .collection
                .as_deref()
                .ok_or_else(|| Error::unknown_entity(entity))?;
            let analyzed = ExpressionAnalyzer::with_options(adapter.resolver(), options)
                .process_filter(expr, root)?;
            for (bucket, fragments) in analyzed {
                buckets.entry(bucket).or_default().extend(fragments);
            }
        } else {
            let path = canonical_path(adapter, target.collection.as_deref(), entity);
            let fragments: Vec<Expr> = expr
                .conjuncts()
                .into_iter()
                .map(|fragment| match adapter.dialect() {
                    Dialect::Legacy => {
                        fragment.map_references(&mut |reference| format!("{path}/{reference}"))
                    }
                    Dialect::Modern => fragment.clone(),
                })
                .collect();
            buckets.entry(path).or_default().extend(fragments);
        }
    }
    debug!(
        entity = %target.entity_key,
        buckets = buckets.len(),
        "analyzed command filters"
    );
    Ok(buckets)
}

/// Canonical spelling of a navigation path, or the path as given when it
/// cannot be resolved.
fn canonical_path<A: ProtocolAdapter + ?Sized>(
    adapter: &A,
    root: Option<&str>,
    path: &str,
) -> String {
    let resolver = adapter.resolver();
    let Some(mut current) = root.map(str::to_owned) else {
        return path.to_owned();
    };
    let mut canonical = Vec::new();
    for segment in path.split('/') {
        let Some(navigation) = resolver.navigation_name(&current, segment) else {
            return path.to_owned();
        };
        match resolver.navigation_partner(&current, &navigation) {
            Ok(partner) => current = partner,
            Err(_) => return path.to_owned(),
        }
        canonical.push(navigation);
    }
    canonical.join("/")
}

/// Drops the first `depth` segments of every reference not bound by a lambda.
fn relativize(expr: &Expr, depth: usize) -> Expr {
    expr.map_references(&mut |path| {
        let segments: Vec<&str> = path.split('/').collect();
        if segments.len() > depth {
            segments[depth..].join("/")
        } else {
            path.to_owned()
        }
    })
}

fn is_lambda_over(expr: &Expr, path: &str) -> bool {
    expr.as_lambda()
        .is_some_and(|(collection, _, _)| collection.eq_ignore_ascii_case(path))
}

fn is_expanded(command: &CommandState, path: &str) -> bool {
    command
        .expands
        .iter()
        .any(|(expand, _)| expand.eq_ignore_ascii_case(path))
}

/// Produces the ordered clause list for `command`.
pub fn format_clauses<A: ProtocolAdapter + ?Sized>(
    adapter: &A,
    command: &CommandState,
    filters: &EntityFilters,
) -> Result<Vec<QueryClause>> {
    let target = resolve_target(adapter, command)?;
    let renderer = Renderer::for_adapter(adapter);
    let root_bucket = target.collection.as_deref().unwrap_or(&target.entity_key);
    let and = Operator::And.precedence();

    let mut parts: Vec<String> = Vec::new();
    let mut text_parts: Vec<String> = Vec::new();
    let mut nested = NestedFilters::new();

    if let Some(fragments) = filters.get(root_bucket) {
        for fragment in fragments {
            parts.push(renderer.render_min(fragment, and)?);
        }
    }
    for (bucket, fragments) in filters.iter().filter(|(bucket, _)| *bucket != root_bucket) {
        let depth = bucket.split('/').count();
        for fragment in fragments {
            if is_lambda_over(fragment, bucket) {
                parts.push(renderer.render_min(fragment, and)?);
                continue;
            }
            let relative = match adapter.dialect() {
                Dialect::Legacy => relativize(fragment, depth),
                Dialect::Modern => fragment.clone(),
            };
            if adapter.dialect() == Dialect::Modern && is_expanded(command, bucket) {
                nested
                    .entry(bucket.clone())
                    .or_default()
                    .push(renderer.render_min(&relative, and)?);
            } else {
                let scoped = relative.map_references(&mut |path| format!("{LAMBDA_VAR}/{path}"));
                parts.push(format!(
                    "{bucket}/any({LAMBDA_VAR}:{})",
                    renderer.render(&scoped)?
                ));
            }
        }
    }
    for (entity, text) in command.filters() {
        if entity.eq_ignore_ascii_case(&target.entity_key) {
            text_parts.push(text.clone());
        } else if adapter.dialect() == Dialect::Modern && is_expanded(command, entity) {
            nested
                .entry(entity.clone())
                .or_default()
                .push(unqualify(text, range_variable(entity)));
        } else {
            parts.push(format!("{entity}/any({}:{text})", range_variable(entity)));
        }
    }

    let mut clauses = Vec::new();
    let total = parts.len() + text_parts.len();
    if total > 0 {
        let mut all = parts;
        all.extend(text_parts.into_iter().map(|text| {
            if total > 1 {
                format!("({text})")
            } else {
                text
            }
        }));
        clauses.push(QueryClause::new("$filter", all.join(" and ")));
    }

    if let Some(search) = &command.search {
        if adapter.dialect() == Dialect::Legacy {
            return Err(Error::unsupported("$search", adapter.version()));
        }
        clauses.push(QueryClause::new("$search", search.clone()));
    }

    let expand = adapter.expand(&command.expands, &nested)?;
    if let Some(value) = expand.expand {
        clauses.push(QueryClause::new("$expand", value));
    }

    let mut select = command.selects.clone();
    for item in expand.select {
        if !select.contains(&item) {
            select.push(item);
        }
    }
    if !select.is_empty() {
        clauses.push(QueryClause::new("$select", select.join(",")));
    }

    if !command.order_by.is_empty() {
        clauses.push(QueryClause::new("$orderby", order_list(&command.order_by)));
    }
    if let Some(skip) = command.skip {
        clauses.push(QueryClause::new("$skip", skip.to_string()));
    }
    if let Some(top) = command.top {
        clauses.push(QueryClause::new("$top", top.to_string()));
    }
    if command.include_count {
        clauses.push(adapter.count_clause());
    }

    custom_options(adapter, command, &mut clauses)?;

    if let Some(call) = &command.invocation {
        if adapter.function_style() == FunctionStyle::QueryParameters {
            for (name, value) in &call.parameters {
                clauses.push(QueryClause::new(name.clone(), literal(adapter, value, true)));
            }
        }
    }
    Ok(clauses)
}

/// Renders `$orderby` items.
pub fn order_list(items: &[OrderBy]) -> String {
    items
        .iter()
        .map(|item| {
            if item.descending {
                format!("{} desc", item.name)
            } else {
                item.name.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn custom_options<A: ProtocolAdapter + ?Sized>(
    adapter: &A,
    command: &CommandState,
    clauses: &mut Vec<QueryClause>,
) -> Result<()> {
    let options = &command.query_options;
    if let Some(text) = &options.text {
        for pair in text.split('&').filter(|pair| !pair.is_empty()) {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            clauses.push(QueryClause::new(name, value));
        }
    }
    if let Some(expr) = &options.expression {
        validate_query_option(expr)?;
        for term in expr.conjuncts() {
            let Expr::Binary {
                op: Operator::Equal,
                left,
                right,
            } = term
            else {
                return Err(CompilationError::InvalidCommand(
                    "custom query options must be 'Name eq value' terms".into(),
                )
                .into());
            };
            let (Some(name), Some(value)) = (left.as_reference(), right.as_value()) else {
                return Err(CompilationError::InvalidCommand(
                    "custom query options must be 'Name eq value' terms".into(),
                )
                .into());
            };
            clauses.push(QueryClause::new(name, literal(adapter, value, true)));
        }
    }
    for (name, value) in &options.pairs {
        clauses.push(QueryClause::new(name.clone(), literal(adapter, value, true)));
    }
    Ok(())
}

fn literal<A: ProtocolAdapter + ?Sized>(adapter: &A, value: &Value, escape: bool) -> String {
    adapter.literals().format(value, escape)
}

/// Resource path of `command`, relative to the service root.
pub fn build_path<A: ProtocolAdapter + ?Sized>(adapter: &A, command: &CommandState) -> Result<String> {
    let resolver = adapter.resolver();
    let mut segments: Vec<String> = Vec::new();
    let mut collection: Option<String> = None;
    for node in command.chain() {
        match &node.segment {
            Some(Segment::Collection(name)) => {
                let canonical = resolver
                    .collection_name(name)
                    .ok_or_else(|| Error::unknown_entity(name))?;
                segments.push(canonical.clone());
                collection = Some(canonical);
            }
            Some(Segment::Navigation(navigation)) => {
                let (name, partner) = match &collection {
                    Some(current) => {
                        let canonical = resolver
                            .navigation_name(current, navigation)
                            .ok_or_else(|| Error::unknown_navigation(current, navigation))?;
                        let partner = resolver.navigation_partner(current, &canonical)?;
                        (canonical, Some(partner))
                    }
                    None => (navigation.clone(), None),
                };
                segments.push(name);
                collection = partner;
            }
            Some(Segment::DerivedType(name)) => segments.push(name.clone()),
            Some(Segment::BatchReference(key)) => {
                let content_id = node
                    .batch
                    .as_ref()
                    .and_then(|batch| batch.content_id(key))
                    .ok_or_else(|| {
                        CompilationError::InvalidCommand(format!("no batch entry for '{key}'"))
                    })?;
                segments.push(format!("${content_id}"));
                collection = None;
            }
            None => {}
        }
        if !node.keys.is_none() {
            let key = key_segment(adapter, collection.as_deref(), &node.keys)?;
            match segments.last_mut() {
                Some(last) => last.push_str(&key),
                None => {
                    return Err(CompilationError::InvalidCommand(
                        "key supplied without an entity set".into(),
                    )
                    .into())
                }
            }
        }
    }

    if let Some(navigation) = &command.link_name {
        let target = match &command.link_expression {
            Some(expr) => {
                let value = expr.as_value().ok_or_else(|| {
                    CompilationError::InvalidCommand("link target must be a key value".into())
                })?;
                Some(format!("({})", literal(adapter, value, true)))
            }
            None => None,
        };
        segments.push(adapter.link_path(navigation, target.as_deref()));
    }
    if let Some(media) = &command.media {
        segments.push(media.clone());
    }
    if command.compute_count {
        segments.push("$count".to_owned());
    }
    if let Some(call) = &command.invocation {
        match (adapter.function_style(), call.kind) {
            (FunctionStyle::PathSegment, InvocationKind::Function) => {
                let parameters = call
                    .parameters
                    .iter()
                    .map(|(name, value)| format!("{name}={}", literal(adapter, value, true)))
                    .collect::<Vec<_>>()
                    .join(",");
                segments.push(format!("{}({parameters})", call.name));
            }
            _ => segments.push(call.name.clone()),
        }
    }
    Ok(segments.join("/"))
}

fn key_segment<A: ProtocolAdapter + ?Sized>(
    adapter: &A,
    collection: Option<&str>,
    keys: &KeyValues,
) -> Result<String> {
    let pairs: Vec<(String, &Value)> = match keys {
        KeyValues::None => return Ok(String::new()),
        KeyValues::Positional(values) if values.len() == 1 => {
            return Ok(format!("({})", literal(adapter, &values[0], true)));
        }
        KeyValues::Positional(values) => {
            let collection = collection.ok_or_else(|| {
                CompilationError::InvalidCommand("composite key needs a known collection".into())
            })?;
            let names = adapter.resolver().key_properties(collection)?;
            if names.len() != values.len() {
                return Err(CompilationError::InvalidCommand(format!(
                    "{collection} has {} key properties, {} values supplied",
                    names.len(),
                    values.len()
                ))
                .into());
            }
            names.into_iter().zip(values.iter()).collect()
        }
        KeyValues::Named(pairs) => pairs.iter().map(|(name, value)| (name.clone(), value)).collect(),
    };
    let rendered = pairs
        .iter()
        .map(|(name, value)| format!("{name}={}", literal(adapter, value, true)))
        .collect::<Vec<_>>()
        .join(",");
    Ok(format!("({rendered})"))
}

/// Picks the HTTP method for `command`.
pub fn select_method<A: ProtocolAdapter + ?Sized>(
    adapter: &A,
    command: &CommandState,
) -> Result<HttpMethod> {
    if let Some(call) = &command.invocation {
        return Ok(match call.kind {
            InvocationKind::Function => HttpMethod::Get,
            InvocationKind::Action => HttpMethod::Post,
        });
    }
    let addressed = !command.keys.is_none()
        || matches!(command.segment, Some(Segment::BatchReference(_)));
    match command.operation {
        Operation::Query => Ok(HttpMethod::Get),
        Operation::Insert => {
            if command.entry.is_none() && command.link_expression.is_none() {
                return Err(CompilationError::InvalidCommand("insert requires a payload".into()).into());
            }
            Ok(HttpMethod::Post)
        }
        Operation::Delete => {
            if !addressed && command.link_name.is_none() {
                return Err(CompilationError::InvalidCommand("delete requires a key".into()).into());
            }
            Ok(HttpMethod::Delete)
        }
        Operation::Update => {
            if !addressed {
                return Err(CompilationError::InvalidCommand("update requires a key".into()).into());
            }
            if adapter.options().update_method == UpdateMethod::Put
                || changes_key(adapter, command)?
            {
                Ok(HttpMethod::Put)
            } else {
                Ok(HttpMethod::Patch)
            }
        }
    }
}

/// True when the update payload assigns a key property a value different
/// from the addressed key.
fn changes_key<A: ProtocolAdapter + ?Sized>(adapter: &A, command: &CommandState) -> Result<bool> {
    let Some(entry) = &command.entry else {
        return Ok(false);
    };
    let current: Vec<(String, Value)> = match &command.keys {
        KeyValues::None => return Ok(false),
        KeyValues::Named(pairs) => pairs.clone(),
        KeyValues::Positional(values) => {
            let target = resolve_target(adapter, command)?;
            let Some(collection) = target.collection else {
                return Ok(false);
            };
            adapter
                .resolver()
                .key_properties(&collection)?
                .into_iter()
                .zip(values.iter().cloned())
                .collect()
        }
    };
    Ok(current.iter().any(|(name, value)| {
        entry
            .iter()
            .find(|(property, _)| property.eq_ignore_ascii_case(name))
            .is_some_and(|(_, new)| new != value)
    }))
}

/// Compiles `command` into a request.
pub fn compile<A: ProtocolAdapter + ?Sized>(adapter: &A, command: &CommandState) -> Result<CompiledRequest> {
    let filters = adapter.analyze(command)?;
    let clauses = adapter.format(command, &filters)?;
    let path = build_path(adapter, command)?;
    let method = select_method(adapter, command)?;
    let renderer = Renderer::for_adapter(adapter);
    let mut entity_filters = BTreeMap::new();
    for (bucket, fragments) in &filters {
        let rendered = fragments
            .iter()
            .map(|fragment| renderer.render(fragment))
            .collect::<Result<Vec<_>>>()?;
        entity_filters.insert(bucket.clone(), rendered);
    }
    let payload = match &command.invocation {
        Some(call) if call.kind == InvocationKind::Action && adapter.function_style() == FunctionStyle::PathSegment => {
            Some(call.parameters.iter().cloned().collect())
        }
        _ => command.entry.clone(),
    };
    debug!(method = %method, path = %path, clauses = clauses.len(), "compiled command");
    Ok(CompiledRequest {
        method,
        path,
        clauses,
        entity_filters,
        payload,
    })
}

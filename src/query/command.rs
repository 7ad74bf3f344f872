//! Accumulated state of one fluent command chain.
//!
//! Every navigation or derived-type step creates a child [`CommandState`]
//! whose parent is a frozen snapshot. A child owns its own copies of the
//! filter maps, so siblings branched from the same parent never observe each
//! other's filters.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::query::{ast::Expr, value::Value};

/// Property values of an entry payload, keyed by property name.
pub type Entry = BTreeMap<String, Value>;

/// Key of the addressed entity.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyValues {
    /// No key; the command addresses a collection.
    #[default]
    None,
    /// Positional key values, in key-property order.
    Positional(Vec<Value>),
    /// Named key values.
    Named(Vec<(String, Value)>),
}

impl KeyValues {
    /// True when no key was supplied.
    pub fn is_none(&self) -> bool {
        matches!(self, KeyValues::None)
    }
}

/// One `$orderby` item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    /// Property path.
    pub name: String,
    /// Sort descending.
    #[serde(default)]
    pub descending: bool,
}

impl OrderBy {
    /// Ascending order on `name`.
    pub fn asc(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            descending: false,
        }
    }

    /// Descending order on `name`.
    pub fn desc(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            descending: true,
        }
    }
}

/// Depth of a recursive expansion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpandLevels {
    /// Fixed number of levels.
    Depth(u32),
    /// Unbounded (`$levels=max`).
    Max,
}

/// Options attached to one expand item.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandOptions {
    /// Recursive expansion depth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub levels: Option<ExpandLevels>,
    /// Nested `$select` items.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub select: Vec<String>,
    /// Nested `$orderby` items.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<OrderBy>,
    /// Expand entity references only (`/$ref`).
    #[serde(default)]
    pub by_ref: bool,
}

impl ExpandOptions {
    /// True when the item renders as a bare path.
    pub fn is_plain(&self) -> bool {
        self.levels.is_none() && self.select.is_empty() && self.order_by.is_empty() && !self.by_ref
    }
}

/// Kind of request the command produces.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Read entities.
    #[default]
    Query,
    /// Create an entity from the payload.
    Insert,
    /// Update the addressed entity with the payload.
    Update,
    /// Delete the addressed entity.
    Delete,
}

/// Whether an invocation is a function or an action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationKind {
    /// Side-effect free, invoked with `GET`.
    Function,
    /// Invoked with `POST`.
    Action,
}

/// Function or action call appended to the resource path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    /// Function or action.
    pub kind: InvocationKind,
    /// Operation name.
    pub name: String,
    /// Parameters in declaration order.
    #[serde(default)]
    pub parameters: Vec<(String, Value)>,
}

/// Free-form custom query options.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Raw text appended verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Conjunction of `name eq value` terms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<Expr>,
    /// Individual name/value pairs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pairs: Vec<(String, Value)>,
}

impl QueryOptions {
    /// True when nothing was supplied.
    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.expression.is_none() && self.pairs.is_empty()
    }
}

/// Entity created earlier in a batch.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchEntry {
    /// Content id assigned to the sub-request.
    pub content_id: u32,
    /// Payload returned for the entity once known.
    pub payload: Option<Entry>,
}

/// Cross-reference map shared by every command of one batch.
///
/// Sub-commands may register and resolve entries concurrently.
#[derive(Clone, Debug, Default)]
pub struct BatchEntries {
    entries: Arc<DashMap<String, BatchEntry>>,
    next_id: Arc<AtomicU32>,
}

impl BatchEntries {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `key`, returning its content id. Registering the same key
    /// again returns the id assigned the first time.
    pub fn register(&self, key: &str) -> u32 {
        self.entries
            .entry(key.to_owned())
            .or_insert_with(|| BatchEntry {
                content_id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
                payload: None,
            })
            .content_id
    }

    /// Records the payload returned for `key`, registering it if needed.
    pub fn resolve(&self, key: &str, payload: Entry) -> u32 {
        let content_id = self.register(key);
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.payload = Some(payload);
        }
        content_id
    }

    /// Content id of `key`, if registered.
    pub fn content_id(&self, key: &str) -> Option<u32> {
        self.entries.get(key).map(|entry| entry.content_id)
    }

    /// Snapshot of the entry registered under `key`.
    pub fn get(&self, key: &str) -> Option<BatchEntry> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Step that created a command from its parent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    /// Root entity collection.
    Collection(String),
    /// Navigation property followed from the parent.
    Navigation(String),
    /// Cast to a derived entity type.
    DerivedType(String),
    /// Entity created earlier in the same batch (`$<content-id>`).
    BatchReference(String),
}

/// In-progress query state.
#[derive(Clone, Debug, Default)]
pub struct CommandState {
    parent: Option<Arc<CommandState>>,
    /// How this node was reached.
    pub segment: Option<Segment>,
    /// Key of the addressed entity.
    pub keys: KeyValues,
    /// Entry payload for inserts and updates.
    pub entry: Option<Entry>,
    /// Request kind.
    pub operation: Operation,
    filters: BTreeMap<String, String>,
    filter_expressions: BTreeMap<String, Expr>,
    /// Free-text `$search` term.
    pub search: Option<String>,
    /// `$skip` count.
    pub skip: Option<u64>,
    /// `$top` count.
    pub top: Option<u64>,
    /// Expand items in call order.
    pub expands: Vec<(String, ExpandOptions)>,
    /// Select items in call order.
    pub selects: Vec<String>,
    /// Order items in call order.
    pub order_by: Vec<OrderBy>,
    /// Address the `$count` segment instead of the entities.
    pub compute_count: bool,
    /// Ask for the total count alongside the results.
    pub include_count: bool,
    /// Navigation whose links are addressed.
    pub link_name: Option<String>,
    /// Target of a link operation.
    pub link_expression: Option<Expr>,
    /// Custom query options.
    pub query_options: QueryOptions,
    /// Function or action call.
    pub invocation: Option<Invocation>,
    /// Named media stream.
    pub media: Option<String>,
    /// Batch the command belongs to.
    pub batch: Option<BatchEntries>,
}

impl CommandState {
    /// Creates a root command over `collection`.
    pub fn for_collection(collection: impl Into<String>) -> Self {
        Self {
            segment: Some(Segment::Collection(collection.into())),
            ..Self::default()
        }
    }

    /// Parent snapshot, if any.
    pub fn parent(&self) -> Option<&CommandState> {
        self.parent.as_deref()
    }

    /// Creates a child whose parent is a snapshot of `self`.
    ///
    /// The child starts with its own copies of both filter maps and shares the
    /// batch map.
    pub fn branch(&self) -> CommandState {
        CommandState {
            parent: Some(Arc::new(self.clone())),
            filters: self.filters.clone(),
            filter_expressions: self.filter_expressions.clone(),
            batch: self.batch.clone(),
            ..CommandState::default()
        }
    }

    /// Chain from the root to `self`.
    pub fn chain(&self) -> Vec<&CommandState> {
        let mut chain = vec![self];
        let mut current = self;
        while let Some(parent) = current.parent() {
            chain.push(parent);
            current = parent;
        }
        chain.reverse();
        chain
    }

    /// Name of the entity set the command currently addresses: the closest
    /// collection, navigation or batch reference in the chain.
    pub fn entity_name(&self) -> Option<&str> {
        self.chain().into_iter().rev().find_map(|node| match &node.segment {
            Some(Segment::Collection(name))
            | Some(Segment::Navigation(name))
            | Some(Segment::BatchReference(name)) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Derived type applied to the current entity set, if any.
    pub fn derived_type(&self) -> Option<&str> {
        for node in self.chain().into_iter().rev() {
            match &node.segment {
                Some(Segment::DerivedType(name)) => return Some(name),
                None => continue,
                Some(_) => return None,
            }
        }
        None
    }

    /// ANDs `expr` into the expression filter of `entity`.
    pub fn add_filter_expression(&mut self, entity: impl Into<String>, expr: Expr) {
        let entity = entity.into();
        let merged = match self.filter_expressions.remove(&entity) {
            Some(existing) => existing.and(expr),
            None => expr,
        };
        self.filter_expressions.insert(entity, merged);
    }

    /// Expression filter stored for `entity`.
    pub fn filter_expression(&self, entity: &str) -> Option<&Expr> {
        self.filter_expressions.get(entity)
    }

    /// All expression filters, keyed by entity path.
    pub fn filter_expressions(&self) -> &BTreeMap<String, Expr> {
        &self.filter_expressions
    }

    /// Replaces the text filter of `entity`.
    ///
    /// For a related entity, properties are named through the navigation, e.g.
    /// `OrderDetails/Quantity gt 5` for the entity path `OrderDetails`.
    pub fn set_filter(&mut self, entity: impl Into<String>, text: impl Into<String>) {
        self.filters.insert(entity.into(), text.into());
    }

    /// Text filter stored for `entity`.
    pub fn filter(&self, entity: &str) -> Option<&str> {
        self.filters.get(entity).map(String::as_str)
    }

    /// All text filters, keyed by entity path.
    pub fn filters(&self) -> &BTreeMap<String, String> {
        &self.filters
    }

    /// True when any filter is stored for the current entity set.
    pub fn has_root_filter(&self) -> bool {
        self.entity_name().is_some_and(|name| {
            self.filters.contains_key(name) || self.filter_expressions.contains_key(name)
        })
    }
}

//! Fluent command builder.

use crate::query::{
    ast::Expr,
    command::{
        BatchEntries, CommandState, Entry, ExpandOptions, Invocation, InvocationKind, KeyValues,
        Operation, OrderBy, Segment,
    },
    value::Value,
};
use crate::types::{CompilationError, Error, Result};

/// Fluent front end over [`CommandState`].
///
/// Misuse is recorded rather than reported immediately; the first error wins
/// and every later call becomes a no-op until [`CommandBuilder::build`]
/// surfaces it.
#[derive(Debug, Default)]
pub struct CommandBuilder {
    state: CommandState,
    error: Option<Error>,
}

impl CommandBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a command over `name`.
    pub fn collection(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.ready() || !self.non_empty("collection", &name) {
            return self;
        }
        if self.state.segment.is_some() {
            return self.fail("collection already chosen for this command");
        }
        self.state.segment = Some(Segment::Collection(name));
        self
    }

    /// Addresses a single entity by positional key values.
    pub fn key<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        if !self.ready() || !self.require_entity("key") {
            return self;
        }
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            return self.fail("key requires at least one value");
        }
        self.state.keys = KeyValues::Positional(values);
        self
    }

    /// Addresses a single entity by named key values.
    pub fn named_keys<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        if !self.ready() || !self.require_entity("named_keys") {
            return self;
        }
        let pairs: Vec<(String, Value)> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        if pairs.is_empty() || pairs.iter().any(|(k, _)| k.is_empty()) {
            return self.fail("named_keys requires non-empty key names");
        }
        self.state.keys = KeyValues::Named(pairs);
        self
    }

    /// ANDs `expr` into the filter of the current entity set.
    pub fn filter(mut self, expr: Expr) -> Self {
        if !self.ready() || !self.require_entity("filter") {
            return self;
        }
        if let Some(entity) = self.state.entity_name().map(str::to_owned) {
            self.state.add_filter_expression(entity, expr);
        }
        self
    }

    /// ANDs `expr` into the filter of a related entity path. References in
    /// `expr` are relative to that entity.
    pub fn filter_on(mut self, entity: impl Into<String>, expr: Expr) -> Self {
        let entity = entity.into();
        if !self.ready() || !self.require_entity("filter_on") || !self.non_empty("filter_on", &entity)
        {
            return self;
        }
        self.state.add_filter_expression(entity, expr);
        self
    }

    /// ANDs a raw filter text into the filter of the current entity set.
    pub fn filter_text(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        if !self.ready() || !self.require_entity("filter_text") || !self.non_empty("filter_text", &text)
        {
            return self;
        }
        if let Some(entity) = self.state.entity_name().map(str::to_owned) {
            let combined = match self.state.filter(&entity) {
                Some(existing) => format!("({existing}) and ({text})"),
                None => text,
            };
            self.state.set_filter(entity, combined);
        }
        self
    }

    /// Sets the free-text `$search` term.
    pub fn search(mut self, term: impl Into<String>) -> Self {
        let term = term.into();
        if !self.ready() || !self.require_entity("search") || !self.non_empty("search", &term) {
            return self;
        }
        self.state.search = Some(term);
        self
    }

    /// Skips the first `count` results.
    pub fn skip(mut self, count: u64) -> Self {
        if self.ready() && self.require_entity("skip") {
            self.state.skip = Some(count);
        }
        self
    }

    /// Limits the result to `count` entities.
    pub fn top(mut self, count: u64) -> Self {
        if self.ready() && self.require_entity("top") {
            self.state.top = Some(count);
        }
        self
    }

    /// Expands a navigation path.
    pub fn expand(self, path: impl Into<String>) -> Self {
        self.expand_with(path, ExpandOptions::default())
    }

    /// Expands a navigation path with nested options.
    pub fn expand_with(mut self, path: impl Into<String>, options: ExpandOptions) -> Self {
        let path = path.into();
        if !self.ready() || !self.require_entity("expand") || !self.non_empty("expand", &path) {
            return self;
        }
        match self
            .state
            .expands
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&path))
        {
            Some((_, existing)) => *existing = options,
            None => self.state.expands.push((path, options)),
        }
        self
    }

    /// Adds properties to `$select`.
    pub fn select<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !self.ready() || !self.require_entity("select") {
            return self;
        }
        for item in items {
            let item = item.into();
            if !self.non_empty("select", &item) {
                return self;
            }
            if !self.state.selects.contains(&item) {
                self.state.selects.push(item);
            }
        }
        self
    }

    /// Orders ascending by `name`.
    pub fn order_by(self, name: impl Into<String>) -> Self {
        self.push_order(OrderBy::asc(name))
    }

    /// Orders descending by `name`.
    pub fn order_by_descending(self, name: impl Into<String>) -> Self {
        self.push_order(OrderBy::desc(name))
    }

    fn push_order(mut self, order: OrderBy) -> Self {
        if !self.ready() || !self.require_entity("order_by") || !self.non_empty("order_by", &order.name) {
            return self;
        }
        self.state.order_by.push(order);
        self
    }

    /// Addresses the `$count` of the current entity set.
    pub fn count(mut self) -> Self {
        if self.ready() && self.require_entity("count") {
            self.state.compute_count = true;
        }
        self
    }

    /// Requests the total count alongside the results.
    pub fn include_count(mut self) -> Self {
        if self.ready() && self.require_entity("include_count") {
            self.state.include_count = true;
        }
        self
    }

    /// Follows a navigation property into a child command.
    pub fn navigate(mut self, navigation: impl Into<String>) -> Self {
        let navigation = navigation.into();
        if !self.ready()
            || !self.require_entity("navigate")
            || !self.non_empty("navigate", &navigation)
        {
            return self;
        }
        if self.state.has_root_filter() {
            return self.fail("filters apply to the last segment; navigate before filtering");
        }
        let mut child = self.state.branch();
        child.segment = Some(Segment::Navigation(navigation));
        self.state = child;
        self
    }

    /// Casts the current entity set to a derived type.
    pub fn as_type(mut self, type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        if !self.ready() || !self.require_entity("as_type") || !self.non_empty("as_type", &type_name) {
            return self;
        }
        let mut child = self.state.branch();
        child.segment = Some(Segment::DerivedType(type_name));
        self.state = child;
        self
    }

    /// Invokes a function with `parameters`.
    pub fn function<I, K, V>(self, name: impl Into<String>, parameters: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.invoke(InvocationKind::Function, name.into(), parameters)
    }

    /// Invokes an action with `parameters`.
    pub fn action<I, K, V>(self, name: impl Into<String>, parameters: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.invoke(InvocationKind::Action, name.into(), parameters)
    }

    fn invoke<I, K, V>(mut self, kind: InvocationKind, name: String, parameters: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        if !self.ready() || !self.non_empty("function", &name) {
            return self;
        }
        if self.state.invocation.is_some() {
            return self.fail("only one function or action per command");
        }
        self.state.invocation = Some(Invocation {
            kind,
            name,
            parameters: parameters
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        });
        self
    }

    /// Sets the entry payload.
    pub fn set(mut self, entry: Entry) -> Self {
        if self.ready() && self.require_entity("set") {
            self.state.entry = Some(entry);
        }
        self
    }

    /// Inserts `entry` into the current entity set.
    pub fn insert(self, entry: Entry) -> Self {
        self.set(entry).operation(Operation::Insert)
    }

    /// Updates the addressed entity with `entry`.
    pub fn update(self, entry: Entry) -> Self {
        self.set(entry).operation(Operation::Update)
    }

    /// Deletes the addressed entity.
    pub fn delete(self) -> Self {
        self.operation(Operation::Delete)
    }

    fn operation(mut self, operation: Operation) -> Self {
        if self.ready() && self.require_entity("operation") {
            self.state.operation = operation;
        }
        self
    }

    /// Addresses the links of a navigation property.
    pub fn link(mut self, navigation: impl Into<String>) -> Self {
        let navigation = navigation.into();
        if !self.ready() || !self.require_entity("link") || !self.non_empty("link", &navigation) {
            return self;
        }
        self.state.link_name = Some(navigation);
        self
    }

    /// Addresses the link from a navigation property to `target`.
    pub fn link_to(self, navigation: impl Into<String>, target: Expr) -> Self {
        let mut builder = self.link(navigation);
        if builder.ready() {
            builder.state.link_expression = Some(target);
        }
        builder
    }

    /// Addresses a named media stream.
    pub fn media(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.ready() || !self.require_entity("media") || !self.non_empty("media", &name) {
            return self;
        }
        self.state.media = Some(name);
        self
    }

    /// Appends raw custom query options.
    pub fn query_options(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        if !self.ready() || !self.non_empty("query_options", &text) {
            return self;
        }
        self.state.query_options.text = Some(match self.state.query_options.text.take() {
            Some(existing) => format!("{existing}&{text}"),
            None => text,
        });
        self
    }

    /// Adds custom query options written as `Name eq value and ...`.
    pub fn query_options_expr(mut self, expr: Expr) -> Self {
        if !self.ready() {
            return self;
        }
        self.state.query_options.expression = Some(match self.state.query_options.expression.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    /// Adds one custom query option.
    pub fn query_option(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        if !self.ready() || !self.non_empty("query_option", &name) {
            return self;
        }
        self.state.query_options.pairs.push((name, value.into()));
        self
    }

    /// Attaches the command to a batch.
    pub fn in_batch(mut self, batch: &BatchEntries) -> Self {
        if self.ready() {
            self.state.batch = Some(batch.clone());
        }
        self
    }

    /// Addresses an entity created earlier in the same batch.
    pub fn batch_ref(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        if !self.ready() || !self.non_empty("batch_ref", &key) {
            return self;
        }
        let Some(batch) = self.state.batch.as_ref() else {
            return self.fail("batch_ref requires in_batch");
        };
        if batch.content_id(&key).is_none() {
            return self.fail(format!("no batch entry registered for '{key}'"));
        }
        if self.state.segment.is_some() {
            return self.fail("batch_ref must start the command");
        }
        self.state.segment = Some(Segment::BatchReference(key));
        self
    }

    /// Returns the accumulated state or the first recorded error.
    pub fn build(self) -> Result<CommandState> {
        match self.error {
            Some(err) => Err(err),
            None if self.state.segment.is_none() && self.state.invocation.is_none() => {
                Err(CompilationError::MissingCollection.into())
            }
            None => Ok(self.state),
        }
    }

    fn ready(&self) -> bool {
        self.error.is_none()
    }

    fn require_entity(&mut self, operation: &str) -> bool {
        if self.state.segment.is_some() {
            return true;
        }
        self.error = Some(
            CompilationError::InvalidCommand(format!(
                "{operation} requires a collection to be chosen first"
            ))
            .into(),
        );
        false
    }

    fn non_empty(&mut self, operation: &str, value: &str) -> bool {
        if !value.trim().is_empty() {
            return true;
        }
        self.error = Some(Error::Invalid(format!("{operation} requires a non-empty value")));
        false
    }

    fn fail(mut self, message: impl Into<String>) -> Self {
        self.error = Some(CompilationError::InvalidCommand(message.into()).into());
        self
    }
}

//! Navigation lookups over the metadata fact base.
//!
//! The analyzer and the formatters never touch raw metadata documents. They
//! ask a [`NavigationResolver`] whether a property is a navigation, whether it
//! is collection-valued and where it leads. Answers are pure functions of the
//! fact base, so [`CachedResolver`] can memoize them per endpoint.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::types::{Error, ProtocolError, Result};

/// Name-to-navigation resolution consumed by the analyzer and formatters.
pub trait NavigationResolver: Send + Sync {
    /// Returns the canonical name of an entity collection, if declared.
    fn collection_name(&self, name: &str) -> Option<String>;
    /// Returns the canonical navigation name declared on `entity`, if any.
    fn navigation_name(&self, entity: &str, property: &str) -> Option<String>;
    /// Whether the navigation on `entity` is collection-valued.
    fn is_collection_navigation(&self, entity: &str, navigation: &str) -> Result<bool>;
    /// Collection the navigation on `entity` leads to.
    fn navigation_partner(&self, entity: &str, navigation: &str) -> Result<String>;
    /// Namespace-qualified entity type name of the collection.
    fn entity_type(&self, entity: &str) -> Result<String>;
    /// Key property names of the collection, in declaration order.
    fn key_properties(&self, entity: &str) -> Result<Vec<String>>;

    /// Whether `property` is a navigation declared on `entity`.
    fn has_navigation(&self, entity: &str, property: &str) -> bool {
        self.navigation_name(entity, property).is_some()
    }

    /// Whether the collection is declared.
    fn has_collection(&self, name: &str) -> bool {
        self.collection_name(name).is_some()
    }
}

/// Navigation property as declared in the fact base.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationProperty {
    /// Property name.
    pub name: String,
    /// Whether the navigation is one-to-many / many-to-many.
    #[serde(default)]
    pub collection: bool,
    /// Entity collection the navigation leads to.
    pub target: String,
}

/// Entity collection and its outgoing navigations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCollection {
    /// Entity set name, e.g. `Products`.
    pub name: String,
    /// Namespace-qualified entity type, e.g. `NorthwindModel.Product`.
    pub entity_type: String,
    /// Key property names.
    #[serde(default)]
    pub key: Vec<String>,
    /// Navigation properties.
    #[serde(default)]
    pub navigations: Vec<NavigationProperty>,
}

impl EntityCollection {
    fn navigation(&self, property: &str) -> Option<&NavigationProperty> {
        find_by_name(&self.navigations, property, |nav| &nav.name)
    }
}

/// In-memory metadata fact base.
///
/// This is also the JSON shape accepted as a metadata document by the default
/// model loader and by the CLI.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityModel {
    /// Declared protocol version, e.g. `4.0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Entity collections.
    #[serde(default)]
    pub collections: Vec<EntityCollection>,
}

impl EntityModel {
    /// Creates an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the declared protocol version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Registers a collection with its entity type and key.
    pub fn with_collection<I, S>(
        mut self,
        name: impl Into<String>,
        entity_type: impl Into<String>,
        key: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collections.push(EntityCollection {
            name: name.into(),
            entity_type: entity_type.into(),
            key: key.into_iter().map(Into::into).collect(),
            navigations: Vec::new(),
        });
        self
    }

    /// Registers a single-valued navigation from `entity` to `target`.
    pub fn with_reference(self, entity: &str, name: impl Into<String>, target: &str) -> Self {
        self.with_navigation(entity, name, target, false)
    }

    /// Registers a collection-valued navigation from `entity` to `target`.
    pub fn with_many(self, entity: &str, name: impl Into<String>, target: &str) -> Self {
        self.with_navigation(entity, name, target, true)
    }

    fn with_navigation(
        mut self,
        entity: &str,
        name: impl Into<String>,
        target: &str,
        collection: bool,
    ) -> Self {
        if let Some(owner) = self.collections.iter_mut().find(|c| c.name == entity) {
            owner.navigations.push(NavigationProperty {
                name: name.into(),
                collection,
                target: target.to_owned(),
            });
        }
        self
    }

    /// Parses the JSON encoding of the fact base.
    pub fn from_json(document: &str) -> Result<Self> {
        serde_json::from_str(document)
            .map_err(|err| ProtocolError::MalformedMetadata(err.to_string()).into())
    }

    /// Serializes the fact base to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| ProtocolError::MalformedMetadata(err.to_string()).into())
    }

    fn collection(&self, name: &str) -> Option<&EntityCollection> {
        find_by_name(&self.collections, name, |c| &c.name)
    }

    fn require(&self, name: &str) -> Result<&EntityCollection> {
        self.collection(name).ok_or_else(|| Error::unknown_entity(name))
    }

    fn require_navigation(&self, entity: &str, navigation: &str) -> Result<&NavigationProperty> {
        self.require(entity)?
            .navigation(navigation)
            .ok_or_else(|| Error::unknown_navigation(entity, navigation))
    }
}

/// Exact-case match first, then a case-insensitive one.
fn find_by_name<'a, T>(items: &'a [T], name: &str, key: impl Fn(&T) -> &String) -> Option<&'a T> {
    items
        .iter()
        .find(|item| key(item) == name)
        .or_else(|| items.iter().find(|item| key(item).eq_ignore_ascii_case(name)))
}

impl NavigationResolver for EntityModel {
    fn collection_name(&self, name: &str) -> Option<String> {
        self.collection(name).map(|c| c.name.clone())
    }

    fn navigation_name(&self, entity: &str, property: &str) -> Option<String> {
        self.collection(entity)?
            .navigation(property)
            .map(|nav| nav.name.clone())
    }

    fn is_collection_navigation(&self, entity: &str, navigation: &str) -> Result<bool> {
        Ok(self.require_navigation(entity, navigation)?.collection)
    }

    fn navigation_partner(&self, entity: &str, navigation: &str) -> Result<String> {
        let target = &self.require_navigation(entity, navigation)?.target;
        self.collection_name(target)
            .ok_or_else(|| Error::unknown_navigation(entity, navigation))
    }

    fn entity_type(&self, entity: &str) -> Result<String> {
        Ok(self.require(entity)?.entity_type.clone())
    }

    fn key_properties(&self, entity: &str) -> Result<Vec<String>> {
        Ok(self.require(entity)?.key.clone())
    }
}

#[derive(Clone, Debug)]
struct NavigationFact {
    name: String,
    collection: bool,
    partner: String,
}

/// Memoizing wrapper around another resolver.
///
/// Navigation answers are cached per `(entity, property)` pair. The wrapper is
/// handed out per endpoint by [`ResolverRegistry`] and dropped when the
/// metadata cache is cleared.
pub struct CachedResolver {
    inner: Arc<dyn NavigationResolver>,
    navigations: DashMap<(String, String), Option<NavigationFact>>,
}

impl CachedResolver {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn NavigationResolver>) -> Self {
        Self {
            inner,
            navigations: DashMap::new(),
        }
    }

    /// Number of memoized navigation lookups.
    pub fn cached_lookups(&self) -> usize {
        self.navigations.len()
    }

    fn fact(&self, entity: &str, property: &str) -> Result<Option<NavigationFact>> {
        let key = (entity.to_owned(), property.to_owned());
        if let Some(fact) = self.navigations.get(&key) {
            return Ok(fact.clone());
        }
        let fact = match self.inner.navigation_name(entity, property) {
            Some(name) => Some(NavigationFact {
                collection: self.inner.is_collection_navigation(entity, &name)?,
                partner: self.inner.navigation_partner(entity, &name)?,
                name,
            }),
            None => None,
        };
        self.navigations.insert(key, fact.clone());
        Ok(fact)
    }

    fn require(&self, entity: &str, property: &str) -> Result<NavigationFact> {
        self.fact(entity, property)?
            .ok_or_else(|| Error::unknown_navigation(entity, property))
    }
}

impl NavigationResolver for CachedResolver {
    fn collection_name(&self, name: &str) -> Option<String> {
        self.inner.collection_name(name)
    }

    fn navigation_name(&self, entity: &str, property: &str) -> Option<String> {
        self.fact(entity, property).ok().flatten().map(|fact| fact.name)
    }

    fn is_collection_navigation(&self, entity: &str, navigation: &str) -> Result<bool> {
        Ok(self.require(entity, navigation)?.collection)
    }

    fn navigation_partner(&self, entity: &str, navigation: &str) -> Result<String> {
        Ok(self.require(entity, navigation)?.partner)
    }

    fn entity_type(&self, entity: &str) -> Result<String> {
        self.inner.entity_type(entity)
    }

    fn key_properties(&self, entity: &str) -> Result<Vec<String>> {
        self.inner.key_properties(entity)
    }
}

/// Per-endpoint registry of memoizing resolvers.
#[derive(Default)]
pub struct ResolverRegistry {
    resolvers: DashMap<String, Arc<CachedResolver>>,
}

impl ResolverRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the resolver registered for `key`, wrapping `base` on first use.
    pub fn resolver_for<F>(&self, key: &str, base: F) -> Arc<CachedResolver>
    where
        F: FnOnce() -> Arc<dyn NavigationResolver>,
    {
        self.resolvers
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(CachedResolver::new(base())))
            .clone()
    }

    /// Drops the resolver for one endpoint.
    pub fn remove(&self, key: &str) {
        self.resolvers.remove(key);
    }

    /// Drops every registered resolver.
    pub fn clear(&self) {
        self.resolvers.clear();
    }

    /// Number of registered endpoints.
    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

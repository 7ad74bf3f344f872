#![forbid(unsafe_code)]

//! Query model and filter analysis.
//!
//! Commands are accumulated through [`CommandBuilder`] into a
//! [`CommandState`] chain. Filter expressions are kept as [`Expr`] trees
//! until compilation, when the analyzer partitions them into per-entity
//! fragments using the navigation facts of the bound model.

/// Splits filter expressions into per-entity fragments.
///
/// Walks boolean trees, resolves navigation references and attaches every
/// fragment to exactly one entity bucket.
pub mod analyze;

/// Expression trees for filters, query options and lambda predicates.
pub mod ast;

/// Fluent command construction with deferred error reporting.
pub mod builder;

/// Accumulated command inputs and the parent/child command chain.
pub mod command;

/// Navigation facts of the service model.
pub mod metadata;

/// Typed literal values.
pub mod value;

pub use analyze::{EntityFilters, ExpressionAnalyzer, FilterOptions};
pub use ast::{Expr, Operator};
pub use builder::CommandBuilder;
pub use command::{BatchEntries, CommandState, Entry, ExpandOptions, OrderBy};
pub use metadata::{CachedResolver, EntityModel, NavigationResolver};
pub use value::Value;

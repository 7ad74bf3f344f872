#![forbid(unsafe_code)]

//! Filter partitioning.
//!
//! A boolean filter written against a root collection may reach into related
//! collections through navigation properties. Before formatting, the analyzer
//! splits the filter into fragments and attaches each one to the entity it
//! must be evaluated against: the root collection itself, or the path of the
//! first collection-valued navigation the fragment crosses.
//!
//! Top-level conjunctions are split so that each side lands in its own bucket.
//! Every other node keeps its children together and goes wherever the union of
//! its children's targets points. A union with zero or several targets falls
//! back to the root bucket.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{trace, warn};

use crate::protocol::Dialect;
use crate::query::{
    ast::{Expr, Operator},
    metadata::NavigationResolver,
};
use crate::types::{CompilationError, Error, ResolutionError, Result};

/// Convenience alias for analyzer results.
pub type AnalyzeResult<T> = Result<T>;

/// Filter fragments keyed by entity path, in a stable order.
pub type EntityFilters = BTreeMap<String, Vec<Expr>>;

type Targets = BTreeSet<String>;

/// Options controlling one analysis run.
#[derive(Clone, Copy, Debug)]
pub struct FilterOptions {
    /// Target dialect; decides whether nested references are truncated.
    pub dialect: Dialect,
    /// Restricts operators to `eq` / `and` for custom query options.
    pub query_option: bool,
    /// Reject fragments targeting several entities instead of falling back.
    pub strict_targets: bool,
}

impl FilterOptions {
    /// Default options for `dialect`.
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            query_option: false,
            strict_targets: false,
        }
    }
}

/// Partitions filter expressions using a navigation resolver.
pub struct ExpressionAnalyzer<'r> {
    resolver: &'r dyn NavigationResolver,
    options: FilterOptions,
}

impl<'r> ExpressionAnalyzer<'r> {
    /// Creates an analyzer for `dialect`.
    pub fn new(resolver: &'r dyn NavigationResolver, dialect: Dialect) -> Self {
        Self::with_options(resolver, FilterOptions::new(dialect))
    }

    /// Creates an analyzer with explicit options.
    pub fn with_options(resolver: &'r dyn NavigationResolver, options: FilterOptions) -> Self {
        Self { resolver, options }
    }

    /// Switches to the restricted custom-query-option context.
    pub fn query_option_context(mut self) -> Self {
        self.options.query_option = true;
        self
    }

    /// Enables or disables strict target checking.
    pub fn strict_targets(mut self, strict: bool) -> Self {
        self.options.strict_targets = strict;
        self
    }

    /// Splits `expr` into per-entity fragments relative to `root`.
    pub fn process_filter(&self, expr: &Expr, root: &str) -> AnalyzeResult<EntityFilters> {
        let root = self
            .resolver
            .collection_name(root)
            .ok_or_else(|| Error::unknown_entity(root))?;
        let mut walk = Walk {
            resolver: self.resolver,
            options: self.options,
            root: &root,
            scopes: Vec::new(),
            filters: EntityFilters::new(),
        };
        walk.process(expr, true)?;
        trace!(
            root = %root,
            buckets = walk.filters.len(),
            "partitioned filter expression"
        );
        Ok(walk.filters)
    }

    /// Resolves `path` to its filter entity and the reference the fragment
    /// should keep.
    pub fn entity_path(&self, path: &str, root: &str) -> AnalyzeResult<(String, String)> {
        let root = self
            .resolver
            .collection_name(root)
            .ok_or_else(|| Error::unknown_entity(root))?;
        let walk = Walk {
            resolver: self.resolver,
            options: self.options,
            root: &root,
            scopes: Vec::new(),
            filters: EntityFilters::new(),
        };
        walk.reference_target(path)
            .map(|(target, rewritten)| (target.unwrap_or_else(|| root.clone()), rewritten))
    }
}

/// Runs a default analysis of `expr` against `root`.
pub fn process_filter(
    expr: &Expr,
    root: &str,
    resolver: &dyn NavigationResolver,
    dialect: Dialect,
) -> AnalyzeResult<EntityFilters> {
    ExpressionAnalyzer::new(resolver, dialect).process_filter(expr, root)
}

/// Checks that a custom query option expression only uses `and` / `eq`.
pub fn validate_query_option(expr: &Expr) -> AnalyzeResult<()> {
    match expr.operator() {
        Operator::Default | Operator::And | Operator::Equal => {}
        other => {
            return Err(CompilationError::InvalidQueryOptionOperator {
                operator: other.keyword(),
            }
            .into())
        }
    }
    match expr {
        Expr::Binary { left, right, .. } => {
            validate_query_option(left)?;
            validate_query_option(right)
        }
        Expr::Unary { operand, .. } => validate_query_option(operand),
        Expr::Conversion { inner, .. } => validate_query_option(inner),
        Expr::Function {
            caller, arguments, ..
        } => {
            if let Some(caller) = caller {
                validate_query_option(caller)?;
            }
            arguments.iter().try_for_each(validate_query_option)
        }
        Expr::Value { .. } | Expr::Reference { .. } => Ok(()),
    }
}

struct Walk<'a> {
    resolver: &'a dyn NavigationResolver,
    options: FilterOptions,
    root: &'a str,
    /// Range variables of the enclosing lambdas.
    scopes: Vec<String>,
    filters: EntityFilters,
}

impl Walk<'_> {
    /// Returns the rewritten node and the entities it targets. When `is_base`
    /// is set the node is a top-level fragment and gets attached here.
    fn process(&mut self, expr: &Expr, is_base: bool) -> AnalyzeResult<(Expr, Targets)> {
        self.check_operator(expr)?;
        let (rewritten, targets) = match expr {
            Expr::Value { .. } => (expr.clone(), Targets::new()),
            Expr::Reference { path } => {
                let (target, rewritten) = self.reference_target(path)?;
                (Expr::reference(rewritten), target.into_iter().collect())
            }
            Expr::Function {
                caller,
                name,
                arguments,
            } => {
                let lambda_var = expr.as_lambda().map(|(_, var, _)| var.to_owned());
                self.process_call(caller.as_deref(), name, arguments, lambda_var)?
            }
            Expr::Conversion { target, inner } => match inner.as_ref() {
                Expr::Value { value } => {
                    let coerced = match value.try_convert(*target) {
                        Some(converted) => Expr::value(converted),
                        None => Expr::value(value.to_underlying()).convert(*target),
                    };
                    (coerced, Targets::new())
                }
                other => {
                    let (inner, targets) = self.process(other, false)?;
                    (inner.convert(*target), targets)
                }
            },
            Expr::Unary { op, operand } => {
                let (operand, targets) = self.process(operand, false)?;
                (Expr::unary(*op, operand), targets)
            }
            Expr::Binary {
                op: Operator::And,
                left,
                right,
            } if is_base => {
                self.process(left, true)?;
                self.process(right, true)?;
                return Ok((expr.clone(), Targets::new()));
            }
            Expr::Binary { op, left, right } => {
                let (left, mut targets) = self.process(left, false)?;
                let (right, right_targets) = self.process(right, false)?;
                targets.extend(right_targets);
                (Expr::binary(*op, left, right), targets)
            }
        };
        if is_base {
            self.attach(expr, rewritten.clone(), &targets)?;
        }
        Ok((rewritten, targets))
    }

    fn process_call(
        &mut self,
        caller: Option<&Expr>,
        name: &str,
        arguments: &[Expr],
        lambda_var: Option<String>,
    ) -> AnalyzeResult<(Expr, Targets)> {
        let mut targets = Targets::new();
        let caller = match caller {
            Some(caller) => {
                let (caller, caller_targets) = self.process(caller, false)?;
                targets.extend(caller_targets);
                Some(Arc::new(caller))
            }
            None => None,
        };
        if let Some(var) = &lambda_var {
            self.scopes.push(var.clone());
        }
        let mut rewritten_args = Vec::with_capacity(arguments.len());
        let mut result = Ok(());
        for (idx, argument) in arguments.iter().enumerate() {
            // The range variable itself is a binding, not a reference.
            if lambda_var.is_some() && idx == 0 {
                rewritten_args.push(argument.clone());
                continue;
            }
            match self.process(argument, false) {
                Ok((argument, arg_targets)) => {
                    targets.extend(arg_targets);
                    rewritten_args.push(argument);
                }
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        if lambda_var.is_some() {
            self.scopes.pop();
        }
        result?;
        Ok((
            Expr::Function {
                caller,
                name: name.to_owned(),
                arguments: rewritten_args,
            },
            targets,
        ))
    }

    fn attach(&mut self, original: &Expr, rewritten: Expr, targets: &Targets) -> AnalyzeResult<()> {
        let (entity, fragment) = match targets.len() {
            1 => {
                let entity = targets.iter().next().cloned().unwrap_or_default();
                (entity, rewritten)
            }
            0 => (self.root.to_owned(), rewritten),
            _ => {
                if self.options.strict_targets {
                    return Err(ResolutionError::AmbiguousFilterTarget {
                        entities: targets.iter().cloned().collect(),
                    }
                    .into());
                }
                warn!(
                    root = %self.root,
                    targets = ?targets,
                    "filter fragment targets several entities; attaching to root"
                );
                (self.root.to_owned(), original.clone())
            }
        };
        self.filters.entry(entity).or_default().push(fragment);
        Ok(())
    }

    fn check_operator(&self, expr: &Expr) -> AnalyzeResult<()> {
        if !self.options.query_option {
            return Ok(());
        }
        match expr.operator() {
            Operator::Default | Operator::And | Operator::Equal => Ok(()),
            other => Err(CompilationError::InvalidQueryOptionOperator {
                operator: other.keyword(),
            }
            .into()),
        }
    }

    /// Walks `path` hop by hop and stops at the first collection-valued
    /// navigation. Returns the filter entity (`None` for lambda-scoped
    /// references) and the reference to keep in the fragment.
    fn reference_target(&self, path: &str) -> AnalyzeResult<(Option<String>, String)> {
        let segments: SmallVec<[&str; 4]> = path.split('/').collect();
        if self.scopes.iter().any(|scope| scope == segments[0]) {
            return Ok((None, path.to_owned()));
        }
        let mut current = self.root.to_owned();
        let mut prefix: SmallVec<[String; 4]> = SmallVec::new();
        for (idx, segment) in segments.iter().enumerate() {
            let Some(navigation) = self.resolver.navigation_name(&current, segment) else {
                break;
            };
            if self
                .resolver
                .is_collection_navigation(&current, &navigation)?
            {
                prefix.push(navigation);
                let suffix = &segments[idx + 1..];
                let rewritten = if self.options.dialect == Dialect::Modern && !suffix.is_empty() {
                    suffix.join("/")
                } else {
                    path.to_owned()
                };
                return Ok((Some(prefix.join("/")), rewritten));
            }
            current = self.resolver.navigation_partner(&current, &navigation)?;
            prefix.push(navigation);
        }
        Ok((Some(self.root.to_owned()), path.to_owned()))
    }
}

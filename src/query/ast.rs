//! Immutable expression tree consumed by the analyzer and the formatters.
//!
//! Trees are built by callers (or deserialized from JSON) and never mutated
//! afterwards. Children sit behind `Arc` so cloning a filter to branch a
//! command is cheap. Rewrites performed during analysis always build new
//! nodes.

use std::fmt;
use std::ops::{BitAnd, BitOr, Not};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::query::value::{Value, ValueType};

/// Operator attached to an expression node.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Operator {
    /// Leaf node without an operator.
    Default,
    /// Logical conjunction.
    And,
    /// Logical disjunction.
    Or,
    /// `eq`
    Equal,
    /// `ne`
    NotEqual,
    /// `gt`
    GreaterThan,
    /// `ge`
    GreaterThanOrEqual,
    /// `lt`
    LessThan,
    /// `le`
    LessThanOrEqual,
    /// `add`
    Add,
    /// `sub`
    Subtract,
    /// `mul`
    Multiply,
    /// `div`
    Divide,
    /// `mod`
    Modulo,
    /// `has` (enum flags, OData 4 only).
    Has,
    /// Logical negation.
    Not,
    /// Arithmetic negation.
    Negate,
}

impl Operator {
    /// Returns the URL keyword for the operator.
    pub fn keyword(self) -> &'static str {
        match self {
            Operator::Default => "",
            Operator::And => "and",
            Operator::Or => "or",
            Operator::Equal => "eq",
            Operator::NotEqual => "ne",
            Operator::GreaterThan => "gt",
            Operator::GreaterThanOrEqual => "ge",
            Operator::LessThan => "lt",
            Operator::LessThanOrEqual => "le",
            Operator::Add => "add",
            Operator::Subtract => "sub",
            Operator::Multiply => "mul",
            Operator::Divide => "div",
            Operator::Modulo => "mod",
            Operator::Has => "has",
            Operator::Not => "not",
            Operator::Negate => "-",
        }
    }

    /// Binding strength; higher binds tighter.
    pub fn precedence(self) -> u8 {
        match self {
            Operator::Or => 1,
            Operator::And => 2,
            Operator::Equal
            | Operator::NotEqual
            | Operator::GreaterThan
            | Operator::GreaterThanOrEqual
            | Operator::LessThan
            | Operator::LessThanOrEqual
            | Operator::Has => 3,
            Operator::Add | Operator::Subtract => 4,
            Operator::Multiply | Operator::Divide | Operator::Modulo => 5,
            Operator::Not | Operator::Negate => 6,
            Operator::Default => 7,
        }
    }

    /// True when `a op (b op c)` equals `(a op b) op c`.
    pub fn is_associative(self) -> bool {
        matches!(
            self,
            Operator::And | Operator::Or | Operator::Add | Operator::Multiply
        )
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Expression node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    /// Literal value.
    Value {
        /// The literal.
        value: Value,
    },
    /// Property or navigation path, segments separated by `/`.
    Reference {
        /// Path such as `Category/Name`.
        path: String,
    },
    /// Function or method call. Lambda calls (`any`/`all`) take the range
    /// variable as a reference in `arguments[0]` and the body in `arguments[1]`.
    Function {
        /// Instance the method is invoked on, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caller: Option<Arc<Expr>>,
        /// Canonical (lowercase) function name.
        name: String,
        /// Call arguments.
        #[serde(default)]
        arguments: Vec<Expr>,
    },
    /// Binary operation.
    Binary {
        /// Operator.
        op: Operator,
        /// Left operand.
        left: Arc<Expr>,
        /// Right operand.
        right: Arc<Expr>,
    },
    /// Unary operation (`Not` or `Negate`).
    Unary {
        /// Operator.
        op: Operator,
        /// Operand.
        operand: Arc<Expr>,
    },
    /// Type conversion of the inner expression.
    Conversion {
        /// Conversion target.
        target: ValueType,
        /// Converted expression.
        inner: Arc<Expr>,
    },
}

/// Names of the lambda operators.
pub const LAMBDA_FUNCTIONS: [&str; 2] = ["any", "all"];

impl Expr {
    /// Literal node.
    pub fn value(value: impl Into<Value>) -> Self {
        Expr::Value {
            value: value.into(),
        }
    }

    /// Null literal node.
    pub fn null() -> Self {
        Expr::value(Value::Null)
    }

    /// Property path node.
    pub fn reference(path: impl Into<String>) -> Self {
        Expr::Reference { path: path.into() }
    }

    /// Free function call such as `now()` or `concat(a,b)`.
    pub fn function<I>(name: impl Into<String>, arguments: I) -> Self
    where
        I: IntoIterator<Item = Expr>,
    {
        Expr::Function {
            caller: None,
            name: name.into().to_ascii_lowercase(),
            arguments: arguments.into_iter().collect(),
        }
    }

    /// Method call on `self`, e.g. `Name.contains('x')`.
    pub fn method<I>(self, name: impl Into<String>, arguments: I) -> Self
    where
        I: IntoIterator<Item = Expr>,
    {
        Expr::Function {
            caller: Some(Arc::new(self)),
            name: name.into().to_ascii_lowercase(),
            arguments: arguments.into_iter().collect(),
        }
    }

    /// `collection/any(var:body)`.
    pub fn any(collection: impl Into<String>, var: impl Into<String>, body: Expr) -> Self {
        Expr::reference(collection).method("any", [Expr::reference(var), body])
    }

    /// `collection/all(var:body)`.
    pub fn all(collection: impl Into<String>, var: impl Into<String>, body: Expr) -> Self {
        Expr::reference(collection).method("all", [Expr::reference(var), body])
    }

    /// Conversion node.
    pub fn convert(self, target: ValueType) -> Self {
        Expr::Conversion {
            target,
            inner: Arc::new(self),
        }
    }

    /// Generic binary node.
    pub fn binary(op: Operator, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Arc::new(left),
            right: Arc::new(right),
        }
    }

    /// Generic unary node.
    pub fn unary(op: Operator, operand: Expr) -> Self {
        Expr::Unary {
            op,
            operand: Arc::new(operand),
        }
    }

    /// `self and other`
    pub fn and(self, other: Expr) -> Self {
        Expr::binary(Operator::And, self, other)
    }

    /// `self or other`
    pub fn or(self, other: Expr) -> Self {
        Expr::binary(Operator::Or, self, other)
    }

    /// `not self`
    pub fn negated(self) -> Self {
        Expr::unary(Operator::Not, self)
    }

    /// `-self`
    pub fn minus(self) -> Self {
        Expr::unary(Operator::Negate, self)
    }

    /// `self eq value`
    pub fn eq(self, other: impl Into<Expr>) -> Self {
        Expr::binary(Operator::Equal, self, other.into())
    }

    /// `self ne value`
    pub fn ne(self, other: impl Into<Expr>) -> Self {
        Expr::binary(Operator::NotEqual, self, other.into())
    }

    /// `self gt value`
    pub fn gt(self, other: impl Into<Expr>) -> Self {
        Expr::binary(Operator::GreaterThan, self, other.into())
    }

    /// `self ge value`
    pub fn ge(self, other: impl Into<Expr>) -> Self {
        Expr::binary(Operator::GreaterThanOrEqual, self, other.into())
    }

    /// `self lt value`
    pub fn lt(self, other: impl Into<Expr>) -> Self {
        Expr::binary(Operator::LessThan, self, other.into())
    }

    /// `self le value`
    pub fn le(self, other: impl Into<Expr>) -> Self {
        Expr::binary(Operator::LessThanOrEqual, self, other.into())
    }

    /// `self add value`
    pub fn add(self, other: impl Into<Expr>) -> Self {
        Expr::binary(Operator::Add, self, other.into())
    }

    /// `self sub value`
    pub fn sub(self, other: impl Into<Expr>) -> Self {
        Expr::binary(Operator::Subtract, self, other.into())
    }

    /// `self mul value`
    pub fn mul(self, other: impl Into<Expr>) -> Self {
        Expr::binary(Operator::Multiply, self, other.into())
    }

    /// `self div value`
    pub fn div(self, other: impl Into<Expr>) -> Self {
        Expr::binary(Operator::Divide, self, other.into())
    }

    /// `self mod value`
    pub fn modulo(self, other: impl Into<Expr>) -> Self {
        Expr::binary(Operator::Modulo, self, other.into())
    }

    /// `self has flag`
    pub fn has(self, other: impl Into<Expr>) -> Self {
        Expr::binary(Operator::Has, self, other.into())
    }

    /// Operator of this node; leaves and conversions report `Default`.
    pub fn operator(&self) -> Operator {
        match self {
            Expr::Binary { op, .. } | Expr::Unary { op, .. } => *op,
            _ => Operator::Default,
        }
    }

    /// True for literal leaves.
    pub fn is_value(&self) -> bool {
        matches!(self, Expr::Value { .. })
    }

    /// Returns the literal when this is a value leaf.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Expr::Value { value } => Some(value),
            _ => None,
        }
    }

    /// Returns the path when this is a reference leaf.
    pub fn as_reference(&self) -> Option<&str> {
        match self {
            Expr::Reference { path } => Some(path),
            _ => None,
        }
    }

    /// Returns `(collection path, range variable, body)` for lambda calls.
    pub fn as_lambda(&self) -> Option<(&str, &str, &Expr)> {
        match self {
            Expr::Function {
                caller: Some(caller),
                name,
                arguments,
            } if LAMBDA_FUNCTIONS.contains(&name.as_str()) && arguments.len() == 2 => {
                let collection = caller.as_reference()?;
                let var = arguments[0].as_reference()?;
                Some((collection, var, &arguments[1]))
            }
            _ => None,
        }
    }

    /// Flattens nested `and` nodes into their operands, left to right.
    pub fn conjuncts(&self) -> Vec<&Expr> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(expr) = stack.pop() {
            match expr {
                Expr::Binary {
                    op: Operator::And,
                    left,
                    right,
                } => {
                    stack.push(right);
                    stack.push(left);
                }
                other => out.push(other),
            }
        }
        out
    }

    /// Rewrites every reference path with `map`, leaving references rooted
    /// at an enclosing lambda's range variable untouched.
    pub fn map_references<F>(&self, map: &mut F) -> Expr
    where
        F: FnMut(&str) -> String,
    {
        self.map_scoped(map, &mut Vec::new())
    }

    fn map_scoped<F>(&self, map: &mut F, scopes: &mut Vec<String>) -> Expr
    where
        F: FnMut(&str) -> String,
    {
        match self {
            Expr::Value { .. } => self.clone(),
            Expr::Reference { path } => {
                let head = path.split('/').next().unwrap_or_default();
                if scopes.iter().any(|scope| scope == head) {
                    self.clone()
                } else {
                    Expr::reference(map(path))
                }
            }
            Expr::Function {
                caller,
                name,
                arguments,
            } => {
                let caller = caller
                    .as_ref()
                    .map(|caller| Arc::new(caller.map_scoped(map, scopes)));
                let lambda_var = self.as_lambda().map(|(_, var, _)| var.to_owned());
                let arguments = match lambda_var {
                    Some(var) => {
                        scopes.push(var);
                        let body = arguments[1].map_scoped(map, scopes);
                        scopes.pop();
                        vec![arguments[0].clone(), body]
                    }
                    None => arguments
                        .iter()
                        .map(|argument| argument.map_scoped(map, scopes))
                        .collect(),
                };
                Expr::Function {
                    caller,
                    name: name.clone(),
                    arguments,
                }
            }
            Expr::Binary { op, left, right } => Expr::binary(
                *op,
                left.map_scoped(map, scopes),
                right.map_scoped(map, scopes),
            ),
            Expr::Unary { op, operand } => Expr::unary(*op, operand.map_scoped(map, scopes)),
            Expr::Conversion { target, inner } => inner.map_scoped(map, scopes).convert(*target),
        }
    }
}

impl From<Value> for Expr {
    fn from(value: Value) -> Self {
        Expr::Value { value }
    }
}

impl From<&str> for Expr {
    fn from(value: &str) -> Self {
        Expr::value(value)
    }
}

impl From<String> for Expr {
    fn from(value: String) -> Self {
        Expr::value(value)
    }
}

impl From<bool> for Expr {
    fn from(value: bool) -> Self {
        Expr::value(value)
    }
}

impl From<i32> for Expr {
    fn from(value: i32) -> Self {
        Expr::value(value)
    }
}

impl From<i64> for Expr {
    fn from(value: i64) -> Self {
        Expr::value(value)
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Expr::value(value)
    }
}

impl BitAnd for Expr {
    type Output = Expr;

    fn bitand(self, rhs: Expr) -> Expr {
        self.and(rhs)
    }
}

impl BitOr for Expr {
    type Output = Expr;

    fn bitor(self, rhs: Expr) -> Expr {
        self.or(rhs)
    }
}

impl Not for Expr {
    type Output = Expr;

    fn not(self) -> Expr {
        self.negated()
    }
}

//! Expression rendering.
//!
//! Parentheses are emitted only where operator precedence requires them, so a
//! rendered fragment reads the way a person would write it.

use crate::protocol::{Dialect, LiteralConverter, ProtocolAdapter, ProtocolVersion};
use crate::query::ast::{Expr, Operator};
use crate::types::{Error, Result};

/// Renders expressions for one adapter.
pub struct Renderer<'a> {
    version: ProtocolVersion,
    literals: &'a dyn LiteralConverter,
    escape: bool,
}

impl<'a> Renderer<'a> {
    /// Renderer using the adapter's literal syntax and escaping flag.
    pub fn for_adapter<A: ProtocolAdapter + ?Sized>(adapter: &'a A) -> Self {
        Self::new(
            adapter.version(),
            adapter.literals(),
            adapter.options().escape_literals,
        )
    }

    /// Renderer from explicit parts.
    pub fn new(version: ProtocolVersion, literals: &'a dyn LiteralConverter, escape: bool) -> Self {
        Self {
            version,
            literals,
            escape,
        }
    }

    /// Renders `expr` as a standalone predicate.
    pub fn render(&self, expr: &Expr) -> Result<String> {
        self.render_min(expr, 0)
    }

    /// Renders `expr` as an operand of an operator with precedence `min`,
    /// parenthesizing it when it binds more loosely.
    pub fn render_min(&self, expr: &Expr, min: u8) -> Result<String> {
        let text = self.render_node(expr)?;
        if precedence(expr) < min {
            Ok(format!("({text})"))
        } else {
            Ok(text)
        }
    }

    fn dialect(&self) -> Dialect {
        self.version.dialect()
    }

    fn render_node(&self, expr: &Expr) -> Result<String> {
        match expr {
            Expr::Value { value } => Ok(self.literals.format(value, self.escape)),
            Expr::Reference { path } => Ok(path.clone()),
            Expr::Binary { op, left, right } => {
                if *op == Operator::Has && self.dialect() == Dialect::Legacy {
                    return Err(Error::unsupported("has operator", self.version));
                }
                let own = op.precedence();
                let right_min = if op.is_associative() { own } else { own + 1 };
                Ok(format!(
                    "{} {} {}",
                    self.render_min(left, own)?,
                    op.keyword(),
                    self.render_min(right, right_min)?
                ))
            }
            Expr::Unary { op, operand } => {
                let inner = self.render_min(operand, op.precedence())?;
                Ok(match op {
                    Operator::Negate => format!("-{inner}"),
                    _ => format!("{} {inner}", op.keyword()),
                })
            }
            Expr::Conversion { target, inner } => {
                let inner = self.render(inner)?;
                Ok(match self.dialect() {
                    Dialect::Legacy => format!("cast({inner},'{}')", target.edm_name()),
                    Dialect::Modern => format!("cast({inner},{})", target.edm_name()),
                })
            }
            Expr::Function {
                caller,
                name,
                arguments,
            } => {
                if let Some((collection, var, body)) = expr.as_lambda() {
                    if self.version < ProtocolVersion::V3 {
                        return Err(Error::unsupported("lambda operators", self.version));
                    }
                    return Ok(format!("{collection}/{name}({var}:{})", self.render(body)?));
                }
                let mut rendered = Vec::with_capacity(arguments.len() + 1);
                if let Some(caller) = caller {
                    rendered.push(self.render(caller)?);
                }
                for argument in arguments {
                    rendered.push(self.render(argument)?);
                }
                if name == "contains" && self.dialect() == Dialect::Legacy && rendered.len() == 2 {
                    return Ok(format!("substringof({},{})", rendered[1], rendered[0]));
                }
                Ok(format!("{name}({})", rendered.join(",")))
            }
        }
    }
}

fn precedence(expr: &Expr) -> u8 {
    expr.operator().precedence()
}

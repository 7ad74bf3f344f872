//! Client-side OData query compiler.
//!
//! Fluent commands are compiled into protocol-correct request paths, ordered
//! query clauses and payloads for OData 1.0 through 4.01. Filters that reach
//! through navigation properties are split per entity and rendered as nested
//! expand filters or `any` lambdas as the protocol version allows. Metadata is
//! fetched once per endpoint and shared by every [`session::Session`].

#![warn(missing_docs)]

pub mod logging;
pub mod metadata;
pub mod protocol;
pub mod query;
pub mod session;
pub mod transport;
pub mod types;

pub use protocol::{CompiledRequest, ProtocolAdapter, ProtocolVersion};
pub use query::{CommandBuilder, Expr, Value};
pub use session::{Session, Settings};
pub use types::{Error, Result};

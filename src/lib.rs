//! # weft-orm: a small MySQL ORM
//!
//! Models declare a table, a primary key, and named relations; a value-typed
//! query builder compiles them into prefixed, parameterized SQL. Relations
//! can be eager-loaded in one batched query per relation, counted, filtered
//! with `EXISTS` sub-queries, and synchronized through pivot tables.
//!
//! The connection layer owns the wire details: `{{ table }}` templates become
//! prefixed names and named placeholders become positional binds right before
//! execution, so compiled SQL stays inspectable and loggable.

pub mod compiler;
pub mod condition;
pub mod connection;
pub mod error;
pub mod model;
pub mod params;
pub mod query;
pub mod relation;
pub mod schema;
pub mod value;

// Re-export core types
pub use compiler::*;
pub use condition::*;
pub use connection::*;
pub use error::*;
pub use model::*;
pub use params::*;
pub use query::*;
pub use relation::*;
pub use schema::*;
pub use value::*;

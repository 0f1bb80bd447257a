//! Statement model and raw SQL parsing.
//!
//! Builders produce [`Statement`]s directly; raw SQL goes through
//! `sqlparser` and is converted into the same representation, so both
//! paths are intercepted identically.

mod ast;
mod error;
mod parser;

pub use ast::*;
pub use error::{ParseError, ParseResult};
pub use parser::Parser;

//! Spec document parsing and re-serialization.
//!
//! The parser turns a markdown spec into features; the writer renders
//! features back so that parsing the output is idempotent.

mod parser;
mod writer;

pub use parser::{SpecDocument, SpecParser};
pub use writer::SpecWriter;

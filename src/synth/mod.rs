//! Configuration synthesis
//!
//! Loads JSON or YAML templates into a neutral [`Node`] tree, applies
//! idempotent [`Mutation`]s and writes the result back atomically.

mod document;
mod mutation;
mod node;

pub use document::{ConfigDocument, DocumentFormat};
pub use mutation::{KeyPath, Mutation};
pub use node::Node;

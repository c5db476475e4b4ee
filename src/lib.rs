//! Numdex: sparse numeric mappings over hierarchical key spaces
//!
//! Keys address nodes in a shared tree of dotted identifiers; a key form
//! carves out a family of keys at chosen depths, and an index enumerates
//! that family against a live keyspace. Numeric dicts attach values to an
//! index with an explicit-entry map plus a default, stay consistent under
//! keyspace edits, and support reverse-mode differentiation through a
//! gradient tape.

pub mod error;
pub mod index;
pub mod key;
pub mod keyform;
pub mod keyspace;
pub mod lexer;
pub mod numdict;
pub mod ops;
pub mod parser;
pub mod tape;

pub use error::{NumError, StructuralError, SyntaxError, TapeError};
pub use index::Index;
pub use key::{Key, WILDCARD};
pub use keyform::{KeyForm, Reductor};
pub use keyspace::{KeySpace, NodeId};
pub use numdict::NumDict;
pub use ops::{GradFn, GradRule, OpArgs, OpDef, OpRegistry};
pub use tape::{Tape, TapeSlot};

/// Parse a key string into its canonical [`Key`].
pub fn parse(input: &str) -> Result<Key, SyntaxError> {
    Key::parse(input)
}

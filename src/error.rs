//! Error types for the numdex engine.
//!
//! Each subsystem reports failures through its own enum. Key syntax errors
//! carry the offending source text and can render an ariadne report for
//! user-facing diagnostics.

use ariadne::{Color, Label, Report, ReportKind, Source};
use std::ops::Range;

use crate::key::Key;

/// A malformed key string.
///
/// Produced by the lexer (illegal characters, whitespace) or the level
/// parser (group structure inconsistent with arities fixed at earlier
/// levels).
#[derive(Clone, Debug)]
pub struct SyntaxError {
    pub source: String,
    pub message: String,
    pub span: Range<usize>,
}

impl SyntaxError {
    pub fn new(source: &str, message: impl Into<String>, span: Range<usize>) -> Self {
        SyntaxError {
            source: source.to_string(),
            message: message.into(),
            span,
        }
    }

    /// Render a labeled report against the original source text.
    pub fn report(&self) -> String {
        let mut output = Vec::new();
        let span = if self.span.start <= self.span.end && self.span.end <= self.source.len() {
            self.span.clone()
        } else {
            0..self.source.len()
        };
        let report = Report::build(ReportKind::Error, (), span.start)
            .with_message("Invalid key string")
            .with_label(
                Label::new(span)
                    .with_message(&self.message)
                    .with_color(Color::Red),
            );
        if report
            .finish()
            .write(Source::from(self.source.as_str()), &mut output)
            .is_err()
        {
            return self.message.clone();
        }
        String::from_utf8(output).unwrap_or_else(|_| self.message.clone())
    }
}

impl std::fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid key string '{}': {}", self.source, self.message)
    }
}

impl std::error::Error for SyntaxError {}

/// Violations of tree-shape constraints on keys, forms, and namespaces.
#[derive(Clone, Debug, PartialEq)]
pub enum StructuralError {
    /// Node index out of range for a cut or link.
    InvalidNode(usize, String),
    /// Child index out of range for a cut or link.
    InvalidChild(usize),
    /// Child index list does not cover the spliced root's arity.
    InvalidChildList,
    /// Height vector length does not match the number of open leaves.
    HeightMismatch { expected: usize, got: usize },
    /// Wildcard nodes in a key do not form well-shaped descent chains.
    InvalidWildcard(String),
    /// A key does not align inside another where an alignment is required.
    NoMatch(String),
    /// More than one alignment where a unique one is required.
    Ambiguous(String),
    /// Branch index out of range for a reduction.
    InvalidBranch(usize),
    /// A form leaf's path does not resolve against the namespace tree.
    UnknownMember(String),
    /// Name rejected by the namespace tree (empty or not identifier-shaped).
    InvalidName(String),
    /// Attach under a name that is already taken.
    DuplicateName(String),
    /// Deletion vetoed: the node is required by a live index.
    Required(String),
    /// A key used as a tree path has a branching node.
    NotAPath(String),
    /// Two operands are bound to different namespace trees.
    IncompatibleSpaces,
}

impl std::fmt::Display for StructuralError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StructuralError::InvalidNode(n, key) => {
                write!(f, "invalid node index '{}' for key '{}'", n, key)
            }
            StructuralError::InvalidChild(i) => write!(f, "invalid child index '{}'", i),
            StructuralError::InvalidChildList => write!(f, "invalid child index list"),
            StructuralError::HeightMismatch { expected, got } => {
                write!(f, "expected {} heights, got {}", expected, got)
            }
            StructuralError::InvalidWildcard(key) => {
                write!(f, "malformed wildcard structure in '{}'", key)
            }
            StructuralError::NoMatch(msg) => write!(f, "no alignment: {}", msg),
            StructuralError::Ambiguous(msg) => {
                write!(f, "ambiguous alignment: {}", msg)
            }
            StructuralError::InvalidBranch(b) => write!(f, "invalid branch index '{}'", b),
            StructuralError::UnknownMember(path) => {
                write!(f, "no namespace member at '{}'", path)
            }
            StructuralError::InvalidName(name) => {
                write!(f, "invalid keyspace name: '{}'", name)
            }
            StructuralError::DuplicateName(name) => {
                write!(f, "keyspace name '{}' already taken", name)
            }
            StructuralError::Required(path) => {
                write!(f, "cannot delete '{}': required by a live index", path)
            }
            StructuralError::NotAPath(key) => write!(f, "key '{}' is not a path", key),
            StructuralError::IncompatibleSpaces => {
                write!(f, "operands are bound to different keyspaces")
            }
        }
    }
}

impl std::error::Error for StructuralError {}

/// Failures in numeric mapping access and combination.
#[derive(Clone, Debug, PartialEq)]
pub enum NumError {
    /// Key is not a member of the bound index.
    Membership(Key),
    /// Mutation attempted outside a mutable scope, or on a tape-protected
    /// value.
    Protected,
    /// Invalid argument (bad mode flag, branch list length, empty operand).
    Value(String),
    /// Domain error in a numeric or sampling kernel.
    Arithmetic(String),
    /// Structural failure surfaced through a reduction or index operation.
    Structure(StructuralError),
}

impl std::fmt::Display for NumError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NumError::Membership(key) => write!(f, "key '{}' not a member of index", key),
            NumError::Protected => write!(f, "cannot mutate protected NumDict data"),
            NumError::Value(msg) => write!(f, "{}", msg),
            NumError::Arithmetic(msg) => write!(f, "arithmetic error: {}", msg),
            NumError::Structure(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for NumError {}

impl From<StructuralError> for NumError {
    fn from(e: StructuralError) -> Self {
        NumError::Structure(e)
    }
}

/// Misuse of the gradient tape or the operation registry.
#[derive(Clone, Debug, PartialEq)]
pub enum TapeError {
    /// A tape is already active in this slot.
    Nested,
    /// The slot is still recording; stop before computing gradients.
    Recording,
    /// No tape is active in the slot.
    Inactive,
    /// The value was never registered on the tape.
    NotOnTape,
    /// Backward pass hit an operation name missing from the registry.
    UnknownOp(String),
    /// An operation name was registered twice.
    DuplicateOp(String),
    /// The operation's gradient rule is an explicit placeholder.
    UnimplementedGrad(String),
    /// A numeric failure inside a gradient kernel.
    Num(NumError),
}

impl std::fmt::Display for TapeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TapeError::Nested => write!(f, "cannot stack gradient tapes"),
            TapeError::Recording => {
                write!(f, "stop recording before computing gradients")
            }
            TapeError::Inactive => write!(f, "no active gradient tape"),
            TapeError::NotOnTape => write!(f, "value not registered on tape"),
            TapeError::UnknownOp(name) => write!(f, "unregistered op '{}'", name),
            TapeError::DuplicateOp(name) => {
                write!(f, "op name '{}' already in registry", name)
            }
            TapeError::UnimplementedGrad(name) => {
                write!(f, "gradient of '{}' not implemented", name)
            }
            TapeError::Num(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for TapeError {}

impl From<NumError> for TapeError {
    fn from(e: NumError) -> Self {
        TapeError::Num(e)
    }
}

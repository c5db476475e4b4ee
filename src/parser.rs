//! Level parser for key strings.
//!
//! A key string is a colon-separated list of level segments. Each segment
//! carries the child groups of the previous level's frontier nodes, wrapped
//! in the parens of every branching ancestor. The grammar is therefore not
//! context free: the shape each segment must take is fixed by the arities
//! parsed at earlier levels. The parser walks the partially built tree for
//! every segment, consuming tokens where the tree demands punctuation and
//! reading child groups at the frontier.
//!
//! A child group is empty, a single label, or two or more comma-separated
//! labels in parens. Single-label groups are never parenthesized.

use chumsky::Parser as _;

use crate::error::SyntaxError;
use crate::key::{Key, KeyNode};
use crate::lexer::{lexer, Span, Token};

/// Parse a key string into its level-order node list.
pub fn parse_key(source: &str) -> Result<Key, SyntaxError> {
    let tokens = lexer().parse(source).map_err(|errs| match errs.into_iter().next() {
        Some(e) => {
            let message = match e.found() {
                Some(c) if c.is_whitespace() => "whitespace is not allowed in keys".to_string(),
                Some(c) => format!("unexpected character '{}'", c),
                None => "unexpected end of input".to_string(),
            };
            SyntaxError::new(source, message, e.span())
        }
        None => SyntaxError::new(source, "invalid key".to_string(), 0..source.len()),
    })?;

    let mut segments: Vec<&[(Token, Span)]> = Vec::new();
    let mut ends: Vec<usize> = Vec::new();
    let mut start = 0;
    for (i, (tok, span)) in tokens.iter().enumerate() {
        if *tok == Token::Colon {
            segments.push(&tokens[start..i]);
            ends.push(span.start);
            start = i + 1;
        }
    }
    segments.push(&tokens[start..]);
    ends.push(source.len());

    let mut tree = Builder::new();
    for (depth, (segment, &end)) in segments.iter().zip(ends.iter()).enumerate() {
        let mut cursor = Cursor {
            source,
            tokens: segment,
            pos: 0,
            end,
        };
        tree.descend(0, depth, &mut cursor)?;
        if let Some((tok, span)) = cursor.remaining() {
            return Err(SyntaxError::new(
                source,
                format!("unexpected '{}'", tok),
                span.clone(),
            ));
        }
    }
    Ok(Key::from_nodes(tree.nodes))
}

struct Cursor<'a> {
    source: &'a str,
    tokens: &'a [(Token, Span)],
    pos: usize,
    end: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn bump(&mut self) -> Option<&'a (Token, Span)> {
        let item = self.tokens.get(self.pos);
        if item.is_some() {
            self.pos += 1;
        }
        item
    }

    fn remaining(&self) -> Option<&'a (Token, Span)> {
        self.tokens.get(self.pos)
    }

    /// Error at the current token, or at the end of the segment when the
    /// tokens ran out.
    fn expected(&self, what: &str) -> SyntaxError {
        match self.tokens.get(self.pos) {
            Some((tok, span)) => SyntaxError::new(
                self.source,
                format!("expected {}, found '{}'", what, tok),
                span.clone(),
            ),
            None => SyntaxError::new(
                self.source,
                format!("expected {}", what),
                self.end..self.end + 1,
            ),
        }
    }

    fn expect(&mut self, tok: Token, what: &str) -> Result<(), SyntaxError> {
        match self.peek() {
            Some(t) if *t == tok => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(self.expected(what)),
        }
    }

    fn expect_label(&mut self) -> Result<String, SyntaxError> {
        match self.bump() {
            Some((Token::Ident(s), _)) => Ok(s.clone()),
            Some((tok, span)) => Err(SyntaxError::new(
                self.source,
                format!("expected a label, found '{}'", tok),
                span.clone(),
            )),
            None => Err(SyntaxError::new(
                self.source,
                "expected a label".to_string(),
                self.end..self.end + 1,
            )),
        }
    }
}

struct Builder {
    nodes: Vec<KeyNode>,
    children: Vec<Vec<usize>>,
}

impl Builder {
    fn new() -> Self {
        Builder {
            nodes: vec![KeyNode::new("", 0)],
            children: vec![Vec::new()],
        }
    }

    /// Walk the tree from `node` down `remaining` levels, matching the
    /// punctuation its arities demand; at the frontier, read a child group
    /// and grow the tree.
    fn descend(
        &mut self,
        node: usize,
        remaining: usize,
        cursor: &mut Cursor,
    ) -> Result<(), SyntaxError> {
        if remaining == 0 {
            return self.group(node, cursor);
        }
        match self.nodes[node].arity {
            0 => Ok(()),
            1 => {
                let child = self.children[node][0];
                self.descend(child, remaining - 1, cursor)
            }
            _ => {
                cursor.expect(Token::LParen, "'('")?;
                let kids = self.children[node].clone();
                for (i, child) in kids.into_iter().enumerate() {
                    if i > 0 {
                        cursor.expect(Token::Comma, "','")?;
                    }
                    self.descend(child, remaining - 1, cursor)?;
                }
                cursor.expect(Token::RParen, "')'")
            }
        }
    }

    /// Read one child group for a frontier node. An empty group consumes
    /// nothing; groups of two or more labels are parenthesized.
    fn group(&mut self, node: usize, cursor: &mut Cursor) -> Result<(), SyntaxError> {
        match cursor.peek() {
            Some(Token::Ident(label)) => {
                let label = label.clone();
                cursor.pos += 1;
                self.push_child(node, label);
                Ok(())
            }
            Some(Token::LParen) => {
                cursor.pos += 1;
                let first = cursor.expect_label()?;
                self.push_child(node, first);
                cursor.expect(Token::Comma, "','")?;
                loop {
                    let label = cursor.expect_label()?;
                    self.push_child(node, label);
                    match cursor.peek() {
                        Some(Token::Comma) => cursor.pos += 1,
                        _ => break,
                    }
                }
                cursor.expect(Token::RParen, "')'")
            }
            // Empty group: the delimiter belongs to an ancestor.
            _ => Ok(()),
        }
    }

    fn push_child(&mut self, parent: usize, label: String) {
        let idx = self.nodes.len();
        self.nodes.push(KeyNode::new(label, 0));
        self.children.push(Vec::new());
        self.nodes[parent].arity += 1;
        self.children[parent].push(idx);
    }
}

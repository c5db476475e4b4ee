//! Lexer for the key grammar.
//!
//! Tokenizes a key string into a stream for the level parser. Whitespace is
//! illegal anywhere in a key, so there is no padding: any space character
//! fails the lex.

use chumsky::prelude::*;
use std::ops::Range;

/// Token types for key strings.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Token {
    /// A label: any run of characters outside the punctuation set.
    Ident(String),

    // Punctuation
    LParen, // (
    RParen, // )
    Colon,  // :
    Comma,  // ,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "{}", s),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Colon => write!(f, ":"),
            Token::Comma => write!(f, ","),
        }
    }
}

/// Type alias for spans
pub type Span = Range<usize>;

fn is_label_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '(' | ')' | ':' | ',')
}

/// Create a lexer for key strings.
pub fn lexer() -> impl Parser<char, Vec<(Token, Span)>, Error = Simple<char>> {
    let ident = filter(|c: &char| is_label_char(*c))
        .repeated()
        .at_least(1)
        .collect::<String>()
        .map(Token::Ident);

    let punctuation = choice((
        just('(').to(Token::LParen),
        just(')').to(Token::RParen),
        just(':').to(Token::Colon),
        just(',').to(Token::Comma),
    ));

    ident
        .or(punctuation)
        .map_with_span(|tok, span| (tok, span))
        .repeated()
        .then_ignore(end())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(s: &str) -> Result<Vec<Token>, Vec<Simple<char>>> {
        lexer()
            .parse(s)
            .map(|toks| toks.into_iter().map(|(t, _)| t).collect())
    }

    #[test]
    fn tokenizes_nested_key() {
        let toks = lex("a:(b,c)").unwrap();
        assert_eq!(
            toks,
            vec![
                Token::Ident("a".into()),
                Token::Colon,
                Token::LParen,
                Token::Ident("b".into()),
                Token::Comma,
                Token::Ident("c".into()),
                Token::RParen,
            ]
        );
    }

    #[test]
    fn rejects_whitespace() {
        assert!(lex("a: b").is_err());
        assert!(lex(" a").is_err());
        assert!(lex("a\tb").is_err());
    }

    #[test]
    fn empty_input_lexes_to_nothing() {
        assert_eq!(lex("").unwrap(), vec![]);
    }
}

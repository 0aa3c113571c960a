use std::{
    collections::{BTreeMap, VecDeque},
    str::Chars,
};

use itertools::{peek_nth, PeekNth};
use once_cell::sync::Lazy;
use strum::EnumString;

use crate::frontend::SourceFile;

#[derive(Debug)]
pub struct Lexer<'source> {
    source: &'source SourceFile,
    position: usize,
    chars: PeekNth<Chars<'source>>,
    peek_buffer: VecDeque<Token>,
}

#[derive(Debug, Clone, Copy)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /* Words */
    Keyword(Keyword), // fn
    Identifier,       // total

    /* Literals */
    BooleanLiteral, // true
    IntegerLiteral, // 1
    FloatLiteral,   // 1.0
    StringLiteral,  // "hello, world"

    /* Delimiters */
    OpenParen,    // (
    CloseParen,   // )
    OpenBracket,  // [
    CloseBracket, // ]
    OpenBrace,    // {
    CloseBrace,   // }
    Comma,        // ,
    Dot,          // .
    DotDot,       // ..

    /* Operators */
    Plus,                 // +
    Minus,                // -
    Asterisk,             // *
    Divide,               // /
    Caret,                // ^
    DoubleEquals,         // ==
    NotEquals,            // !=
    LessThan,             // <
    LessThanOrEqualTo,    // <=
    GreaterThan,          // >
    GreaterThanOrEqualTo, // >=

    /* Assignment */
    Equals, // =
}

impl TokenKind {
    pub fn is_comparison_operator(&self) -> bool {
        matches!(
            self,
            Self::NotEquals
                | Self::DoubleEquals
                | Self::LessThan
                | Self::LessThanOrEqualTo
                | Self::GreaterThan
                | Self::GreaterThanOrEqualTo
        )
    }

    pub fn is_term_operator(&self) -> bool {
        matches!(self, Self::Plus | Self::Minus)
    }

    pub fn is_factor_operator(&self) -> bool {
        matches!(self, Self::Asterisk | Self::Divide)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Keyword {
    Fn,
    Struct,
    If,
    Else,
    While,
    For,
    In,
    Break,
    Continue,
    Return,
    And,
    Or,
    Not,
}

/// Table of single char tokens (matched after longer sequences are checked for)
static SINGLE_TOKENS: Lazy<BTreeMap<char, TokenKind>> = Lazy::new(|| {
    BTreeMap::from([
        ('(', TokenKind::OpenParen),
        (')', TokenKind::CloseParen),
        ('[', TokenKind::OpenBracket),
        (']', TokenKind::CloseBracket),
        ('{', TokenKind::OpenBrace),
        ('}', TokenKind::CloseBrace),
        (',', TokenKind::Comma),
        ('.', TokenKind::Dot),
        ('+', TokenKind::Plus),
        ('-', TokenKind::Minus),
        ('*', TokenKind::Asterisk),
        ('/', TokenKind::Divide),
        ('^', TokenKind::Caret),
        ('=', TokenKind::Equals),
        ('<', TokenKind::LessThan),
        ('>', TokenKind::GreaterThan),
    ])
});

#[derive(Debug, Clone, Copy)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source SourceFile) -> Self {
        Self {
            source,
            chars: peek_nth(source.contents.chars()),
            position: 0,
            peek_buffer: VecDeque::new(),
        }
    }

    pub fn is_eof(&self) -> bool {
        self.position >= self.source.contents.len()
    }

    pub fn source(&self) -> &SourceFile {
        self.source
    }

    pub fn next(&mut self) -> Option<Token> {
        if let Some(token) = self.peek_buffer.pop_front() {
            return Some(token);
        }

        self.read_token()
    }

    pub fn peek(&mut self) -> Option<Token> {
        self.peek_nth(0)
    }

    pub fn peek_nth(&mut self, n: usize) -> Option<Token> {
        while self.peek_buffer.len() <= n {
            let token = self.read_token()?;
            self.peek_buffer.push_back(token);
        }

        self.peek_buffer.get(n).copied()
    }

    fn report_fatal_error(&self, message: &str) -> ! {
        eprintln!(
            "{} ({}:{}:{})",
            message,
            self.source.origin,
            self.source.row_for_position(self.position),
            self.source.column_for_position(self.position)
        );
        std::process::exit(1);
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        self.position += c.len_utf8();
        Some(c)
    }

    fn ignore_whitespace(&mut self) {
        while let Some(c) = self.chars.peek().copied() {
            if !c.is_ascii_whitespace() {
                break;
            }

            self.bump();
        }
    }

    fn ignore_line(&mut self) {
        while let Some(c) = self.chars.peek().copied() {
            if c == '\n' {
                break;
            }

            self.bump();
        }
    }

    fn new_span(&self, start: usize) -> Span {
        Span::new(start, self.position)
    }

    fn read_token(&mut self) -> Option<Token> {
        self.ignore_whitespace();

        while self.chars.peek() == Some(&'#') {
            self.ignore_line();
            self.ignore_whitespace();
        }

        let c = self.chars.peek().copied()?;

        if c.is_ascii_digit() {
            return Some(self.read_number());
        }

        if c.is_ascii_alphabetic() || c == '_' {
            return Some(self.read_word());
        }

        if c == '"' || c == '\'' {
            return Some(self.read_string(c));
        }

        /* Multi-char operators before the single-char table */

        let start_position = self.position;

        let two_char = match (c, self.chars.peek_nth(1).copied()) {
            ('=', Some('=')) => Some(TokenKind::DoubleEquals),
            ('!', Some('=')) => Some(TokenKind::NotEquals),
            ('<', Some('=')) => Some(TokenKind::LessThanOrEqualTo),
            ('>', Some('=')) => Some(TokenKind::GreaterThanOrEqualTo),
            ('.', Some('.')) => Some(TokenKind::DotDot),
            _ => None,
        };

        if let Some(kind) = two_char {
            self.bump();
            self.bump();

            return Some(Token {
                kind,
                span: self.new_span(start_position),
            });
        }

        if let Some(kind) = SINGLE_TOKENS.get(&c).copied() {
            self.bump();

            return Some(Token {
                kind,
                span: self.new_span(start_position),
            });
        }

        self.report_fatal_error(&format!("Illegal character: {c:?}"))
    }

    // Keyword, identifier, or boolean literal
    fn read_word(&mut self) -> Token {
        let start_position = self.position;

        while let Some(c) = self.chars.peek().copied() {
            if !(c.is_ascii_alphanumeric() || c == '_') {
                break;
            }

            self.bump();
        }

        let span = self.new_span(start_position);
        let value = self.source.value_of_span(span);

        let kind = if let Ok(keyword) = value.parse() {
            TokenKind::Keyword(keyword)
        } else {
            match value {
                "true" | "false" => TokenKind::BooleanLiteral,
                _ => TokenKind::Identifier,
            }
        };

        Token { kind, span }
    }

    fn read_number(&mut self) -> Token {
        let start_position = self.position;
        let mut kind = TokenKind::IntegerLiteral;

        while let Some(c) = self.chars.peek().copied() {
            if c == '.' {
                // Leave `..` for the range operator, and a dot not followed
                // by a digit for member access (`5.abs()`)
                if !self
                    .chars
                    .peek_nth(1)
                    .copied()
                    .is_some_and(|next| next.is_ascii_digit())
                {
                    break;
                }

                kind = TokenKind::FloatLiteral;
                self.bump();
                continue;
            }

            if !c.is_ascii_digit() {
                break;
            }

            self.bump();
        }

        Token {
            kind,
            span: self.new_span(start_position),
        }
    }

    fn read_string(&mut self, quote: char) -> Token {
        let start_position = self.position;

        self.bump();

        while let Some(c) = self.bump() {
            if c == '\n' {
                self.report_fatal_error("Reached end of line while reading string literal");
            }

            if c == quote {
                return Token {
                    kind: TokenKind::StringLiteral,
                    span: self.new_span(start_position),
                };
            }
        }

        self.report_fatal_error("Reached end of file while reading string literal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(text: &str) -> Vec<TokenKind> {
        let source = SourceFile::from_memory(text);
        let mut lexer = Lexer::new(&source);
        let mut kinds = Vec::new();

        while let Some(token) = lexer.next() {
            kinds.push(token.kind);
        }

        kinds
    }

    #[test]
    fn words_and_keywords() {
        assert_eq!(
            lex("fn loop_count while_x"),
            vec![
                TokenKind::Keyword(Keyword::Fn),
                TokenKind::Identifier,
                TokenKind::Identifier,
            ]
        );
    }

    #[test]
    fn numbers() {
        assert_eq!(lex("42"), vec![TokenKind::IntegerLiteral]);
        assert_eq!(lex("3.14"), vec![TokenKind::FloatLiteral]);
    }

    #[test]
    fn range_is_not_a_float() {
        assert_eq!(
            lex("0..10"),
            vec![
                TokenKind::IntegerLiteral,
                TokenKind::DotDot,
                TokenKind::IntegerLiteral,
            ]
        );
    }

    #[test]
    fn member_access_on_integer() {
        assert_eq!(
            lex("5.abs"),
            vec![
                TokenKind::IntegerLiteral,
                TokenKind::Dot,
                TokenKind::Identifier,
            ]
        );
    }

    #[test]
    fn comparison_operators() {
        assert_eq!(
            lex("< <= == != >= >"),
            vec![
                TokenKind::LessThan,
                TokenKind::LessThanOrEqualTo,
                TokenKind::DoubleEquals,
                TokenKind::NotEquals,
                TokenKind::GreaterThanOrEqualTo,
                TokenKind::GreaterThan,
            ]
        );
    }

    #[test]
    fn strings_with_either_quote() {
        assert_eq!(lex("\"hi\" 'there'"), vec![
            TokenKind::StringLiteral,
            TokenKind::StringLiteral,
        ]);
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            lex("1 # the loneliest number\n2"),
            vec![TokenKind::IntegerLiteral, TokenKind::IntegerLiteral]
        );
    }
}

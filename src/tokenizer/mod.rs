//! Turns binary-layout script text into a token sequence for the compiler.
//!
//! A statement is either a field declaration terminated by `;`, a structure
//! opening (`Name[...]{` or a bare `{`), or a structure closing `}` with an
//! optional trailing `;`. Line comments (`// ...`) and whitespace are
//! insignificant.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::io::ByteOrder;

/// Error type for script tokenization
#[derive(Error, Debug)]
pub enum TokenizeError {
    #[error("unexpected character '{0}' at line {1}")]
    UnexpectedCharacter(char, usize),

    #[error("unterminated '{0}' at line {1}")]
    Unterminated(char, usize),

    #[error("missing field type at line {0}")]
    MissingType(usize),

    #[error("missing ';' or '{{' at line {0}")]
    MissingTerminator(usize),

    #[error("bad numeric literal '{0}' at line {1}")]
    BadLiteral(String, usize),
}

/// Array suffix of a field or structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArraySize {
    Literal(i32),
    /// `[_]`: read elements until the stream is exhausted.
    WholeStream,
    /// `[expr]`: raw expression text, compiled later.
    Expression(String),
}

/// The `:extra` parameter of a field (bit width, skip count, align value,
/// var extra).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExtraValue {
    Literal(i32),
    Expression(String),
}

/// A field declaration statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldToken {
    pub byte_order: ByteOrder,
    pub type_name: String,
    pub extra: Option<ExtraValue>,
    pub array: Option<ArraySize>,
    pub name: Option<String>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Token {
    Field(FieldToken),
    StructStart {
        name: Option<String>,
        array: Option<ArraySize>,
        line: usize,
    },
    StructEnd {
        line: usize,
    },
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Field(field) => write!(f, "{} ...;", field.type_name),
            Token::StructStart { name, .. } => {
                write!(f, "{} {{", name.as_deref().unwrap_or(""))
            }
            Token::StructEnd { .. } => write!(f, "}}"),
        }
    }
}

pub struct Tokenizer {
    input: Vec<char>,
    position: usize,
    line: usize,
}

impl Tokenizer {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            position: 0,
            line: 1,
        }
    }

    pub fn tokenize(&mut self) -> Result<Vec<Token>, TokenizeError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace();
            if self.is_at_end() {
                break;
            }
            tokens.push(self.next_statement()?);
        }
        Ok(tokens)
    }

    fn next_statement(&mut self) -> Result<Token, TokenizeError> {
        let line = self.line;
        match self.peek() {
            '}' => {
                self.advance();
                self.skip_whitespace();
                if !self.is_at_end() && self.peek() == ';' {
                    self.advance();
                }
                Ok(Token::StructEnd { line })
            }
            '{' => {
                self.advance();
                Ok(Token::StructStart {
                    name: None,
                    array: None,
                    line,
                })
            }
            _ => self.field_or_struct_start(line),
        }
    }

    fn field_or_struct_start(&mut self, line: usize) -> Result<Token, TokenizeError> {
        let byte_order = match self.peek() {
            '<' => {
                self.advance();
                ByteOrder::LittleEndian
            }
            '>' => {
                self.advance();
                ByteOrder::BigEndian
            }
            _ => ByteOrder::BigEndian,
        };
        self.skip_whitespace();

        let first = self.identifier();
        if first.is_empty() {
            return Err(if self.is_at_end() {
                TokenizeError::MissingType(self.line)
            } else {
                TokenizeError::UnexpectedCharacter(self.peek(), self.line)
            });
        }
        self.skip_whitespace();

        let extra = if !self.is_at_end() && self.peek() == ':' {
            self.advance();
            self.skip_whitespace();
            Some(self.extra_value()?)
        } else {
            None
        };
        self.skip_whitespace();

        let array = if !self.is_at_end() && self.peek() == '[' {
            Some(self.array_size()?)
        } else {
            None
        };
        self.skip_whitespace();

        let second = self.identifier();
        let second = if second.is_empty() { None } else { Some(second) };
        self.skip_whitespace();

        if self.is_at_end() {
            return Err(TokenizeError::MissingTerminator(self.line));
        }
        match self.peek() {
            ';' => {
                self.advance();
                Ok(Token::Field(FieldToken {
                    byte_order,
                    type_name: first,
                    extra,
                    array,
                    name: second,
                    line,
                }))
            }
            '{' if extra.is_none() && second.is_none() => {
                self.advance();
                Ok(Token::StructStart {
                    name: Some(first),
                    array,
                    line,
                })
            }
            other => Err(TokenizeError::UnexpectedCharacter(other, self.line)),
        }
    }

    fn extra_value(&mut self) -> Result<ExtraValue, TokenizeError> {
        if !self.is_at_end() && self.peek() == '(' {
            Ok(ExtraValue::Expression(self.parenthesized_text()?))
        } else {
            Ok(ExtraValue::Literal(self.int_literal()?))
        }
    }

    /// Capture the text between balanced parentheses, parens excluded.
    fn parenthesized_text(&mut self) -> Result<String, TokenizeError> {
        let start_line = self.line;
        self.advance(); // consume '('
        let mut text = String::new();
        let mut depth = 1;
        while !self.is_at_end() {
            let ch = self.advance();
            match ch {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(text);
                    }
                }
                '\n' => self.line += 1,
                _ => {}
            }
            text.push(ch);
        }
        Err(TokenizeError::Unterminated('(', start_line))
    }

    fn array_size(&mut self) -> Result<ArraySize, TokenizeError> {
        let start_line = self.line;
        self.advance(); // consume '['
        let mut text = String::new();
        loop {
            if self.is_at_end() {
                return Err(TokenizeError::Unterminated('[', start_line));
            }
            let ch = self.advance();
            if ch == ']' {
                break;
            }
            if ch == '\n' {
                self.line += 1;
            }
            text.push(ch);
        }
        let trimmed = text.trim();
        if trimmed == "_" {
            Ok(ArraySize::WholeStream)
        } else if let Some(value) = parse_int(trimmed) {
            Ok(ArraySize::Literal(value))
        } else {
            Ok(ArraySize::Expression(trimmed.to_string()))
        }
    }

    fn int_literal(&mut self) -> Result<i32, TokenizeError> {
        let mut text = String::new();
        if !self.is_at_end() && self.peek() == '-' {
            text.push(self.advance());
        }
        while !self.is_at_end() && (self.peek().is_ascii_alphanumeric()) {
            text.push(self.advance());
        }
        parse_int(&text).ok_or_else(|| TokenizeError::BadLiteral(text, self.line))
    }

    fn identifier(&mut self) -> String {
        let mut ident = String::new();
        while !self.is_at_end() {
            let ch = self.peek();
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '$' {
                ident.push(self.advance());
            } else {
                break;
            }
        }
        ident
    }

    fn skip_whitespace(&mut self) {
        while !self.is_at_end() {
            match self.peek() {
                ' ' | '\r' | '\t' => {
                    self.advance();
                }
                '\n' => {
                    self.line += 1;
                    self.advance();
                }
                '/' if self.peek_next() == Some('/') => {
                    while !self.is_at_end() && self.peek() != '\n' {
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn advance(&mut self) -> char {
        let ch = self.input[self.position];
        self.position += 1;
        ch
    }

    fn peek(&self) -> char {
        self.input[self.position]
    }

    fn peek_next(&self) -> Option<char> {
        self.input.get(self.position + 1).copied()
    }

    fn is_at_end(&self) -> bool {
        self.position >= self.input.len()
    }
}

fn parse_int(text: &str) -> Option<i32> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok().map(|v| v as i32)
    } else {
        text.parse::<i32>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenize(script: &str) -> Vec<Token> {
        Tokenizer::new(script).tokenize().unwrap()
    }

    #[test]
    fn test_simple_fields() {
        let tokens = tokenize("int length; byte data;");
        assert_eq!(tokens.len(), 2);
        match &tokens[0] {
            Token::Field(f) => {
                assert_eq!(f.type_name, "int");
                assert_eq!(f.name.as_deref(), Some("length"));
                assert_eq!(f.byte_order, ByteOrder::BigEndian);
                assert!(f.array.is_none());
                assert!(f.extra.is_none());
            }
            other => panic!("expected field, got {:?}", other),
        }
    }

    #[test]
    fn test_byte_order_prefixes() {
        let tokens = tokenize("<int a; >short b;");
        match (&tokens[0], &tokens[1]) {
            (Token::Field(a), Token::Field(b)) => {
                assert_eq!(a.byte_order, ByteOrder::LittleEndian);
                assert_eq!(b.byte_order, ByteOrder::BigEndian);
            }
            other => panic!("expected two fields, got {:?}", other),
        }
    }

    #[test]
    fn test_unnamed_field() {
        let tokens = tokenize("ushort;");
        match &tokens[0] {
            Token::Field(f) => {
                assert_eq!(f.type_name, "ushort");
                assert!(f.name.is_none());
            }
            other => panic!("expected field, got {:?}", other),
        }
    }

    #[test]
    fn test_bit_width_extra() {
        let tokens = tokenize("bit:4 nibble; bit:(a + 1) dynamic;");
        match &tokens[0] {
            Token::Field(f) => assert_eq!(f.extra, Some(ExtraValue::Literal(4))),
            other => panic!("expected field, got {:?}", other),
        }
        match &tokens[1] {
            Token::Field(f) => {
                assert_eq!(f.extra, Some(ExtraValue::Expression("a + 1".to_string())))
            }
            other => panic!("expected field, got {:?}", other),
        }
    }

    #[test]
    fn test_array_suffixes() {
        let tokens = tokenize("byte[16] fixed; byte[_] rest; byte[len * 2] sized;");
        match &tokens[0] {
            Token::Field(f) => assert_eq!(f.array, Some(ArraySize::Literal(16))),
            other => panic!("unexpected {:?}", other),
        }
        match &tokens[1] {
            Token::Field(f) => assert_eq!(f.array, Some(ArraySize::WholeStream)),
            other => panic!("unexpected {:?}", other),
        }
        match &tokens[2] {
            Token::Field(f) => {
                assert_eq!(f.array, Some(ArraySize::Expression("len * 2".to_string())))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_hex_array_literal() {
        let tokens = tokenize("byte[0x10] data;");
        match &tokens[0] {
            Token::Field(f) => assert_eq!(f.array, Some(ArraySize::Literal(16))),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_struct_tokens() {
        let tokens = tokenize("chunk[_]{int length; int type;}");
        assert_eq!(tokens.len(), 4);
        match &tokens[0] {
            Token::StructStart { name, array, .. } => {
                assert_eq!(name.as_deref(), Some("chunk"));
                assert_eq!(*array, Some(ArraySize::WholeStream));
            }
            other => panic!("expected struct start, got {:?}", other),
        }
        assert!(matches!(tokens[3], Token::StructEnd { .. }));
    }

    #[test]
    fn test_anonymous_struct() {
        let tokens = tokenize("{ byte a; }");
        match &tokens[0] {
            Token::StructStart { name, array, .. } => {
                assert!(name.is_none());
                assert!(array.is_none());
            }
            other => panic!("expected struct start, got {:?}", other),
        }
    }

    #[test]
    fn test_struct_end_with_semicolon() {
        let tokens = tokenize("s { byte a; };");
        assert_eq!(tokens.len(), 3);
        assert!(matches!(tokens[2], Token::StructEnd { .. }));
    }

    #[test]
    fn test_directives() {
        let tokens = tokenize("align:2; skip:4; reset$$;");
        let names: Vec<&str> = tokens
            .iter()
            .map(|t| match t {
                Token::Field(f) => f.type_name.as_str(),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(names, vec!["align", "skip", "reset$$"]);
    }

    #[test]
    fn test_comments_are_skipped() {
        let tokens = tokenize("// leading comment\nint a; // trailing\nbyte b;");
        assert_eq!(tokens.len(), 2);
    }

    #[test]
    fn test_line_tracking() {
        let tokens = tokenize("int a;\n\nbyte b;");
        match &tokens[1] {
            Token::Field(f) => assert_eq!(f.line, 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_nested_parens_in_extra() {
        let tokens = tokenize("bit:((a + 1) * 2) f;");
        match &tokens[0] {
            Token::Field(f) => {
                assert_eq!(
                    f.extra,
                    Some(ExtraValue::Expression("(a + 1) * 2".to_string()))
                )
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            Tokenizer::new("int a").tokenize(),
            Err(TokenizeError::MissingTerminator(_))
        ));
        assert!(matches!(
            Tokenizer::new("byte[3 data;").tokenize(),
            Err(TokenizeError::Unterminated('[', _))
        ));
        assert!(matches!(
            Tokenizer::new("bit:(1 f;").tokenize(),
            Err(TokenizeError::Unterminated('(', _))
        ));
        assert!(matches!(
            Tokenizer::new("# weird").tokenize(),
            Err(TokenizeError::UnexpectedCharacter('#', _))
        ));
        assert!(matches!(
            Tokenizer::new("bit:x9 f;").tokenize(),
            Err(TokenizeError::BadLiteral(_, _))
        ));
    }

    #[test]
    fn test_whitespace_shapes() {
        let tokens = tokenize("  <  int   ChunkID ;\n\tbyte [ 4 ]  tag ;");
        assert_eq!(tokens.len(), 2);
        match &tokens[1] {
            Token::Field(f) => {
                assert_eq!(f.array, Some(ArraySize::Literal(4)));
                assert_eq!(f.name.as_deref(), Some("tag"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}

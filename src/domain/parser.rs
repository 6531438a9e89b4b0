//! Parser for data-binding ("Magic Text") expressions.
//!
//! Component props may embed references to tables, table fields, or the
//! current item of an enclosing repeater inside `{{ }}` markers. This module
//! turns that text into a [`Binding`] value. Bindings are plain data and are
//! resolved later by [`crate::domain::BindingResolver`]; nothing here is ever
//! evaluated as code.
//!
//! # Grammar
//!
//! ```bnf
//! Text       ::= ( Literal | "{{" Reference "}}" )*
//! Reference  ::= "item" ( "." Name )?
//!              | Name ( "[" Number "]" )? ( "." Name )?
//! Name       ::= Identifier | QuotedString
//! Identifier ::= [A-Za-z_][A-Za-z0-9_-]*
//! Number     ::= [0-9]+
//! ```
//!
//! A text made of a single reference and nothing else yields that reference
//! directly, so `{{ Users }}` resolves to the table's records rather than to
//! their string rendering.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::{DomainError, DomainResult};

/// Name of the loop variable a repeater exposes to its children.
pub const REPEATER_ITEM: &str = "item";

/// A data-binding expression attached to a component prop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Binding {
    /// Plain text or a fixed value.
    Literal { value: Value },
    /// All records of a table in the current app.
    TableReference { table: String },
    /// One field of a table: a single row when `row` is set, otherwise the whole column.
    FieldReference {
        table: String,
        field: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        row: Option<usize>,
    },
    /// The current item of the enclosing repeater, or one of its fields.
    RepeaterItemReference {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },
    /// Literal text interleaved with references, rendered to a string.
    Template { parts: Vec<Binding> },
}

impl Binding {
    /// Parses prop text into a binding.
    ///
    /// # Examples
    ///
    /// ```
    /// use pagecraft::domain::Binding;
    ///
    /// let binding = Binding::parse("{{ Users.email }}").unwrap();
    /// assert_eq!(
    ///     binding,
    ///     Binding::FieldReference { table: "Users".into(), field: "email".into(), row: None }
    /// );
    ///
    /// let greeting = Binding::parse("Hello {{ item.name }}!").unwrap();
    /// assert!(matches!(greeting, Binding::Template { .. }));
    /// ```
    pub fn parse(input: &str) -> DomainResult<Binding> {
        let mut parts = Vec::new();
        let mut rest = input;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                parts.push(Binding::Literal { value: Value::from(&rest[..start]) });
            }
            let after_open = &rest[start + 2..];
            let end = after_open
                .find("}}")
                .ok_or_else(|| DomainError::binding(format!("unterminated '{{{{' in '{input}'")))?;
            let mut parser = Parser::new(&after_open[..end]).map_err(DomainError::Binding)?;
            parts.push(parser.parse().map_err(DomainError::Binding)?);
            rest = &after_open[end + 2..];
        }
        if !rest.is_empty() {
            parts.push(Binding::Literal { value: Value::from(rest) });
        }

        match parts.len() {
            0 => Ok(Binding::Literal { value: Value::from("") }),
            1 => Ok(parts.remove(0)),
            _ => Ok(Binding::Template { parts }),
        }
    }

    /// Names of every table this binding reads from.
    pub fn referenced_tables(&self) -> Vec<&str> {
        match self {
            Binding::TableReference { table } | Binding::FieldReference { table, .. } => {
                vec![table]
            }
            Binding::Template { parts } => {
                parts.iter().flat_map(|p| p.referenced_tables()).collect()
            }
            Binding::Literal { .. } | Binding::RepeaterItemReference { .. } => Vec::new(),
        }
    }
}

fn write_name(f: &mut fmt::Formatter<'_>, name: &str) -> fmt::Result {
    let plain = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        && name != REPEATER_ITEM;
    if plain {
        f.write_str(name)
    } else {
        write!(f, "\"{}\"", name.replace('"', "\\\""))
    }
}

/// Writes the binding back in the text form accepted by [`Binding::parse`].
impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Literal { value: Value::String(text) } => f.write_str(text),
            Binding::Literal { value } => write!(f, "{value}"),
            Binding::TableReference { table } => {
                f.write_str("{{ ")?;
                write_name(f, table)?;
                f.write_str(" }}")
            }
            Binding::FieldReference { table, field, row } => {
                f.write_str("{{ ")?;
                write_name(f, table)?;
                if let Some(row) = row {
                    write!(f, "[{row}]")?;
                }
                f.write_str(".")?;
                write_name(f, field)?;
                f.write_str(" }}")
            }
            Binding::RepeaterItemReference { field } => {
                f.write_str("{{ item")?;
                if let Some(field) = field {
                    f.write_str(".")?;
                    write_name(f, field)?;
                }
                f.write_str(" }}")
            }
            Binding::Template { parts } => parts.iter().try_for_each(|part| write!(f, "{part}")),
        }
    }
}

/// Represents a token inside a `{{ }}` reference.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Identifier(String),
    Quoted(String),
    Number(usize),
    Dot,
    LeftBracket,
    RightBracket,
    Eof,
}

/// Lexical analyzer for reference expressions.
pub struct Lexer {
    input: Vec<char>,
    position: usize,
    current_char: Option<char>,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        let chars: Vec<char> = input.chars().collect();
        let current_char = chars.first().copied();

        Self {
            input: chars,
            position: 0,
            current_char,
        }
    }

    fn advance(&mut self) {
        self.position += 1;
        self.current_char = self.input.get(self.position).copied();
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current_char {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_number(&mut self) -> Result<usize, String> {
        let mut digits = String::new();
        while let Some(ch) = self.current_char {
            if ch.is_ascii_digit() {
                digits.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        digits
            .parse::<usize>()
            .map_err(|_| format!("Invalid row index: {digits}"))
    }

    fn read_identifier(&mut self) -> String {
        let mut identifier = String::new();
        while let Some(ch) = self.current_char {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                identifier.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        identifier
    }

    fn read_quoted(&mut self, quote: char) -> Result<String, String> {
        self.advance();
        let mut text = String::new();
        loop {
            match self.current_char {
                None => return Err(format!("Unterminated string: {quote}{text}")),
                Some('\\') => {
                    self.advance();
                    if let Some(escaped) = self.current_char {
                        text.push(escaped);
                        self.advance();
                    }
                }
                Some(ch) if ch == quote => {
                    self.advance();
                    return Ok(text);
                }
                Some(ch) => {
                    text.push(ch);
                    self.advance();
                }
            }
        }
    }

    pub fn next_token(&mut self) -> Result<Token, String> {
        self.skip_whitespace();

        match self.current_char {
            None => Ok(Token::Eof),
            Some(ch) => match ch {
                '0'..='9' => Ok(Token::Number(self.read_number()?)),
                'a'..='z' | 'A'..='Z' | '_' => Ok(Token::Identifier(self.read_identifier())),
                '"' | '\'' => Ok(Token::Quoted(self.read_quoted(ch)?)),
                '.' => {
                    self.advance();
                    Ok(Token::Dot)
                }
                '[' => {
                    self.advance();
                    Ok(Token::LeftBracket)
                }
                ']' => {
                    self.advance();
                    Ok(Token::RightBracket)
                }
                _ => Err(format!("Unexpected character: {ch}")),
            },
        }
    }
}

/// Recursive descent parser for a single reference.
pub struct Parser {
    lexer: Lexer,
    current_token: Token,
}

impl Parser {
    pub fn new(input: &str) -> Result<Self, String> {
        let mut lexer = Lexer::new(input);
        let current_token = lexer.next_token()?;

        Ok(Self {
            lexer,
            current_token,
        })
    }

    fn advance(&mut self) -> Result<(), String> {
        self.current_token = self.lexer.next_token()?;
        Ok(())
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        if std::mem::discriminant(&self.current_token) == std::mem::discriminant(&expected) {
            self.advance()
        } else {
            Err(format!("Expected {:?}, found {:?}", expected, self.current_token))
        }
    }

    pub fn parse(&mut self) -> Result<Binding, String> {
        let binding = self.parse_reference()?;

        if self.current_token != Token::Eof {
            return Err(format!("Unexpected token at end: {:?}", self.current_token));
        }

        Ok(binding)
    }

    fn parse_reference(&mut self) -> Result<Binding, String> {
        let is_item = self.current_token == Token::Identifier(REPEATER_ITEM.to_string());
        let head = self.parse_name()?;

        if is_item {
            let field = self.parse_field()?;
            return Ok(Binding::RepeaterItemReference { field });
        }

        let row = if self.current_token == Token::LeftBracket {
            self.advance()?;
            let row = match self.current_token {
                Token::Number(row) => row,
                ref other => return Err(format!("Expected row index, found {other:?}")),
            };
            self.advance()?;
            self.expect(Token::RightBracket)?;
            Some(row)
        } else {
            None
        };

        match (self.parse_field()?, row) {
            (Some(field), row) => Ok(Binding::FieldReference { table: head, field, row }),
            (None, None) => Ok(Binding::TableReference { table: head }),
            (None, Some(_)) => Err(format!("Row index on '{head}' needs a field")),
        }
    }

    fn parse_field(&mut self) -> Result<Option<String>, String> {
        if self.current_token == Token::Dot {
            self.advance()?;
            Ok(Some(self.parse_name()?))
        } else {
            Ok(None)
        }
    }

    fn parse_name(&mut self) -> Result<String, String> {
        match &self.current_token {
            Token::Identifier(name) | Token::Quoted(name) => {
                let name = name.clone();
                self.advance()?;
                Ok(name)
            }
            other => Err(format!("Expected a name, found {other:?}")),
        }
    }
}

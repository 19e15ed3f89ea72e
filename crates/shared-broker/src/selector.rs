//! # Message Selectors
//!
//! A subset of the SQL-92 conditional expression syntax used by message
//! selectors:
//!
//! ```text
//! expr     := and_expr ( OR and_expr )*
//! and_expr := not_expr ( AND not_expr )*
//! not_expr := NOT not_expr | primary
//! primary  := '(' expr ')'
//!           | ident ( '=' | '<>' ) literal
//!           | ident [NOT] IN '(' literal ( ',' literal )* ')'
//!           | ident IS [NOT] NULL
//! literal  := 'string' | integer | TRUE | FALSE
//! ```
//!
//! Identifiers `JMSCorrelationID`, `JMSMessageID` and `JMSType` refer to
//! message header fields; anything else names an application property.
//! Evaluation uses three-valued logic: a comparison against a missing value is
//! unknown, and a message only matches when the whole expression is true.

use crate::message::{BrokerMessage, PropertyValue};
use std::fmt;
use thiserror::Error;

/// Selector parse errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectorError {
    #[error("empty selector")]
    Empty,
    #[error("unterminated string literal at offset {0}")]
    UnterminatedString(usize),
    #[error("unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },
    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),
    #[error("unexpected end of selector")]
    UnexpectedEnd,
    #[error("invalid integer literal '{0}'")]
    InvalidInteger(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Eq,
    Ne,
    LParen,
    RParen,
    Comma,
    And,
    Or,
    Not,
    In,
    Is,
    Null,
    True,
    False,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "{s}"),
            Token::Str(s) => write!(f, "'{s}'"),
            Token::Int(i) => write!(f, "{i}"),
            Token::Eq => write!(f, "="),
            Token::Ne => write!(f, "<>"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Comma => write!(f, ","),
            Token::And => write!(f, "AND"),
            Token::Or => write!(f, "OR"),
            Token::Not => write!(f, "NOT"),
            Token::In => write!(f, "IN"),
            Token::Is => write!(f, "IS"),
            Token::Null => write!(f, "NULL"),
            Token::True => write!(f, "TRUE"),
            Token::False => write!(f, "FALSE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Str(String),
    Int(i64),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare {
        ident: String,
        equal: bool,
        value: Literal,
    },
    In {
        ident: String,
        values: Vec<Literal>,
        negated: bool,
    },
    IsNull {
        ident: String,
        negated: bool,
    },
}

/// A parsed message selector.
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    source: String,
    expr: Expr,
}

impl Selector {
    /// Parse a selector expression.
    pub fn parse(source: &str) -> Result<Self, SelectorError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(SelectorError::Empty);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(SelectorError::UnexpectedToken(token.to_string()));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// Selector matching a single correlation id.
    pub fn for_correlation_id(correlation_id: &str) -> Self {
        Self {
            source: format!("JMSCorrelationID = '{}'", correlation_id.replace('\'', "''")),
            expr: Expr::Compare {
                ident: "JMSCorrelationID".into(),
                equal: true,
                value: Literal::Str(correlation_id.to_string()),
            },
        }
    }

    /// The expression as written.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the message satisfies the selector.
    #[must_use]
    pub fn matches(&self, message: &BrokerMessage) -> bool {
        eval(&self.expr, message) == Some(true)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, SelectorError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        match ch {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Eq);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'>') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '\'' => {
                let start = i;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(SelectorError::UnterminatedString(start)),
                        // '' escapes a quote inside a literal
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            value.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(c) => {
                            value.push(*c);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let start = i;
                i += 1;
                while chars.get(i).is_some_and(char::is_ascii_digit) {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<i64>()
                    .map_err(|_| SelectorError::InvalidInteger(text.clone()))?;
                tokens.push(Token::Int(value));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while chars
                    .get(i)
                    .is_some_and(|c| c.is_alphanumeric() || matches!(c, '_' | '$' | '.'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(keyword_or_ident(word));
            }
            other => {
                return Err(SelectorError::UnexpectedChar {
                    ch: other,
                    offset: i,
                })
            }
        }
    }

    Ok(tokens)
}

fn keyword_or_ident(word: String) -> Token {
    match word.to_ascii_uppercase().as_str() {
        "AND" => Token::And,
        "OR" => Token::Or,
        "NOT" => Token::Not,
        "IN" => Token::In,
        "IS" => Token::Is,
        "NULL" => Token::Null,
        "TRUE" => Token::True,
        "FALSE" => Token::False,
        _ => Token::Ident(word),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token, SelectorError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(SelectorError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: &Token) -> Result<(), SelectorError> {
        let token = self.next()?;
        if &token == expected {
            Ok(())
        } else {
            Err(SelectorError::UnexpectedToken(token.to_string()))
        }
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Expr, SelectorError> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, SelectorError> {
        let mut left = self.parse_not()?;
        while self.eat(&Token::And) {
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, SelectorError> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, SelectorError> {
        match self.next()? {
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(ident) => self.parse_predicate(ident),
            other => Err(SelectorError::UnexpectedToken(other.to_string())),
        }
    }

    fn parse_predicate(&mut self, ident: String) -> Result<Expr, SelectorError> {
        match self.next()? {
            Token::Eq => Ok(Expr::Compare {
                ident,
                equal: true,
                value: self.parse_literal()?,
            }),
            Token::Ne => Ok(Expr::Compare {
                ident,
                equal: false,
                value: self.parse_literal()?,
            }),
            Token::In => self.parse_in(ident, false),
            Token::Not => {
                self.expect(&Token::In)?;
                self.parse_in(ident, true)
            }
            Token::Is => {
                let negated = self.eat(&Token::Not);
                self.expect(&Token::Null)?;
                Ok(Expr::IsNull { ident, negated })
            }
            other => Err(SelectorError::UnexpectedToken(other.to_string())),
        }
    }

    fn parse_in(&mut self, ident: String, negated: bool) -> Result<Expr, SelectorError> {
        self.expect(&Token::LParen)?;
        let mut values = vec![self.parse_literal()?];
        while self.eat(&Token::Comma) {
            values.push(self.parse_literal()?);
        }
        self.expect(&Token::RParen)?;
        Ok(Expr::In {
            ident,
            values,
            negated,
        })
    }

    fn parse_literal(&mut self) -> Result<Literal, SelectorError> {
        match self.next()? {
            Token::Str(s) => Ok(Literal::Str(s)),
            Token::Int(i) => Ok(Literal::Int(i)),
            Token::True => Ok(Literal::Bool(true)),
            Token::False => Ok(Literal::Bool(false)),
            other => Err(SelectorError::UnexpectedToken(other.to_string())),
        }
    }
}

fn lookup(ident: &str, message: &BrokerMessage) -> Option<PropertyValue> {
    match ident {
        "JMSCorrelationID" => message
            .correlation_id
            .as_ref()
            .map(|c| PropertyValue::String(c.clone())),
        "JMSMessageID" => Some(PropertyValue::String(message.message_id.clone())),
        "JMSType" => message
            .message_type
            .as_ref()
            .map(|t| PropertyValue::String(t.clone())),
        _ => message.properties.get(ident).cloned(),
    }
}

fn literal_eq(value: &PropertyValue, literal: &Literal) -> Option<bool> {
    match (value, literal) {
        (PropertyValue::String(a), Literal::Str(b)) => Some(a == b),
        (PropertyValue::Int(a), Literal::Int(b)) => Some(a == b),
        (PropertyValue::Double(a), Literal::Int(b)) => Some(*a == *b as f64),
        (PropertyValue::Bool(a), Literal::Bool(b)) => Some(a == b),
        // type mismatch is unknown, not false
        _ => None,
    }
}

fn eval(expr: &Expr, message: &BrokerMessage) -> Option<bool> {
    match expr {
        Expr::And(l, r) => match (eval(l, message), eval(r, message)) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), Some(true)) => Some(true),
            _ => None,
        },
        Expr::Or(l, r) => match (eval(l, message), eval(r, message)) {
            (Some(true), _) | (_, Some(true)) => Some(true),
            (Some(false), Some(false)) => Some(false),
            _ => None,
        },
        Expr::Not(inner) => eval(inner, message).map(|v| !v),
        Expr::Compare {
            ident,
            equal,
            value,
        } => {
            let actual = lookup(ident, message)?;
            literal_eq(&actual, value).map(|eq| eq == *equal)
        }
        Expr::In {
            ident,
            values,
            negated,
        } => {
            let actual = lookup(ident, message)?;
            let found = values
                .iter()
                .any(|literal| literal_eq(&actual, literal) == Some(true));
            Some(found != *negated)
        }
        Expr::IsNull { ident, negated } => {
            let is_null = lookup(ident, message).is_none();
            Some(is_null != *negated)
        }
    }
}

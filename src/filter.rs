//! Bibliography filter expressions.
//!
//! Parses the `:filter:` option of a bibliography directive into a small
//! expression tree, evaluated per entry at render time. Supported syntax:
//! `and`, `or`, `not`, `==`, `!=`, `in` (substring), parentheses, string
//! literals, and identifiers resolved against the entry being tested.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bibfile::Entry;

/// Errors from parsing or evaluating a filter expression.
#[derive(Error, Debug, PartialEq)]
pub enum FilterError {
    #[error("unexpected character '{found}' at position {pos}")]
    UnexpectedChar { pos: usize, found: char },

    #[error("unterminated string literal at position {pos}")]
    UnterminatedString { pos: usize },

    #[error("unexpected token '{found}'")]
    UnexpectedToken { found: String },

    #[error("unexpected end of filter expression")]
    UnexpectedEnd,

    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
}

/// A parsed filter expression.
///
/// Stored inside the build cache, so this is plain data with no references
/// into the source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterExpr {
    And(Box<FilterExpr>, Box<FilterExpr>),
    Or(Box<FilterExpr>, Box<FilterExpr>),
    Not(Box<FilterExpr>),
    Eq(Box<FilterExpr>, Box<FilterExpr>),
    Ne(Box<FilterExpr>, Box<FilterExpr>),
    /// Substring test: left appears within right.
    In(Box<FilterExpr>, Box<FilterExpr>),
    Var(String),
    Str(String),
    Bool(bool),
}

/// The entry an expression is evaluated against.
///
/// `key`, `type`, `docname` and `cited` are builtin variables; any other
/// identifier resolves to the entry field of the same name.
pub struct EntryContext<'a> {
    pub key: &'a str,
    pub entry: &'a Entry,
    pub docname: &'a str,
    pub cited: bool,
}

/// Intermediate evaluation value. Truthiness follows the original filter
/// language: a string is truthy when non-empty.
enum Value {
    Str(String),
    Bool(bool),
}

impl Value {
    fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Str(s) => !s.is_empty(),
        }
    }

    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl FilterExpr {
    /// Evaluates the expression against one entry.
    ///
    /// # Errors
    ///
    /// Returns `FilterError::UnknownVariable` if an identifier matches
    /// neither a builtin variable nor a field of the entry.
    pub fn eval(&self, ctx: &EntryContext) -> Result<bool, FilterError> {
        Ok(self.eval_value(ctx)?.truthy())
    }

    fn eval_value(&self, ctx: &EntryContext) -> Result<Value, FilterError> {
        match self {
            FilterExpr::And(lhs, rhs) => Ok(Value::Bool(lhs.eval(ctx)? && rhs.eval(ctx)?)),
            FilterExpr::Or(lhs, rhs) => Ok(Value::Bool(lhs.eval(ctx)? || rhs.eval(ctx)?)),
            FilterExpr::Not(inner) => Ok(Value::Bool(!inner.eval(ctx)?)),
            FilterExpr::Eq(lhs, rhs) => Ok(Value::Bool(
                lhs.eval_value(ctx)?.eq(&rhs.eval_value(ctx)?),
            )),
            FilterExpr::Ne(lhs, rhs) => Ok(Value::Bool(
                !lhs.eval_value(ctx)?.eq(&rhs.eval_value(ctx)?),
            )),
            FilterExpr::In(lhs, rhs) => {
                let needle = lhs.eval_str(ctx)?;
                let haystack = rhs.eval_str(ctx)?;
                Ok(Value::Bool(haystack.contains(&needle)))
            }
            FilterExpr::Var(name) => lookup(name, ctx),
            FilterExpr::Str(s) => Ok(Value::Str(s.clone())),
            FilterExpr::Bool(b) => Ok(Value::Bool(*b)),
        }
    }

    fn eval_str(&self, ctx: &EntryContext) -> Result<String, FilterError> {
        match self.eval_value(ctx)? {
            Value::Str(s) => Ok(s),
            Value::Bool(b) => Ok(b.to_string()),
        }
    }
}

fn lookup(name: &str, ctx: &EntryContext) -> Result<Value, FilterError> {
    match name {
        "key" => Ok(Value::Str(ctx.key.to_string())),
        "type" => Ok(Value::Str(ctx.entry.entry_type.clone())),
        "docname" => Ok(Value::Str(ctx.docname.to_string())),
        "cited" => Ok(Value::Bool(ctx.cited)),
        field => ctx
            .entry
            .fields
            .get(field)
            .map(|v| Value::Str(v.clone()))
            .ok_or_else(|| FilterError::UnknownVariable(field.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    True,
    False,
    And,
    Or,
    Not,
    In,
    Eq,
    Ne,
    LParen,
    RParen,
}

fn tokenize(source: &str) -> Result<Vec<Token>, FilterError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(FilterError::UnexpectedChar { pos: i, found: c });
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    return Err(FilterError::UnexpectedChar { pos: i, found: c });
                }
            }
            '"' | '\'' => {
                let quote = c;
                let start = i;
                i += 1;
                let mut value = String::new();
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                        None => return Err(FilterError::UnterminatedString { pos: start }),
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some(&ch) = chars.get(i) {
                    if ch.is_alphanumeric() || ch == '_' {
                        word.push(ch);
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "true" => Token::True,
                    "false" => Token::False,
                    _ => Token::Ident(word),
                });
            }
            _ => return Err(FilterError::UnexpectedChar { pos: i, found: c }),
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser — recursive descent, lowest precedence first:
//   or < and < not < (==, !=, in) < atom
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

/// Parses a filter expression from its source text.
///
/// # Errors
///
/// Returns a `FilterError` describing the offending token or character.
pub fn parse_filter(source: &str) -> Result<FilterExpr, FilterError> {
    let mut parser = Parser {
        tokens: tokenize(source)?,
        pos: 0,
    };
    let expr = parser.parse_or()?;
    if let Some(token) = parser.peek() {
        return Err(FilterError::UnexpectedToken {
            found: format!("{:?}", token),
        });
    }
    Ok(expr)
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<FilterExpr, FilterError> {
        let mut expr = self.parse_and()?;
        while self.eat(&Token::Or) {
            let rhs = self.parse_and()?;
            expr = FilterExpr::Or(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<FilterExpr, FilterError> {
        let mut expr = self.parse_not()?;
        while self.eat(&Token::And) {
            let rhs = self.parse_not()?;
            expr = FilterExpr::And(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_not(&mut self) -> Result<FilterExpr, FilterError> {
        if self.eat(&Token::Not) {
            let inner = self.parse_not()?;
            return Ok(FilterExpr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<FilterExpr, FilterError> {
        let lhs = self.parse_atom()?;
        let op = match self.peek() {
            Some(Token::Eq) => Token::Eq,
            Some(Token::Ne) => Token::Ne,
            Some(Token::In) => Token::In,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.parse_atom()?;
        Ok(match op {
            Token::Eq => FilterExpr::Eq(Box::new(lhs), Box::new(rhs)),
            Token::Ne => FilterExpr::Ne(Box::new(lhs), Box::new(rhs)),
            _ => FilterExpr::In(Box::new(lhs), Box::new(rhs)),
        })
    }

    fn parse_atom(&mut self) -> Result<FilterExpr, FilterError> {
        match self.advance() {
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                if !self.eat(&Token::RParen) {
                    return Err(match self.peek() {
                        Some(token) => FilterError::UnexpectedToken {
                            found: format!("{:?}", token),
                        },
                        None => FilterError::UnexpectedEnd,
                    });
                }
                Ok(expr)
            }
            Some(Token::Ident(name)) => Ok(FilterExpr::Var(name)),
            Some(Token::Str(value)) => Ok(FilterExpr::Str(value)),
            Some(Token::True) => Ok(FilterExpr::Bool(true)),
            Some(Token::False) => Ok(FilterExpr::Bool(false)),
            Some(token) => Err(FilterError::UnexpectedToken {
                found: format!("{:?}", token),
            }),
            None => Err(FilterError::UnexpectedEnd),
        }
    }
}

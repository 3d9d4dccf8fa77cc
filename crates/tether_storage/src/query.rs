//! Predicate language for store lookups.
//!
//! A query is a conjunction of comparisons:
//!
//! ```text
//! ModifiedAt >= '2024-05-01T00:00:00Z' AND Synced = false AND city = 'Oslo'
//! ```
//!
//! Built-in fields are `Id`, `CreatedAt`, `ModifiedAt`, `Archived` and
//! `Synced`; any other identifier names an attribute. Queries render back
//! to the same text, which is how they cross the wire.

use crate::error::{StorageError, StorageResult};
use chrono::{DateTime, SecondsFormat, Utc};
use std::cmp::Ordering;
use std::fmt;
use tether_model::{AttributeValue, Entity, EntityId};

/// The left-hand side of a comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    /// Entity id.
    Id,
    /// Creation time.
    CreatedAt,
    /// Modification time.
    ModifiedAt,
    /// Soft-delete flag.
    Archived,
    /// Sync flag.
    Synced,
    /// Named attribute.
    Attribute(String),
}

impl Field {
    fn from_ident(ident: &str) -> Self {
        match ident {
            "Id" => Field::Id,
            "CreatedAt" => Field::CreatedAt,
            "ModifiedAt" => Field::ModifiedAt,
            "Archived" => Field::Archived,
            "Synced" => Field::Synced,
            other => Field::Attribute(other.to_string()),
        }
    }

    fn name(&self) -> &str {
        match self {
            Field::Id => "Id",
            Field::CreatedAt => "CreatedAt",
            Field::ModifiedAt => "ModifiedAt",
            Field::Archived => "Archived",
            Field::Synced => "Synced",
            Field::Attribute(name) => name,
        }
    }
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `<`
    Lt,
    /// `<=`
    Le,
}

impl Op {
    fn symbol(self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Ne => "!=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Lt => "<",
            Op::Le => "<=",
        }
    }

    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Op::Eq => ordering == Ordering::Equal,
            Op::Ne => ordering != Ordering::Equal,
            Op::Gt => ordering == Ordering::Greater,
            Op::Ge => ordering != Ordering::Less,
            Op::Lt => ordering == Ordering::Less,
            Op::Le => ordering != Ordering::Greater,
        }
    }
}

/// The right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// Quoted text.
    Text(String),
    /// Integer.
    Integer(i64),
    /// Float.
    Float(f64),
    /// `true` / `false`.
    Bool(bool),
    /// Timestamp (quoted RFC 3339 text on the wire).
    Timestamp(DateTime<Utc>),
    /// Identifier (quoted UUID text on the wire).
    Id(EntityId),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Literal::Integer(i) => write!(f, "{i}"),
            Literal::Float(v) => write!(f, "{v:?}"),
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Timestamp(t) => {
                write!(f, "'{}'", t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Literal::Id(id) => write!(f, "'{id}'"),
        }
    }
}

/// One `field op literal` comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Compared field.
    pub field: Field,
    /// Operator.
    pub op: Op,
    /// Compared value.
    pub value: Literal,
}

impl Condition {
    fn matches(&self, entity: &Entity) -> bool {
        let ordering = match (&self.field, &self.value) {
            (Field::Id, Literal::Id(id)) => Some(entity.id.cmp(id)),
            (Field::CreatedAt, Literal::Timestamp(t)) => Some(entity.created_at.cmp(t)),
            (Field::ModifiedAt, Literal::Timestamp(t)) => Some(entity.modified_at.cmp(t)),
            (Field::Archived, Literal::Bool(b)) => Some(entity.archived.cmp(b)),
            (Field::Synced, Literal::Bool(b)) => Some(entity.synced.cmp(b)),
            (Field::Attribute(name), literal) => {
                entity.get(name).and_then(|value| compare(value, literal))
            }
            _ => None,
        };
        ordering.is_some_and(|o| self.op.holds(o))
    }
}

fn compare(value: &AttributeValue, literal: &Literal) -> Option<Ordering> {
    match (value, literal) {
        (AttributeValue::Text(a), Literal::Text(b)) => Some(a.as_str().cmp(b.as_str())),
        (AttributeValue::Integer(a), Literal::Integer(b)) => Some(a.cmp(b)),
        (AttributeValue::Bool(a), Literal::Bool(b)) => Some(a.cmp(b)),
        (AttributeValue::Id(a), Literal::Id(b)) => Some(a.cmp(b)),
        (AttributeValue::Id(a), Literal::Text(b)) => b.parse::<EntityId>().ok().map(|b| a.cmp(&b)),
        (AttributeValue::Timestamp(a), Literal::Timestamp(b)) => Some(a.cmp(b)),
        (AttributeValue::Timestamp(a), Literal::Text(b)) => parse_timestamp(b).map(|b| a.cmp(&b)),
        (value, Literal::Integer(b)) => value.as_float().and_then(|a| a.partial_cmp(&(*b as f64))),
        (value, Literal::Float(b)) => value.as_float().and_then(|a| a.partial_cmp(b)),
        _ => None,
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// A conjunction of conditions. The empty query matches everything.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    conditions: Vec<Condition>,
}

impl Query {
    /// Creates an empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a condition.
    pub fn and(mut self, field: Field, op: Op, value: Literal) -> Self {
        self.conditions.push(Condition { field, op, value });
        self
    }

    /// Entities modified at or after `since`.
    pub fn modified_since(since: DateTime<Utc>) -> Self {
        Self::new().and(Field::ModifiedAt, Op::Ge, Literal::Timestamp(since))
    }

    /// Entities not yet accepted by the remote side.
    pub fn unsynced() -> Self {
        Self::new().and(Field::Synced, Op::Eq, Literal::Bool(false))
    }

    /// Entities that are not archived.
    pub fn live() -> Self {
        Self::new().and(Field::Archived, Op::Eq, Literal::Bool(false))
    }

    /// The conditions of this query.
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Returns true if the query has no conditions.
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Returns true if `entity` satisfies every condition.
    pub fn matches(&self, entity: &Entity) -> bool {
        self.conditions.iter().all(|c| c.matches(entity))
    }

    /// Parses query text.
    pub fn parse(text: &str) -> StorageResult<Self> {
        Parser::new(text).parse()
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, c) in self.conditions.iter().enumerate() {
            if i > 0 {
                f.write_str(" AND ")?;
            }
            write!(f, "{} {} {}", c.field.name(), c.op.symbol(), c.value)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Op(Op),
    Text(String),
    Number(String),
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn parse(mut self) -> StorageResult<Query> {
        let mut query = Query::new();
        self.skip_whitespace();
        if self.pos == self.text.len() {
            return Ok(query);
        }
        loop {
            query.conditions.push(self.condition()?);
            self.skip_whitespace();
            if self.pos == self.text.len() {
                return Ok(query);
            }
            let start = self.pos;
            match self.token()? {
                Token::Ident(word) if word.eq_ignore_ascii_case("and") => {}
                _ => return Err(StorageError::invalid_query(start, "expected AND")),
            }
        }
    }

    fn condition(&mut self) -> StorageResult<Condition> {
        self.skip_whitespace();
        let start = self.pos;
        let field = match self.token()? {
            Token::Ident(name) => Field::from_ident(&name),
            _ => return Err(StorageError::invalid_query(start, "expected field name")),
        };
        self.skip_whitespace();
        let start = self.pos;
        let op = match self.token()? {
            Token::Op(op) => op,
            _ => return Err(StorageError::invalid_query(start, "expected operator")),
        };
        self.skip_whitespace();
        let start = self.pos;
        let raw = self.token()?;
        let value = literal_for(&field, raw)
            .ok_or_else(|| StorageError::invalid_query(start, format!("bad value for {}", field.name())))?;
        Ok(Condition { field, op, value })
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if !c.is_whitespace() {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn token(&mut self) -> StorageResult<Token> {
        self.skip_whitespace();
        let start = self.pos;
        let Some(c) = self.peek() else {
            return Err(StorageError::invalid_query(start, "unexpected end of query"));
        };

        if c == '\'' {
            self.pos += 1;
            let mut out = String::new();
            loop {
                match self.peek() {
                    None => return Err(StorageError::invalid_query(start, "unterminated string")),
                    Some('\'') => {
                        self.pos += 1;
                        if self.peek() == Some('\'') {
                            out.push('\'');
                            self.pos += 1;
                        } else {
                            return Ok(Token::Text(out));
                        }
                    }
                    Some(ch) => {
                        out.push(ch);
                        self.pos += ch.len_utf8();
                    }
                }
            }
        }

        if matches!(c, '=' | '!' | '<' | '>') {
            let rest = &self.text[self.pos..];
            for (symbol, op) in [
                (">=", Op::Ge),
                ("<=", Op::Le),
                ("!=", Op::Ne),
                ("=", Op::Eq),
                (">", Op::Gt),
                ("<", Op::Lt),
            ] {
                if rest.starts_with(symbol) {
                    self.pos += symbol.len();
                    return Ok(Token::Op(op));
                }
            }
            return Err(StorageError::invalid_query(start, "unknown operator"));
        }

        if c.is_ascii_digit() || c == '-' {
            let len = self.text[self.pos..]
                .find(|ch: char| !(ch.is_ascii_digit() || ch == '-' || ch == '.'))
                .unwrap_or(self.text.len() - self.pos);
            let number = self.text[self.pos..self.pos + len].to_string();
            self.pos += len;
            return Ok(Token::Number(number));
        }

        if c.is_alphabetic() || c == '_' {
            let len = self.text[self.pos..]
                .find(|ch: char| !(ch.is_alphanumeric() || ch == '_' || ch == '.'))
                .unwrap_or(self.text.len() - self.pos);
            let ident = self.text[self.pos..self.pos + len].to_string();
            self.pos += len;
            return Ok(Token::Ident(ident));
        }

        Err(StorageError::invalid_query(start, format!("unexpected character '{c}'")))
    }
}

fn literal_for(field: &Field, token: Token) -> Option<Literal> {
    match (field, token) {
        (Field::Id, Token::Text(s)) => s.parse().ok().map(Literal::Id),
        (Field::CreatedAt | Field::ModifiedAt, Token::Text(s)) => {
            parse_timestamp(&s).map(Literal::Timestamp)
        }
        (Field::Archived | Field::Synced, Token::Ident(word)) => parse_bool(&word),
        (Field::Attribute(_), Token::Text(s)) => Some(Literal::Text(s)),
        (Field::Attribute(_), Token::Ident(word)) => parse_bool(&word),
        (Field::Attribute(_), Token::Number(n)) => n
            .parse()
            .map(Literal::Integer)
            .ok()
            .or_else(|| n.parse().ok().map(Literal::Float)),
        _ => None,
    }
}

fn parse_bool(word: &str) -> Option<Literal> {
    if word.eq_ignore_ascii_case("true") {
        Some(Literal::Bool(true))
    } else if word.eq_ignore_ascii_case("false") {
        Some(Literal::Bool(false))
    } else {
        None
    }
}

//! Guard evaluation.
//!
//! A transition guard is either a named predicate registered with the
//! machine's implementations, or an inline expression evaluated against the
//! context and the triggering event:
//!
//! - `ctx.field` / `event.field` - field access (truthy check)
//! - `ctx.field.nested` - nested field access
//! - `event.type` - the event's type tag
//! - `ctx.field == value` - equality (strings, numbers, booleans, null)
//! - `ctx.field != value` - inequality
//! - `ctx.field > value`, `>=`, `<`, `<=` - numeric comparisons
//! - `!expr` - logical NOT
//! - `expr && expr` - logical AND (higher precedence than OR)
//! - `expr || expr` - logical OR
//! - `(expr)` - grouping for precedence control
//!
//! In a definition:
//!
//! ```json
//! {"guard": "isAuthorized"}
//! {"guard": {"expr": "ctx.amount > 100 && event.approved"}}
//! {"guard": {"not": "isAuthorized"}}
//! ```

use crate::error::{CoreError, GuardError};
use crate::event::Event;
use crate::implementations::Implementations;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Named guard predicate.
pub type GuardFn = Arc<dyn Fn(&Value, &Event) -> Result<bool, GuardError> + Send + Sync>;

/// Guard as written in a definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GuardConfig {
    Named(String),
    Expr { expr: String },
    Not { not: Box<GuardConfig> },
}

/// A resolved guard, ready for evaluation.
#[derive(Clone)]
pub enum Guard {
    Expr(GuardExpr),
    Named { name: String, predicate: GuardFn },
    Not(Box<Guard>),
}

impl Guard {
    /// Resolves a guard config against the registered implementations.
    pub fn resolve(config: &GuardConfig, impls: &Implementations) -> Result<Self, CoreError> {
        match config {
            GuardConfig::Named(name) => {
                let predicate =
                    impls
                        .guard(name)
                        .ok_or_else(|| CoreError::UnresolvedImplementation {
                            kind: "guard",
                            name: name.clone(),
                        })?;
                Ok(Guard::Named {
                    name: name.clone(),
                    predicate,
                })
            }
            GuardConfig::Expr { expr } => Ok(Guard::Expr(GuardExpr::parse(expr)?)),
            GuardConfig::Not { not } => Ok(Guard::Not(Box::new(Guard::resolve(not, impls)?))),
        }
    }

    /// Evaluates the guard.
    pub fn check(&self, ctx: &Value, event: &Event) -> Result<bool, GuardError> {
        match self {
            Guard::Expr(expr) => Ok(expr.evaluate(ctx, event)),
            Guard::Named { predicate, .. } => predicate(ctx, event),
            Guard::Not(inner) => inner.check(ctx, event).map(|v| !v),
        }
    }

    /// Human-readable name for logs.
    pub fn describe(&self) -> String {
        match self {
            Guard::Expr(expr) => format!("{:?}", expr),
            Guard::Named { name, .. } => name.clone(),
            Guard::Not(inner) => format!("!{}", inner.describe()),
        }
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guard({})", self.describe())
    }
}

/// Where a field reference is looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Context,
    Event,
}

/// A dotted field path in either the context or the event payload.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRef {
    pub scope: Scope,
    pub path: String,
}

impl FieldRef {
    fn resolve(&self, ctx: &Value, event: &Event) -> Value {
        match self.scope {
            Scope::Context => get_field(ctx, &self.path),
            Scope::Event if self.path == "type" => Value::String(event.event_type.clone()),
            Scope::Event => get_field(&event.data, &self.path),
        }
    }
}

/// Comparison operator in a guard expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CmpOp {
    fn holds(self, left: &Value, right: &Value) -> bool {
        match self {
            CmpOp::Eq => values_equal(left, right),
            CmpOp::Ne => !values_equal(left, right),
            _ => match (left.as_f64(), right.as_f64()) {
                (Some(l), Some(r)) => match self {
                    CmpOp::Gt => l > r,
                    CmpOp::Ge => l >= r,
                    CmpOp::Lt => l < r,
                    _ => l <= r,
                },
                _ => false,
            },
        }
    }

    fn is_ordering(self) -> bool {
        !matches!(self, CmpOp::Eq | CmpOp::Ne)
    }
}

/// A parsed guard expression.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardExpr {
    /// Field is truthy.
    Truthy(FieldRef),
    /// Field compared with a literal. Ordering operators need numbers.
    Compare(FieldRef, CmpOp, Value),
    All(Box<GuardExpr>, Box<GuardExpr>),
    Any(Box<GuardExpr>, Box<GuardExpr>),
    Not(Box<GuardExpr>),
}

impl GuardExpr {
    /// Parses a guard expression.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let tokens = tokenize(s)?;
        if tokens.is_empty() {
            return Err(invalid("empty guard expression"));
        }

        let mut parser = TokenParser { tokens, pos: 0 };
        let expr = parser.disjunction()?;
        if let Some(token) = parser.tokens.get(parser.pos) {
            return Err(invalid(format!("unexpected {:?} in '{}'", token, s.trim())));
        }
        Ok(expr)
    }

    /// Evaluates the expression against a context and event.
    pub fn evaluate(&self, ctx: &Value, event: &Event) -> bool {
        match self {
            GuardExpr::Truthy(field) => is_truthy(&field.resolve(ctx, event)),
            GuardExpr::Compare(field, op, literal) => op.holds(&field.resolve(ctx, event), literal),
            GuardExpr::All(a, b) => a.evaluate(ctx, event) && b.evaluate(ctx, event),
            GuardExpr::Any(a, b) => a.evaluate(ctx, event) || b.evaluate(ctx, event),
            GuardExpr::Not(inner) => !inner.evaluate(ctx, event),
        }
    }
}

fn invalid(reason: impl Into<String>) -> CoreError {
    CoreError::InvalidGuard {
        reason: reason.into(),
    }
}

fn get_field(root: &Value, path: &str) -> Value {
    path.split('.')
        .try_fold(root, |current, key| {
            current
                .as_object()
                .map(|m| m.get(key).unwrap_or(&Value::Null))
        })
        .cloned()
        .unwrap_or(Value::Null)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}

/// Numbers compare by value, so `1` equals `1.0`.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
            _ => false,
        },
        (Value::Array(_), _) | (Value::Object(_), _) => false,
        _ => a == b,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Field(FieldRef),
    Literal(Value),
    Op(CmpOp),
    And,
    Or,
    Bang,
    Open,
    Close,
}

fn tokenize(input: &str) -> Result<Vec<Token>, CoreError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let rest = &input[start..];
        let two = rest.get(..2).unwrap_or("");
        let (token, len) = match (two, c) {
            ("&&", _) => (Token::And, 2),
            ("||", _) => (Token::Or, 2),
            ("==", _) => (Token::Op(CmpOp::Eq), 2),
            ("!=", _) => (Token::Op(CmpOp::Ne), 2),
            (">=", _) => (Token::Op(CmpOp::Ge), 2),
            ("<=", _) => (Token::Op(CmpOp::Le), 2),
            (_, '>') => (Token::Op(CmpOp::Gt), 1),
            (_, '<') => (Token::Op(CmpOp::Lt), 1),
            (_, '!') => (Token::Bang, 1),
            (_, '(') => (Token::Open, 1),
            (_, ')') => (Token::Close, 1),
            (_, '"') => lex_string(rest)?,
            (_, c) if c == '-' || c.is_ascii_digit() => lex_number(rest)?,
            (_, c) if c.is_alphabetic() || c == '_' => lex_word(rest)?,
            (_, c) => return Err(invalid(format!("unexpected character '{}'", c))),
        };

        tokens.push(token);
        while chars.peek().is_some_and(|&(i, _)| i < start + len) {
            chars.next();
        }
    }

    Ok(tokens)
}

fn lex_string(rest: &str) -> Result<(Token, usize), CoreError> {
    let mut escaped = false;
    for (i, c) in rest.char_indices().skip(1) {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' => return Ok((Token::Literal(Value::String(rest[1..i].to_string())), i + 1)),
            _ => {}
        }
    }
    Err(invalid("unterminated string"))
}

fn lex_number(rest: &str) -> Result<(Token, usize), CoreError> {
    let len = rest
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || c == '.' || (i == 0 && c == '-')))
        .map(|(i, _)| i)
        .unwrap_or(rest.len());
    let text = &rest[..len];
    let number = text
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .ok_or_else(|| invalid(format!("invalid number: '{}'", text)))?;
    Ok((Token::Literal(Value::Number(number)), len))
}

fn lex_word(rest: &str) -> Result<(Token, usize), CoreError> {
    let len = rest
        .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '.'))
        .unwrap_or(rest.len());
    let word = &rest[..len];

    let token = match word {
        "true" => Token::Literal(Value::Bool(true)),
        "false" => Token::Literal(Value::Bool(false)),
        "null" => Token::Literal(Value::Null),
        _ => {
            let (scope, path) = if let Some(path) = word.strip_prefix("ctx.") {
                (Scope::Context, path)
            } else if let Some(path) = word.strip_prefix("event.") {
                (Scope::Event, path)
            } else {
                return Err(invalid(format!(
                    "field '{}' must start with 'ctx.' or 'event.'",
                    word
                )));
            };
            if path.is_empty() || path.split('.').any(str::is_empty) {
                return Err(invalid(format!("invalid field name: '{}'", word)));
            }
            Token::Field(FieldRef {
                scope,
                path: path.to_string(),
            })
        }
    };
    Ok((token, len))
}

/// Precedence, loosest first: `||`, `&&`, `!`, comparison.
struct TokenParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl TokenParser {
    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.tokens.get(self.pos) == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn disjunction(&mut self) -> Result<GuardExpr, CoreError> {
        let mut expr = self.conjunction()?;
        while self.eat(&Token::Or) {
            expr = GuardExpr::Any(Box::new(expr), Box::new(self.conjunction()?));
        }
        Ok(expr)
    }

    fn conjunction(&mut self) -> Result<GuardExpr, CoreError> {
        let mut expr = self.negation()?;
        while self.eat(&Token::And) {
            expr = GuardExpr::All(Box::new(expr), Box::new(self.negation()?));
        }
        Ok(expr)
    }

    fn negation(&mut self) -> Result<GuardExpr, CoreError> {
        if self.eat(&Token::Bang) {
            return Ok(GuardExpr::Not(Box::new(self.negation()?)));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<GuardExpr, CoreError> {
        match self.next() {
            Some(Token::Open) => {
                let expr = self.disjunction()?;
                if !self.eat(&Token::Close) {
                    return Err(invalid("expected ')'"));
                }
                Ok(expr)
            }
            Some(Token::Field(field)) => {
                let Some(Token::Op(op)) = self.tokens.get(self.pos).cloned() else {
                    return Ok(GuardExpr::Truthy(field));
                };
                self.pos += 1;
                match self.next() {
                    Some(Token::Literal(literal)) => {
                        if op.is_ordering() && !literal.is_number() {
                            return Err(invalid(format!(
                                "{:?} needs a number, got {}",
                                op, literal
                            )));
                        }
                        Ok(GuardExpr::Compare(field, op, literal))
                    }
                    other => Err(invalid(format!(
                        "expected a literal after {:?}, got {:?}",
                        op, other
                    ))),
                }
            }
            other => Err(invalid(format!("expected a field or '(', got {:?}", other))),
        }
    }
}

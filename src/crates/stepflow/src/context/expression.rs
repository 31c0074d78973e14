//! Boolean condition expressions evaluated against context data
//!
//! The grammar is deliberately closed: literals, field lookups, arithmetic,
//! comparisons, membership and boolean connectives. There are no function
//! calls and no assignment.
//!
//! ```text
//! or      := and ( ("or" | "||") and )*
//! and     := not ( ("and" | "&&") not )*
//! not     := ("not" | "!") not | compare
//! compare := sum ( cmp_op sum )*            // chained like `0 < x <= 10`
//! sum     := term ( ("+" | "-") term )*
//! term    := unary ( ("*" | "/" | "%") unary )*
//! unary   := "-" unary | primary
//! primary := literal | field | "(" or ")" | "[" (or ("," or)*)? "]"
//! ```

use super::lexer::{Lexer, Token, TokenKind};
use super::template::lookup;
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use thiserror::Error;

/// Errors raised while lexing, parsing or evaluating an expression
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExpressionError {
    #[error("Lex error at {pos}: {message}")]
    Lex { pos: usize, message: String },

    #[error("Parse error at {pos}: {message}")]
    Parse { pos: usize, message: String },

    #[error("Unknown name: {0}")]
    UnknownName(String),

    #[error("Type error: {0}")]
    Type(String),

    #[error("Division by zero")]
    DivisionByZero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Field(String),
    List(Vec<Expr>),
    Negate(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, Vec<(CompareOp, Expr)>),
}

/// A parsed condition expression
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    root: Expr,
}

impl Expression {
    /// Parse an expression
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let tokens = Lexer::new(source).tokenize()?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.parse_or()?;
        parser.expect_eof()?;
        Ok(Self { root })
    }

    /// Evaluate against context data
    pub fn eval(&self, data: &Map<String, Value>) -> Result<Value, ExpressionError> {
        eval(&self.root, data)
    }
}

/// Parse and evaluate an expression, returning its truthiness
pub fn evaluate_bool(source: &str, data: &Map<String, Value>) -> Result<bool, ExpressionError> {
    let value = Expression::parse(source)?.eval(data)?;
    Ok(is_truthy(&value))
}

/// Truthiness: null, false, 0, "", [] and {} are false
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &TokenKind {
        self.tokens
            .get(self.pos)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    fn peek_next(&self) -> &TokenKind {
        self.tokens
            .get(self.pos + 1)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    fn current_pos(&self) -> usize {
        self.tokens.get(self.pos).map(|t| t.pos).unwrap_or(0)
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        kind
    }

    fn error(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError::Parse {
            pos: self.current_pos(),
            message: message.into(),
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), ExpressionError> {
        if *self.peek() == kind {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected {}, found {}", kind, self.peek())))
        }
    }

    fn expect_eof(&self) -> Result<(), ExpressionError> {
        match self.peek() {
            TokenKind::Eof => Ok(()),
            other => Err(self.error(format!("unexpected {}", other))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while *self.peek() == TokenKind::Or {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_not()?;
        while *self.peek() == TokenKind::And {
            self.advance();
            let right = self.parse_not()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ExpressionError> {
        if *self.peek() == TokenKind::Not {
            self.advance();
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_compare()
    }

    fn compare_op(&self) -> Option<(CompareOp, usize)> {
        let op = match self.peek() {
            TokenKind::EqEq => CompareOp::Eq,
            TokenKind::NotEq => CompareOp::Ne,
            TokenKind::Lt => CompareOp::Lt,
            TokenKind::Le => CompareOp::Le,
            TokenKind::Gt => CompareOp::Gt,
            TokenKind::Ge => CompareOp::Ge,
            TokenKind::In => CompareOp::In,
            TokenKind::Not if *self.peek_next() == TokenKind::In => return Some((CompareOp::NotIn, 2)),
            _ => return None,
        };
        Some((op, 1))
    }

    fn parse_compare(&mut self) -> Result<Expr, ExpressionError> {
        let first = self.parse_sum()?;
        let mut chain = Vec::new();

        while let Some((op, width)) = self.compare_op() {
            for _ in 0..width {
                self.advance();
            }
            chain.push((op, self.parse_sum()?));
        }

        if chain.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare(Box::new(first), chain))
        }
    }

    fn parse_sum(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Rem,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if *self.peek() == TokenKind::Minus {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Negate(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        let pos = self.current_pos();
        match self.advance() {
            TokenKind::Integer(n) => Ok(Expr::Literal(Value::from(n))),
            TokenKind::Number(n) => Number::from_f64(n)
                .map(|num| Expr::Literal(Value::Number(num)))
                .ok_or(ExpressionError::Parse {
                    pos,
                    message: format!("invalid number {}", n),
                }),
            TokenKind::Str(s) => Ok(Expr::Literal(Value::String(s))),
            TokenKind::True => Ok(Expr::Literal(Value::Bool(true))),
            TokenKind::False => Ok(Expr::Literal(Value::Bool(false))),
            TokenKind::Null => Ok(Expr::Literal(Value::Null)),
            TokenKind::Ident(name) => Ok(Expr::Field(name)),
            TokenKind::LParen => {
                let inner = self.parse_or()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::LBracket => {
                let mut items = Vec::new();
                if *self.peek() != TokenKind::RBracket {
                    items.push(self.parse_or()?);
                    while *self.peek() == TokenKind::Comma {
                        self.advance();
                        items.push(self.parse_or()?);
                    }
                }
                self.expect(TokenKind::RBracket)?;
                Ok(Expr::List(items))
            }
            other => Err(ExpressionError::Parse {
                pos,
                message: format!("unexpected {}", other),
            }),
        }
    }
}

fn eval(expr: &Expr, data: &Map<String, Value>) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Field(name) => lookup(data, name)
            .cloned()
            .ok_or_else(|| ExpressionError::UnknownName(name.clone())),
        Expr::List(items) => items
            .iter()
            .map(|item| eval(item, data))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Negate(inner) => {
            let value = eval(inner, data)?;
            if let Some(i) = as_integer(&value) {
                return i
                    .checked_neg()
                    .map(Value::from)
                    .ok_or_else(|| ExpressionError::Type("integer overflow".to_string()));
            }
            let f = as_float(&value)
                .ok_or_else(|| ExpressionError::Type(format!("cannot negate {}", value)))?;
            float_value(-f)
        }
        Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&eval(inner, data)?))),
        Expr::Binary(BinaryOp::And, left, right) => {
            let l = eval(left, data)?;
            if is_truthy(&l) {
                eval(right, data)
            } else {
                Ok(l)
            }
        }
        Expr::Binary(BinaryOp::Or, left, right) => {
            let l = eval(left, data)?;
            if is_truthy(&l) {
                Ok(l)
            } else {
                eval(right, data)
            }
        }
        Expr::Binary(op, left, right) => {
            let l = eval(left, data)?;
            let r = eval(right, data)?;
            arithmetic(*op, &l, &r)
        }
        Expr::Compare(first, chain) => {
            let mut left = eval(first, data)?;
            for (op, right_expr) in chain {
                let right = eval(right_expr, data)?;
                if !compare(*op, &left, &right)? {
                    return Ok(Value::Bool(false));
                }
                left = right;
            }
            Ok(Value::Bool(true))
        }
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn float_value(f: f64) -> Result<Value, ExpressionError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| ExpressionError::Type(format!("non-finite result {}", f)))
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, ExpressionError> {
    match (op, l, r) {
        (BinaryOp::Add, Value::String(a), Value::String(b)) => {
            return Ok(Value::String(format!("{}{}", a, b)));
        }
        (BinaryOp::Add, Value::Array(a), Value::Array(b)) => {
            return Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()));
        }
        _ => {}
    }

    if let (Some(a), Some(b)) = (as_integer(l), as_integer(r)) {
        let overflow = || ExpressionError::Type("integer overflow".to_string());
        let result = match op {
            BinaryOp::Add => a.checked_add(b).ok_or_else(overflow)?,
            BinaryOp::Sub => a.checked_sub(b).ok_or_else(overflow)?,
            BinaryOp::Mul => a.checked_mul(b).ok_or_else(overflow)?,
            BinaryOp::Rem => {
                if b == 0 {
                    return Err(ExpressionError::DivisionByZero);
                }
                let r = a.checked_rem_euclid(b).ok_or_else(overflow)?;
                if b < 0 && r != 0 {
                    r + b
                } else {
                    r
                }
            }
            BinaryOp::Div => {
                if b == 0 {
                    return Err(ExpressionError::DivisionByZero);
                }
                return float_value(a as f64 / b as f64);
            }
            BinaryOp::And | BinaryOp::Or => return Err(not_arithmetic(op)),
        };
        return Ok(Value::from(result));
    }

    let (a, b) = match (as_float(l), as_float(r)) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(ExpressionError::Type(format!(
                "unsupported operand types for {:?}: {} and {}",
                op, l, r
            )))
        }
    };

    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div | BinaryOp::Rem if b == 0.0 => return Err(ExpressionError::DivisionByZero),
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a - b * (a / b).floor(),
        BinaryOp::And | BinaryOp::Or => return Err(not_arithmetic(op)),
    };
    float_value(result)
}

fn not_arithmetic(op: BinaryOp) -> ExpressionError {
    ExpressionError::Type(format!("{:?} is not an arithmetic operator", op))
}

fn values_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(_), Value::Number(_)) => as_float(l) == as_float(r),
        _ => l == r,
    }
}

fn ordering(l: &Value, r: &Value) -> Result<Ordering, ExpressionError> {
    match (l, r) {
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => match (as_float(l), as_float(r)) {
            (Some(a), Some(b)) => a
                .partial_cmp(&b)
                .ok_or_else(|| ExpressionError::Type("unordered numbers".to_string())),
            _ => Err(ExpressionError::Type(format!(
                "cannot order {} and {}",
                l, r
            ))),
        },
    }
}

fn contains(container: &Value, item: &Value) -> Result<bool, ExpressionError> {
    match container {
        Value::String(haystack) => match item {
            Value::String(needle) => Ok(haystack.contains(needle.as_str())),
            other => Err(ExpressionError::Type(format!(
                "'in <string>' requires string as left operand, not {}",
                other
            ))),
        },
        Value::Array(items) => Ok(items.iter().any(|v| values_equal(v, item))),
        Value::Object(map) => match item {
            Value::String(key) => Ok(map.contains_key(key)),
            _ => Ok(false),
        },
        other => Err(ExpressionError::Type(format!(
            "argument of type {} is not iterable",
            other
        ))),
    }
}

fn compare(op: CompareOp, l: &Value, r: &Value) -> Result<bool, ExpressionError> {
    Ok(match op {
        CompareOp::Eq => values_equal(l, r),
        CompareOp::Ne => !values_equal(l, r),
        CompareOp::Lt => ordering(l, r)? == Ordering::Less,
        CompareOp::Le => ordering(l, r)? != Ordering::Greater,
        CompareOp::Gt => ordering(l, r)? == Ordering::Greater,
        CompareOp::Ge => ordering(l, r)? != Ordering::Less,
        CompareOp::In => contains(r, l)?,
        CompareOp::NotIn => !contains(r, l)?,
    })
}

// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Sandboxed expression language for formula curves.
//!
//! A formula is plain arithmetic over a fixed set of variables:
//! `current_temp`, `activation_temp`, `max_temp`, `min_rpm` and `max_rpm`.
//! Supported syntax:
//!
//! - numbers (`12`, `0.5`, `1e3`)
//! - `+ - * / %` and `**` (right associative, binds tighter than unary minus)
//! - comparisons `< <= > >= == !=`, which evaluate to `1` or `0`
//! - the functions `exp ln log10 sqrt abs` (one argument) and
//!   `pow min max` (two arguments)
//!
//! Anything else is rejected by [`Formula::parse`], so a profile that loads
//! can only ever fail at evaluation time with a numeric domain error.
//! Formulas are also bounded in length and nesting depth, which keeps the
//! recursive parser and evaluator well inside the stack.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Deepest allowed nesting of parentheses, signs and exponents.
pub const MAX_DEPTH: usize = 64;

/// Longest allowed formula, in tokens.
pub const MAX_TOKENS: usize = 512;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExprError {
    #[error("unexpected character '{ch}' at offset {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("function '{name}' takes {expected} argument(s), got {got}")]
    Arity {
        name: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("unexpected {found} at offset {pos}")]
    UnexpectedToken { found: String, pos: usize },

    #[error("expression is empty")]
    Empty,

    #[error("expression nests deeper than {0} levels")]
    TooDeep(usize),

    #[error("expression is longer than {0} tokens")]
    TooLong(usize),

    #[error("result is not a finite number")]
    Domain,
}

// ---------------------------------------------------------------------------
// Bindings
// ---------------------------------------------------------------------------

/// Values available to a formula at evaluation time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bindings {
    pub current_temp: f64,
    pub activation_temp: f64,
    pub max_temp: f64,
    pub min_rpm: f64,
    pub max_rpm: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Var {
    CurrentTemp,
    ActivationTemp,
    MaxTemp,
    MinRpm,
    MaxRpm,
}

impl Var {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "current_temp" => Some(Var::CurrentTemp),
            "activation_temp" => Some(Var::ActivationTemp),
            "max_temp" => Some(Var::MaxTemp),
            "min_rpm" => Some(Var::MinRpm),
            "max_rpm" => Some(Var::MaxRpm),
            _ => None,
        }
    }

    fn value(self, b: &Bindings) -> f64 {
        match self {
            Var::CurrentTemp => b.current_temp,
            Var::ActivationTemp => b.activation_temp,
            Var::MaxTemp => b.max_temp,
            Var::MinRpm => b.min_rpm,
            Var::MaxRpm => b.max_rpm,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Exp,
    Ln,
    Log10,
    Sqrt,
    Abs,
    Pow,
    Min,
    Max,
}

impl Func {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "exp" => Some(Func::Exp),
            "ln" | "log" => Some(Func::Ln),
            "log10" => Some(Func::Log10),
            "sqrt" => Some(Func::Sqrt),
            "abs" => Some(Func::Abs),
            "pow" => Some(Func::Pow),
            "min" => Some(Func::Min),
            "max" => Some(Func::Max),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Func::Exp => "exp",
            Func::Ln => "ln",
            Func::Log10 => "log10",
            Func::Sqrt => "sqrt",
            Func::Abs => "abs",
            Func::Pow => "pow",
            Func::Min => "min",
            Func::Max => "max",
        }
    }

    fn arity(self) -> usize {
        match self {
            Func::Pow | Func::Min | Func::Max => 2,
            _ => 1,
        }
    }

    fn apply(self, args: &[f64]) -> f64 {
        match self {
            Func::Exp => args[0].exp(),
            Func::Ln => args[0].ln(),
            Func::Log10 => args[0].log10(),
            Func::Sqrt => args[0].sqrt(),
            Func::Abs => args[0].abs(),
            Func::Pow => args[0].powf(args[1]),
            Func::Min => args[0].min(args[1]),
            Func::Max => args[0].max(args[1]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl BinOp {
    fn apply(self, a: f64, b: f64) -> f64 {
        let truth = |c: bool| if c { 1.0 } else { 0.0 };
        match self {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => a / b,
            // floored modulo, sign follows the divisor
            BinOp::Rem => a - b * (a / b).floor(),
            BinOp::Pow => a.powf(b),
            BinOp::Lt => truth(a < b),
            BinOp::Le => truth(a <= b),
            BinOp::Gt => truth(a > b),
            BinOp::Ge => truth(a >= b),
            BinOp::Eq => truth(a == b),
            BinOp::Ne => truth(a != b),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Num(f64),
    Var(Var),
    Neg(Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
    Call(Func, Vec<Node>),
}

impl Node {
    fn eval(&self, b: &Bindings) -> Result<f64, ExprError> {
        let v = match self {
            Node::Num(n) => *n,
            Node::Var(var) => var.value(b),
            Node::Neg(inner) => -inner.eval(b)?,
            Node::Binary(op, lhs, rhs) => op.apply(lhs.eval(b)?, rhs.eval(b)?),
            Node::Call(func, args) => {
                let values = args
                    .iter()
                    .map(|a| a.eval(b))
                    .collect::<Result<Vec<_>, _>>()?;
                func.apply(&values)
            }
        };
        if v.is_finite() { Ok(v) } else { Err(ExprError::Domain) }
    }
}

// ---------------------------------------------------------------------------
// Formula
// ---------------------------------------------------------------------------

/// A parsed, validated formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    root: Node,
}

impl Formula {
    /// Parse and validate a formula. Unknown names and malformed syntax are
    /// rejected here rather than at evaluation time.
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ExprError::Empty);
        }
        if tokens.len() > MAX_TOKENS {
            return Err(ExprError::TooLong(MAX_TOKENS));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.comparison()?;
        if let Some(tok) = parser.peek() {
            return Err(ExprError::UnexpectedToken {
                found: tok.kind.describe(),
                pos: tok.pos,
            });
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn eval(&self, bindings: &Bindings) -> Result<f64, ExprError> {
        self.root.eval(bindings)
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl FromStr for Formula {
    type Err = ExprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Formula::parse(s)
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Num(f64),
    Ident(String),
    Op(BinOp),
    Plus,
    Minus,
    LParen,
    RParen,
    Comma,
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            TokenKind::Num(n) => format!("number {n}"),
            TokenKind::Ident(name) => format!("'{name}'"),
            TokenKind::Op(op) => format!("operator {op:?}"),
            TokenKind::Plus => "'+'".to_string(),
            TokenKind::Minus => "'-'".to_string(),
            TokenKind::LParen => "'('".to_string(),
            TokenKind::RParen => "')'".to_string(),
            TokenKind::Comma => "','".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    pos: usize,
}

fn tokenize(src: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, ch) = chars[i];
        let next = chars.get(i + 1).map(|&(_, c)| c);

        if ch.is_whitespace() {
            i += 1;
            continue;
        }

        if ch.is_ascii_digit() || (ch == '.' && next.is_some_and(|c| c.is_ascii_digit())) {
            let start = i;
            while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                i += 1;
            }
            // exponent: e, E, optionally signed
            if i < chars.len() && matches!(chars[i].1, 'e' | 'E') {
                let mut j = i + 1;
                if j < chars.len() && matches!(chars[j].1, '+' | '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].1.is_ascii_digit() {
                    i = j;
                    while i < chars.len() && chars[i].1.is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text: String = chars[start..i].iter().map(|&(_, c)| c).collect();
            let value = text
                .parse::<f64>()
                .map_err(|_| ExprError::InvalidNumber(text.clone()))?;
            tokens.push(Token {
                kind: TokenKind::Num(value),
                pos,
            });
            continue;
        }

        if ch.is_ascii_alphabetic() || ch == '_' {
            let start = i;
            while i < chars.len() && (chars[i].1.is_ascii_alphanumeric() || chars[i].1 == '_') {
                i += 1;
            }
            let name: String = chars[start..i].iter().map(|&(_, c)| c).collect();
            tokens.push(Token {
                kind: TokenKind::Ident(name),
                pos,
            });
            continue;
        }

        let (kind, width) = match (ch, next) {
            ('*', Some('*')) => (TokenKind::Op(BinOp::Pow), 2),
            ('<', Some('=')) => (TokenKind::Op(BinOp::Le), 2),
            ('>', Some('=')) => (TokenKind::Op(BinOp::Ge), 2),
            ('=', Some('=')) => (TokenKind::Op(BinOp::Eq), 2),
            ('!', Some('=')) => (TokenKind::Op(BinOp::Ne), 2),
            ('*', _) => (TokenKind::Op(BinOp::Mul), 1),
            ('/', _) => (TokenKind::Op(BinOp::Div), 1),
            ('%', _) => (TokenKind::Op(BinOp::Rem), 1),
            ('<', _) => (TokenKind::Op(BinOp::Lt), 1),
            ('>', _) => (TokenKind::Op(BinOp::Gt), 1),
            ('+', _) => (TokenKind::Plus, 1),
            ('-', _) => (TokenKind::Minus, 1),
            ('(', _) => (TokenKind::LParen, 1),
            (')', _) => (TokenKind::RParen, 1),
            (',', _) => (TokenKind::Comma, 1),
            _ => return Err(ExprError::UnexpectedChar { ch, pos }),
        };
        tokens.push(Token { kind, pos });
        i += width;
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn unexpected(&self) -> ExprError {
        match self.peek() {
            Some(tok) => ExprError::UnexpectedToken {
                found: tok.kind.describe(),
                pos: tok.pos,
            },
            None => ExprError::UnexpectedToken {
                found: "end of expression".to_string(),
                pos: self.tokens.last().map_or(0, |t| t.pos + 1),
            },
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), ExprError> {
        match self.peek() {
            Some(tok) if tok.kind == kind => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(self.unexpected()),
        }
    }

    /// comparison := additive (cmp additive)?
    fn comparison(&mut self) -> Result<Node, ExprError> {
        let lhs = self.additive()?;
        if let Some(Token {
            kind: TokenKind::Op(op @ (BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne)),
            ..
        }) = self.peek().cloned()
        {
            self.pos += 1;
            let rhs = self.additive()?;
            return Ok(Node::Binary(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    /// additive := term (('+' | '-') term)*
    fn additive(&mut self) -> Result<Node, ExprError> {
        let mut node = self.term()?;
        loop {
            let op = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Plus) => BinOp::Add,
                Some(TokenKind::Minus) => BinOp::Sub,
                _ => return Ok(node),
            };
            self.pos += 1;
            node = Node::Binary(op, Box::new(node), Box::new(self.term()?));
        }
    }

    /// term := unary (('*' | '/' | '%') unary)*
    fn term(&mut self) -> Result<Node, ExprError> {
        let mut node = self.unary()?;
        loop {
            let op = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Op(op @ (BinOp::Mul | BinOp::Div | BinOp::Rem))) => *op,
                _ => return Ok(node),
            };
            self.pos += 1;
            node = Node::Binary(op, Box::new(node), Box::new(self.unary()?));
        }
    }

    /// Every nested construct recurses through here, so this is where
    /// depth is counted.
    fn unary(&mut self) -> Result<Node, ExprError> {
        if self.depth >= MAX_DEPTH {
            return Err(ExprError::TooDeep(MAX_DEPTH));
        }
        self.depth += 1;
        let node = self.signed();
        self.depth -= 1;
        node
    }

    /// unary := ('-' | '+') unary | power
    fn signed(&mut self) -> Result<Node, ExprError> {
        match self.peek().map(|t| &t.kind) {
            Some(TokenKind::Minus) => {
                self.pos += 1;
                Ok(Node::Neg(Box::new(self.unary()?)))
            }
            Some(TokenKind::Plus) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    /// power := primary ('**' unary)?
    fn power(&mut self) -> Result<Node, ExprError> {
        let base = self.primary()?;
        if matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Op(BinOp::Pow))) {
            self.pos += 1;
            let exponent = self.unary()?;
            return Ok(Node::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Node, ExprError> {
        let Some(tok) = self.advance() else {
            return Err(self.unexpected());
        };
        match tok.kind {
            TokenKind::Num(n) => Ok(Node::Num(n)),
            TokenKind::LParen => {
                let inner = self.comparison()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::Ident(name) => {
                if matches!(self.peek().map(|t| &t.kind), Some(TokenKind::LParen)) {
                    self.pos += 1;
                    let func = Func::lookup(&name).ok_or(ExprError::UnknownFunction(name))?;
                    let args = self.arguments()?;
                    if args.len() != func.arity() {
                        return Err(ExprError::Arity {
                            name: func.name(),
                            expected: func.arity(),
                            got: args.len(),
                        });
                    }
                    Ok(Node::Call(func, args))
                } else {
                    Var::lookup(&name)
                        .map(Node::Var)
                        .ok_or(ExprError::UnknownVariable(name))
                }
            }
            _ => {
                self.pos -= 1;
                Err(self.unexpected())
            }
        }
    }

    /// Arguments after an opening parenthesis, consuming the closing one.
    fn arguments(&mut self) -> Result<Vec<Node>, ExprError> {
        let mut args = Vec::new();
        if matches!(self.peek().map(|t| &t.kind), Some(TokenKind::RParen)) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.comparison()?);
            match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Comma) => self.pos += 1,
                Some(TokenKind::RParen) => {
                    self.pos += 1;
                    return Ok(args);
                }
                _ => return Err(self.unexpected()),
            }
        }
    }
}

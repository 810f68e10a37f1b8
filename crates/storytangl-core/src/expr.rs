// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots/echo>
//! The restricted predicate/effect expression DSL (§4.9).
//!
//! Author-supplied predicate and effect strings never reach a real
//! interpreter: they are lexed and parsed into a [`CompiledExpr`] AST drawn
//! from a closed grammar (identifiers, literals, arithmetic/comparison/
//! logical operators, attribute access, a fixed set of safe built-in calls,
//! a fixed filter set, and — in effect mode only — single-name assignment).
//! Anything outside that grammar raises [`StError::UnsafeExpression`] at
//! compile time; nothing is ever evaluated as host code.
//!
//! Compiled ASTs are cached per `(entity uid, source hash)` in an
//! [`ExprCache`] owned by the executing VM (design note: "Global mutable
//! state" — read-mostly, populated lazily, never mutated during a tick
//! other than to insert a new cache entry).

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::StError;
use crate::graph::Graph;
use crate::ident::NodeId;
use crate::value::Value;

/// The fixed set of pronoun-form filters, grounded in the original
/// implementation's gendered-nominal pronoun module: a closed set of four
/// forms rather than the full nominal-swap table, since predicate/effect
/// context only ever needs to render a pronoun for the current actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PronounFilter {
    /// "he" / "she" / "they".
    Subject,
    /// "him" / "her" / "them".
    Object,
    /// "his" / "her" / "their".
    Possessive,
    /// "himself" / "herself" / "themself".
    Reflexive,
}

impl PronounFilter {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "subject" => Some(Self::Subject),
            "object" => Some(Self::Object),
            "possessive" => Some(Self::Possessive),
            "reflexive" => Some(Self::Reflexive),
            _ => None,
        }
    }

    /// Renders this form for an actor whose `locals.gender` is `"f"`,
    /// `"m"`, or anything else (treated as neutral/singular-they).
    #[must_use]
    pub fn render(self, gender: Option<&str>) -> &'static str {
        match (self, gender) {
            (Self::Subject, Some("f")) => "she",
            (Self::Subject, Some("m")) => "he",
            (Self::Subject, _) => "they",
            (Self::Object, Some("f")) => "her",
            (Self::Object, Some("m")) => "him",
            (Self::Object, _) => "them",
            (Self::Possessive, Some("f")) => "her",
            (Self::Possessive, Some("m")) => "his",
            (Self::Possessive, _) => "their",
            (Self::Reflexive, Some("f")) => "herself",
            (Self::Reflexive, Some("m")) => "himself",
            (Self::Reflexive, _) => "themself",
        }
    }
}

/// The fixed built-in function set, matching §4.9's "`len`, `min`, `max`,
/// `range`, arithmetic, comparisons".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Builtin {
    Len,
    Min,
    Max,
    Range,
}

impl Builtin {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "len" => Some(Self::Len),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "range" => Some(Self::Range),
            _ => None,
        }
    }
}

/// A binary operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// The restricted expression AST. Every variant corresponds to a construct
/// explicitly permitted by §4.9; there is no variant for imports, dunder
/// access, or arbitrary attribute assignment.
#[derive(Debug, Clone, PartialEq)]
enum Ast {
    Literal(Value),
    Ident(String),
    Attr(Box<Ast>, String),
    Unary(bool, Box<Ast>),
    Bin(BinOp, Box<Ast>, Box<Ast>),
    Call(Builtin, Vec<Ast>),
    Filter(Box<Ast>, PronounFilter),
    /// Effect-mode only: `target = expr`, where `target` is a bare name.
    Assign(String, Box<Ast>),
}

/// A compiled, cached expression ready to evaluate against a [`Context`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpr {
    ast: Ast,
    source_hash: u64,
}

impl CompiledExpr {
    /// A cheap hash of the source this expression was compiled from, used
    /// as half of the cache key.
    #[must_use]
    pub const fn source_hash(&self) -> u64 {
        self.source_hash
    }
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in s.as_bytes() {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

// ---- Lexer ---------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Dot,
    Comma,
    LParen,
    RParen,
    Pipe,
    Plus,
    Minus,
    Star,
    Slash,
    Eq2,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    Assign,
    End,
}

fn lex(src: &str) -> Result<Vec<Tok>, StError> {
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0usize;
    let mut toks = Vec::new();
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '.' => {
                toks.push(Tok::Dot);
                i += 1;
            }
            ',' => {
                toks.push(Tok::Comma);
                i += 1;
            }
            '(' => {
                toks.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                toks.push(Tok::RParen);
                i += 1;
            }
            '|' => {
                toks.push(Tok::Pipe);
                i += 1;
            }
            '+' => {
                toks.push(Tok::Plus);
                i += 1;
            }
            '-' => {
                toks.push(Tok::Minus);
                i += 1;
            }
            '*' => {
                toks.push(Tok::Star);
                i += 1;
            }
            '/' => {
                toks.push(Tok::Slash);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::Eq2);
                    i += 2;
                } else {
                    toks.push(Tok::Assign);
                    i += 1;
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::Ne);
                    i += 2;
                } else {
                    return Err(unsafe_expr("unexpected '!'"));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::Le);
                    i += 2;
                } else {
                    toks.push(Tok::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::Ge);
                    i += 2;
                } else {
                    toks.push(Tok::Gt);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(unsafe_expr("unterminated string literal"));
                }
                i += 1;
                toks.push(Tok::Str(s));
            }
            _ if c.is_ascii_digit() => {
                let start = i;
                let mut is_float = false;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    if chars[i] == '.' {
                        is_float = true;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                if is_float {
                    let v: f64 = text
                        .parse()
                        .map_err(|_| unsafe_expr("invalid float literal"))?;
                    toks.push(Tok::Float(v));
                } else {
                    let v: i64 = text
                        .parse()
                        .map_err(|_| unsafe_expr("invalid integer literal"))?;
                    toks.push(Tok::Int(v));
                }
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "and" => toks.push(Tok::And),
                    "or" => toks.push(Tok::Or),
                    "not" => toks.push(Tok::Not),
                    "true" => toks.push(Tok::Ident("true".into())),
                    "false" => toks.push(Tok::Ident("false".into())),
                    "none" | "None" => toks.push(Tok::Ident("none".into())),
                    _ => {
                        if word.starts_with("__") {
                            return Err(unsafe_expr("dunder access is not permitted"));
                        }
                        toks.push(Tok::Ident(word));
                    }
                }
            }
            other => return Err(unsafe_expr(&format!("unexpected character '{other}'"))),
        }
    }
    toks.push(Tok::End);
    Ok(toks)
}

fn unsafe_expr(reason: &str) -> StError {
    StError::UnsafeExpression {
        reason: reason.to_owned(),
    }
}

// ---- Parser (Pratt, for the binary operators) -----------------------------

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
    effect_mode: bool,
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.toks[self.pos]
    }

    fn advance(&mut self) -> Tok {
        let t = self.toks[self.pos].clone();
        if self.pos + 1 < self.toks.len() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, tok: &Tok) -> Result<(), StError> {
        if self.peek() == tok {
            self.advance();
            Ok(())
        } else {
            Err(unsafe_expr(&format!("expected {tok:?}, found {:?}", self.peek())))
        }
    }

    fn parse_program(&mut self) -> Result<Ast, StError> {
        if self.effect_mode {
            if let Tok::Ident(name) = self.peek().clone() {
                if self.toks.get(self.pos + 1) == Some(&Tok::Assign) {
                    self.advance();
                    self.advance();
                    let rhs = self.parse_or()?;
                    self.expect(&Tok::End)?;
                    return Ok(Ast::Assign(name, Box::new(rhs)));
                }
            }
        }
        let expr = self.parse_or()?;
        self.expect(&Tok::End)?;
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Ast, StError> {
        let mut lhs = self.parse_and()?;
        while *self.peek() == Tok::Or {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Ast::Bin(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Ast, StError> {
        let mut lhs = self.parse_not()?;
        while *self.peek() == Tok::And {
            self.advance();
            let rhs = self.parse_not()?;
            lhs = Ast::Bin(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Ast, StError> {
        if *self.peek() == Tok::Not {
            self.advance();
            let inner = self.parse_not()?;
            return Ok(Ast::Unary(true, Box::new(inner)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Ast, StError> {
        let lhs = self.parse_add()?;
        let op = match self.peek() {
            Tok::Eq2 => Some(BinOp::Eq),
            Tok::Ne => Some(BinOp::Ne),
            Tok::Lt => Some(BinOp::Lt),
            Tok::Le => Some(BinOp::Le),
            Tok::Gt => Some(BinOp::Gt),
            Tok::Ge => Some(BinOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let rhs = self.parse_add()?;
            return Ok(Ast::Bin(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_add(&mut self) -> Result<Ast, StError> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_mul()?;
            lhs = Ast::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> Result<Ast, StError> {
        let mut lhs = self.parse_filter()?;
        loop {
            let op = match self.peek() {
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_filter()?;
            lhs = Ast::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_filter(&mut self) -> Result<Ast, StError> {
        let mut lhs = self.parse_unary()?;
        while *self.peek() == Tok::Pipe {
            self.advance();
            let Tok::Ident(name) = self.advance() else {
                return Err(unsafe_expr("expected filter name after '|'"));
            };
            let filter = PronounFilter::parse(&name)
                .ok_or_else(|| unsafe_expr(&format!("unknown filter '{name}'")))?;
            lhs = Ast::Filter(Box::new(lhs), filter);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Ast, StError> {
        if *self.peek() == Tok::Minus {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Ast::Bin(
                BinOp::Sub,
                Box::new(Ast::Literal(Value::Int(0))),
                Box::new(inner),
            ));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Ast, StError> {
        let mut node = self.parse_atom()?;
        loop {
            match self.peek() {
                Tok::Dot => {
                    self.advance();
                    let Tok::Ident(field) = self.advance() else {
                        return Err(unsafe_expr("expected identifier after '.'"));
                    };
                    if field.starts_with('_') {
                        return Err(unsafe_expr("dunder/private attribute access is not permitted"));
                    }
                    node = Ast::Attr(Box::new(node), field);
                }
                _ => break,
            }
        }
        Ok(node)
    }

    fn parse_atom(&mut self) -> Result<Ast, StError> {
        match self.advance() {
            Tok::Int(v) => Ok(Ast::Literal(Value::Int(v))),
            Tok::Float(v) => Ok(Ast::Literal(Value::Float(v))),
            Tok::Str(v) => Ok(Ast::Literal(Value::Str(v))),
            Tok::LParen => {
                let inner = self.parse_or()?;
                self.expect(&Tok::RParen)?;
                Ok(inner)
            }
            Tok::Ident(name) => {
                if name == "true" {
                    return Ok(Ast::Literal(Value::Bool(true)));
                }
                if name == "false" {
                    return Ok(Ast::Literal(Value::Bool(false)));
                }
                if name == "none" {
                    return Ok(Ast::Literal(Value::None));
                }
                if *self.peek() == Tok::LParen {
                    let builtin = Builtin::parse(&name)
                        .ok_or_else(|| unsafe_expr(&format!("'{name}' is not a callable builtin")))?;
                    self.advance();
                    let mut args = Vec::new();
                    if *self.peek() != Tok::RParen {
                        args.push(self.parse_or()?);
                        while *self.peek() == Tok::Comma {
                            self.advance();
                            args.push(self.parse_or()?);
                        }
                    }
                    self.expect(&Tok::RParen)?;
                    return Ok(Ast::Call(builtin, args));
                }
                Ok(Ast::Ident(name))
            }
            other => Err(unsafe_expr(&format!("unexpected token {other:?}"))),
        }
    }
}

/// Compiles `source` in predicate mode: no assignment is permitted.
///
/// # Errors
/// Returns [`StError::UnsafeExpression`] if `source` is not in the
/// restricted grammar.
pub fn compile_predicate(source: &str) -> Result<CompiledExpr, StError> {
    compile(source, false)
}

/// Compiles `source` in effect mode: a single top-level `target = expr`
/// assignment is additionally permitted.
///
/// # Errors
/// Returns [`StError::UnsafeExpression`] if `source` is not in the
/// restricted grammar.
pub fn compile_effect(source: &str) -> Result<CompiledExpr, StError> {
    compile(source, true)
}

fn compile(source: &str, effect_mode: bool) -> Result<CompiledExpr, StError> {
    let toks = lex(source)?;
    let mut parser = Parser {
        toks,
        pos: 0,
        effect_mode,
    };
    let ast = parser.parse_program()?;
    Ok(CompiledExpr {
        ast,
        source_hash: fnv1a(source),
    })
}

// ---- Evaluation ------------------------------------------------------------

fn eval_ast(ast: &Ast, graph: &Graph, ctx: &Context) -> Result<Value, StError> {
    match ast {
        Ast::Literal(v) => Ok(v.clone()),
        Ast::Ident(name) => Ok(ctx.ns(graph, name)),
        Ast::Attr(base, field) => {
            let value = eval_ast(base, graph, ctx)?;
            Ok(attr_lookup(graph, &value, field))
        }
        Ast::Unary(negate, inner) => {
            let v = eval_ast(inner, graph, ctx)?;
            Ok(Value::Bool(if *negate { !v.is_truthy() } else { v.is_truthy() }))
        }
        Ast::Bin(op, lhs, rhs) => eval_bin(*op, lhs, rhs, graph, ctx),
        Ast::Call(builtin, args) => eval_call(*builtin, args, graph, ctx),
        Ast::Filter(inner, filter) => {
            let v = eval_ast(inner, graph, ctx)?;
            Ok(apply_pronoun_filter(graph, &v, *filter))
        }
        Ast::Assign(..) => Err(unsafe_expr("assignment is only valid in effect mode")),
    }
}

fn apply_pronoun_filter(graph: &Graph, value: &Value, filter: PronounFilter) -> Value {
    let gender = match value {
        Value::Str(label) => graph
            .get_by_label(label)
            .ok()
            .and_then(|n| n.locals.get("gender"))
            .and_then(|g| if let Value::Str(s) = g { Some(s.clone()) } else { None }),
        _ => None,
    };
    Value::Str(filter.render(gender.as_deref()).to_owned())
}

fn attr_lookup(graph: &Graph, base: &Value, field: &str) -> Value {
    match base {
        Value::Map(map) => map.get(field).cloned().unwrap_or(Value::None),
        Value::Str(label) => graph
            .get_by_label(label)
            .ok()
            .and_then(|n| n.locals.get(field).cloned())
            .unwrap_or(Value::None),
        _ => Value::None,
    }
}

fn eval_bin(op: BinOp, lhs: &Ast, rhs: &Ast, graph: &Graph, ctx: &Context) -> Result<Value, StError> {
    if op == BinOp::And {
        let l = eval_ast(lhs, graph, ctx)?;
        if !l.is_truthy() {
            return Ok(Value::Bool(false));
        }
        let r = eval_ast(rhs, graph, ctx)?;
        return Ok(Value::Bool(r.is_truthy()));
    }
    if op == BinOp::Or {
        let l = eval_ast(lhs, graph, ctx)?;
        if l.is_truthy() {
            return Ok(Value::Bool(true));
        }
        let r = eval_ast(rhs, graph, ctx)?;
        return Ok(Value::Bool(r.is_truthy()));
    }
    let l = eval_ast(lhs, graph, ctx)?;
    let r = eval_ast(rhs, graph, ctx)?;
    match op {
        BinOp::Eq => Ok(Value::Bool(values_equal(&l, &r))),
        BinOp::Ne => Ok(Value::Bool(!values_equal(&l, &r))),
        BinOp::Lt => Ok(Value::Bool(matches!(l.partial_cmp(&r), Some(std::cmp::Ordering::Less)))),
        BinOp::Le => Ok(Value::Bool(matches!(
            l.partial_cmp(&r),
            Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
        ))),
        BinOp::Gt => Ok(Value::Bool(matches!(l.partial_cmp(&r), Some(std::cmp::Ordering::Greater)))),
        BinOp::Ge => Ok(Value::Bool(matches!(
            l.partial_cmp(&r),
            Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
        ))),
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => arithmetic(op, &l, &r),
        BinOp::And | BinOp::Or => unreachable!("handled above with short-circuit"),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => (*x as f64) == *y,
        _ => a == b,
    }
}

fn arithmetic(op: BinOp, l: &Value, r: &Value) -> Result<Value, StError> {
    if let (Value::Int(a), Value::Int(b)) = (l, r) {
        return Ok(Value::Int(match op {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => {
                if *b == 0 {
                    return Err(unsafe_expr("division by zero"));
                }
                a / b
            }
            _ => unreachable!(),
        }));
    }
    let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
        return Err(unsafe_expr("arithmetic requires numeric operands"));
    };
    Ok(Value::Float(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        _ => unreachable!(),
    }))
}

fn eval_call(builtin: Builtin, args: &[Ast], graph: &Graph, ctx: &Context) -> Result<Value, StError> {
    let values: Vec<Value> = args
        .iter()
        .map(|a| eval_ast(a, graph, ctx))
        .collect::<Result<_, _>>()?;
    match builtin {
        Builtin::Len => {
            let [v] = values.as_slice() else {
                return Err(unsafe_expr("len() takes exactly one argument"));
            };
            Ok(v.len().map_or(Value::None, |n| Value::Int(n as i64)))
        }
        Builtin::Min | Builtin::Max => {
            if values.is_empty() {
                return Err(unsafe_expr("min()/max() require at least one argument"));
            }
            let mut best = values[0].clone();
            for v in &values[1..] {
                let take = match (builtin, v.partial_cmp(&best)) {
                    (Builtin::Min, Some(std::cmp::Ordering::Less)) => true,
                    (Builtin::Max, Some(std::cmp::Ordering::Greater)) => true,
                    _ => false,
                };
                if take {
                    best = v.clone();
                }
            }
            Ok(best)
        }
        Builtin::Range => {
            let ints: Vec<i64> = values
                .iter()
                .map(|v| match v {
                    Value::Int(i) => Ok(*i),
                    _ => Err(unsafe_expr("range() requires integer arguments")),
                })
                .collect::<Result<_, _>>()?;
            let (start, end) = match ints.as_slice() {
                [end] => (0, *end),
                [start, end] => (*start, *end),
                _ => return Err(unsafe_expr("range() takes one or two arguments")),
            };
            Ok(Value::List((start..end).map(Value::Int).collect()))
        }
    }
}

/// Evaluates `expr` as a predicate: a guard that gates whether an edge
/// fires/counts as available. An undefined name evaluates to `Value::None`
/// (falsy), never an error; only a syntax violation raises
/// [`StError::UnsafeExpression`], and that happens at compile time.
#[must_use]
pub fn eval_predicate(expr: &CompiledExpr, graph: &Graph, ctx: &Context) -> bool {
    eval_ast(&expr.ast, graph, ctx).map(|v| v.is_truthy()).unwrap_or(false)
}

/// Resolves which entity a bare assignment target currently binds through,
/// following the same order as [`Context::ns`]: the cursor's own locals
/// first, then nearest-first ancestors; if no entity currently defines the
/// name, the cursor itself is the target (a fresh key is created there).
#[must_use]
pub fn resolve_assignment_target(graph: &Graph, ctx: &Context, name: &str) -> NodeId {
    if let Ok(cursor) = graph.get(ctx.cursor_id) {
        if cursor.locals.contains_key(name) {
            return ctx.cursor_id;
        }
    }
    for ancestor in graph.ancestors(ctx.cursor_id, 256) {
        if let Ok(node) = graph.get(ancestor) {
            if node.locals.contains_key(name) {
                return ancestor;
            }
        }
    }
    ctx.cursor_id
}

/// Runs `expr` in effect mode: evaluates the right-hand side against the
/// preview graph and emits a `SetAttr` effect targeting the resolved
/// entity. Non-assignment expressions (effect strings that are just a
/// predicate-shaped expression) are evaluated for any emitted value and
/// discarded — only assignment has an observable effect.
///
/// # Errors
/// Returns [`StError::UnsafeExpression`] if evaluation fails (e.g.
/// arithmetic on non-numeric operands).
pub fn eval_effect(expr: &CompiledExpr, graph: &Graph, ctx: &mut Context) -> Result<(), StError> {
    match &expr.ast {
        Ast::Assign(name, rhs) => {
            let value = eval_ast(rhs, graph, ctx)?;
            let target = resolve_assignment_target(graph, ctx, name);
            ctx.effects.set_attr(target, format!("locals.{name}"), value);
            Ok(())
        }
        other => {
            eval_ast(other, graph, ctx)?;
            Ok(())
        }
    }
}

/// Expands `{{ expr }}` interpolations in `template` against `ctx`'s
/// namespace, restricted to the predicate grammar (no assignment). Used by
/// the JOURNAL phase to render a block/concept's authored content string.
///
/// # Errors
/// Returns [`StError::UnsafeExpression`] if an embedded expression fails to
/// compile.
pub fn expand_template(template: &str, graph: &Graph, ctx: &Context) -> Result<String, StError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            return Err(unsafe_expr("unterminated template expression"));
        };
        let source = after[..close].trim();
        let compiled = compile_predicate(source)?;
        let value = eval_ast(&compiled.ast, graph, ctx)?;
        out.push_str(&value.render());
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// A read-mostly cache of compiled expressions keyed by `(entity uid,
/// source hash)`, shared by the executing VM across ticks. Protected by an
/// `RwLock` rather than cloned per-tick since entries are immutable once
/// inserted (design note: "Global mutable state").
#[derive(Debug, Default)]
pub struct ExprCache {
    entries: RwLock<HashMap<(uuid::Uuid, u64), std::sync::Arc<CompiledExpr>>>,
}

impl ExprCache {
    /// An empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached compilation of `source` for `owner`, compiling
    /// (effect-mode per `effect_mode`) and inserting on a cache miss.
    ///
    /// # Errors
    /// Propagates [`StError::UnsafeExpression`] from a failed compile.
    pub fn get_or_compile(
        &self,
        owner: uuid::Uuid,
        source: &str,
        effect_mode: bool,
    ) -> Result<std::sync::Arc<CompiledExpr>, StError> {
        let hash = fnv1a(source);
        let key = (owner, hash);
        if let Some(hit) = self.entries.read().unwrap_or_else(|e| e.into_inner()).get(&key) {
            return Ok(hit.clone());
        }
        let compiled = std::sync::Arc::new(compile(source, effect_mode)?);
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, compiled.clone());
        Ok(compiled)
    }
}

/// Arguments bundle placeholder so dispatch-style call sites that pass
/// `with_kwargs` to the evaluator have somewhere typed to put them; unused
/// by the evaluator itself today (no builtin currently consumes keyword
/// arguments) but kept so an author-facing builtin can be added without
/// another signature change.
pub type Kwargs = BTreeMap<String, Value>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::entity::{Node, NodeKind};
    use crate::ident::NodeId;

    fn ctx_over(graph: &mut Graph) -> (NodeId, Context) {
        let uid = graph.add_node(Node::new(NodeId::new(), NodeKind::Block, "b"));
        (uid, Context::new(uid))
    }

    #[test]
    fn rejects_dunder_access() {
        assert!(matches!(
            compile_predicate("foo.__class__"),
            Err(StError::UnsafeExpression { .. })
        ));
    }

    #[test]
    fn undefined_name_is_falsy_not_an_error() {
        let mut graph = Graph::new();
        let (_uid, ctx) = ctx_over(&mut graph);
        let expr = compile_predicate("nonexistent").unwrap();
        assert!(!eval_predicate(&expr, &graph, &ctx));
    }

    #[test]
    fn arithmetic_and_comparison_evaluate() {
        let mut graph = Graph::new();
        let (_uid, ctx) = ctx_over(&mut graph);
        let expr = compile_predicate("1 + 2 == 3").unwrap();
        assert!(eval_predicate(&expr, &graph, &ctx));
    }

    #[test]
    fn effect_assignment_targets_cursor_locals_when_undefined_elsewhere() {
        let mut graph = Graph::new();
        let (uid, mut ctx) = ctx_over(&mut graph);
        let expr = compile_effect("score = 5").unwrap();
        eval_effect(&expr, &graph, &mut ctx).unwrap();
        assert_eq!(ctx.effects.effects().len(), 1);
        let preview = ctx.effects.preview(&graph);
        assert_eq!(
            preview.get(uid).unwrap().locals.get("score"),
            Some(&Value::Int(5))
        );
    }

    #[test]
    fn pronoun_filter_renders_gendered_form() {
        assert_eq!(PronounFilter::Subject.render(Some("f")), "she");
        assert_eq!(PronounFilter::Object.render(Some("m")), "him");
        assert_eq!(PronounFilter::Reflexive.render(None), "themself");
    }

    #[test]
    fn template_expansion_interpolates_and_renders() {
        let mut graph = Graph::new();
        let (_uid, ctx) = ctx_over(&mut graph);
        let out = expand_template("you see {{ 1 + 1 }} doors", &graph, &ctx).unwrap();
        assert_eq!(out, "you see 2 doors");
    }
}

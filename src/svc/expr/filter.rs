//! # Filter module
//!
//! This module provides the built-in expression engine. It implements the
//! subset of the jq filter language the mapping contract relies on: identity,
//! field paths with optional access, array indexing, literals, equality and
//! ordering comparisons, `and`/`or`, the `//` alternative operator, pipes and
//! a handful of builtin filters (`not`, `length`, `tostring`, `tonumber`).

use std::sync::Arc;

use serde_json::{Number, Value};

use crate::svc::expr::{truthy, Engine, Error, Expression};

// -----------------------------------------------------------------------------
// Token enumeration

#[derive(PartialEq, Clone, Debug)]
enum Token {
    Dot,
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    Null,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Pipe,
    Question,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Alt,
}

// -----------------------------------------------------------------------------
// Ast enumeration

#[derive(Clone, Debug)]
enum Ast {
    Identity,
    Literal(Value),
    Field(Box<Ast>, String, bool),
    Index(Box<Ast>, i64, bool),
    Pipe(Box<Ast>, Box<Ast>),
    Compare(Box<Ast>, CmpOp, Box<Ast>),
    And(Box<Ast>, Box<Ast>),
    Or(Box<Ast>, Box<Ast>),
    Alternative(Box<Ast>, Box<Ast>),
    Builtin(Builtin),
}

#[derive(Clone, Copy, Debug)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Copy, Debug)]
enum Builtin {
    Not,
    Length,
    ToString,
    ToNumber,
}

// -----------------------------------------------------------------------------
// Lexer

struct Lexer<'a> {
    source: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
        }
    }

    fn error(&self, offset: usize, message: impl Into<String>) -> Error {
        Error::Parse {
            expression: self.source.to_string(),
            offset,
            message: message.into(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<(usize, Token)>, Error> {
        let mut tokens = vec![];

        while let Some((offset, c)) = self.chars.next() {
            let token = match c {
                c if c.is_whitespace() => continue,
                '.' => Token::Dot,
                '[' => Token::LBracket,
                ']' => Token::RBracket,
                '(' => Token::LParen,
                ')' => Token::RParen,
                '|' => Token::Pipe,
                '?' => Token::Question,
                '=' => match self.chars.next() {
                    Some((_, '=')) => Token::Eq,
                    _ => return Err(self.error(offset, "expected '==' operator")),
                },
                '!' => match self.chars.next() {
                    Some((_, '=')) => Token::Ne,
                    _ => return Err(self.error(offset, "expected '!=' operator")),
                },
                '<' => match self.chars.peek() {
                    Some((_, '=')) => {
                        self.chars.next();
                        Token::Le
                    }
                    _ => Token::Lt,
                },
                '>' => match self.chars.peek() {
                    Some((_, '=')) => {
                        self.chars.next();
                        Token::Ge
                    }
                    _ => Token::Gt,
                },
                '/' => match self.chars.next() {
                    Some((_, '/')) => Token::Alt,
                    _ => return Err(self.error(offset, "expected '//' operator")),
                },
                '"' => Token::Str(self.string(offset)?),
                '-' => Token::Num(-self.number(offset)?),
                c if c.is_ascii_digit() => {
                    let number = self.number_from(offset, c)?;
                    Token::Num(number)
                }
                c if c.is_alphabetic() || c == '_' => {
                    let ident = self.ident(c);
                    match ident.as_str() {
                        "true" => Token::True,
                        "false" => Token::False,
                        "null" => Token::Null,
                        "and" => Token::And,
                        "or" => Token::Or,
                        _ => Token::Ident(ident),
                    }
                }
                c => return Err(self.error(offset, format!("unexpected character '{c}'"))),
            };

            tokens.push((offset, token));
        }

        Ok(tokens)
    }

    fn string(&mut self, start: usize) -> Result<String, Error> {
        let mut buf = String::new();

        loop {
            match self.chars.next() {
                None => return Err(self.error(start, "unterminated string literal")),
                Some((_, '"')) => return Ok(buf),
                Some((offset, '\\')) => match self.chars.next() {
                    Some((_, '"')) => buf.push('"'),
                    Some((_, '\\')) => buf.push('\\'),
                    Some((_, '/')) => buf.push('/'),
                    Some((_, 'n')) => buf.push('\n'),
                    Some((_, 't')) => buf.push('\t'),
                    Some((_, 'r')) => buf.push('\r'),
                    Some((_, 'u')) => {
                        let mut code = 0u32;
                        for _ in 0..4 {
                            match self.chars.next().and_then(|(_, c)| c.to_digit(16)) {
                                Some(digit) => code = code * 16 + digit,
                                None => {
                                    return Err(
                                        self.error(offset, "invalid unicode escape sequence")
                                    )
                                }
                            }
                        }
                        match char::from_u32(code) {
                            Some(c) => buf.push(c),
                            None => {
                                return Err(self.error(offset, "invalid unicode escape sequence"))
                            }
                        }
                    }
                    _ => return Err(self.error(offset, "invalid escape sequence")),
                },
                Some((_, c)) => buf.push(c),
            }
        }
    }

    fn number(&mut self, start: usize) -> Result<f64, Error> {
        match self.chars.next() {
            Some((_, c)) if c.is_ascii_digit() => self.number_from(start, c),
            _ => Err(self.error(start, "expected a digit after '-'")),
        }
    }

    fn number_from(&mut self, start: usize, first: char) -> Result<f64, Error> {
        let mut buf = String::from(first);

        while let Some((_, c)) = self.chars.peek() {
            if c.is_ascii_digit() || *c == '.' {
                buf.push(*c);
                self.chars.next();
            } else {
                break;
            }
        }

        buf.parse::<f64>()
            .map_err(|err| self.error(start, format!("invalid number literal, {err}")))
    }

    fn ident(&mut self, first: char) -> String {
        let mut buf = String::from(first);

        while let Some((_, c)) = self.chars.peek() {
            if c.is_alphanumeric() || *c == '_' {
                buf.push(*c);
                self.chars.next();
            } else {
                break;
            }
        }

        buf
    }
}

// -----------------------------------------------------------------------------
// Parser

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<(usize, Token)>,
    position: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str, tokens: Vec<(usize, Token)>) -> Self {
        Self {
            source,
            tokens,
            position: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> Error {
        let offset = self
            .tokens
            .get(self.position)
            .map(|(offset, _)| *offset)
            .unwrap_or(self.source.len());

        Error::Parse {
            expression: self.source.to_string(),
            offset,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position).map(|(_, token)| token)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).map(|(_, token)| token.to_owned());
        if token.is_some() {
            self.position += 1;
        }

        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.position += 1;
            return true;
        }

        false
    }

    fn parse(mut self) -> Result<Ast, Error> {
        let ast = self.pipe()?;
        if self.peek().is_some() {
            return Err(self.error("unexpected trailing tokens"));
        }

        Ok(ast)
    }

    fn pipe(&mut self) -> Result<Ast, Error> {
        let mut ast = self.alternative()?;

        while self.eat(&Token::Pipe) {
            let rhs = self.alternative()?;
            ast = Ast::Pipe(Box::new(ast), Box::new(rhs));
        }

        Ok(ast)
    }

    fn alternative(&mut self) -> Result<Ast, Error> {
        let mut ast = self.or()?;

        while self.eat(&Token::Alt) {
            let rhs = self.or()?;
            ast = Ast::Alternative(Box::new(ast), Box::new(rhs));
        }

        Ok(ast)
    }

    fn or(&mut self) -> Result<Ast, Error> {
        let mut ast = self.and()?;

        while self.eat(&Token::Or) {
            let rhs = self.and()?;
            ast = Ast::Or(Box::new(ast), Box::new(rhs));
        }

        Ok(ast)
    }

    fn and(&mut self) -> Result<Ast, Error> {
        let mut ast = self.comparison()?;

        while self.eat(&Token::And) {
            let rhs = self.comparison()?;
            ast = Ast::And(Box::new(ast), Box::new(rhs));
        }

        Ok(ast)
    }

    fn comparison(&mut self) -> Result<Ast, Error> {
        let ast = self.postfix()?;

        let op = match self.peek() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            _ => return Ok(ast),
        };

        self.position += 1;
        let rhs = self.postfix()?;

        Ok(Ast::Compare(Box::new(ast), op, Box::new(rhs)))
    }

    fn postfix(&mut self) -> Result<Ast, Error> {
        let mut ast = if self.eat(&Token::Dot) {
            match self.peek() {
                Some(Token::Ident(_)) => {
                    let name = match self.next() {
                        Some(Token::Ident(name)) => name,
                        _ => unreachable!("peeked an identifier"),
                    };
                    let optional = self.eat(&Token::Question);

                    Ast::Field(Box::new(Ast::Identity), name, optional)
                }
                _ => Ast::Identity,
            }
        } else {
            self.primary()?
        };

        loop {
            if self.eat(&Token::Dot) {
                let name = match self.next() {
                    Some(Token::Ident(name)) => name,
                    _ => return Err(self.error("expected a field name after '.'")),
                };
                let optional = self.eat(&Token::Question);

                ast = Ast::Field(Box::new(ast), name, optional);
            } else if self.eat(&Token::LBracket) {
                ast = match self.next() {
                    Some(Token::Num(n)) => {
                        if n.fract() != 0.0 {
                            return Err(self.error("array index must be an integer"));
                        }
                        if !self.eat(&Token::RBracket) {
                            return Err(self.error("expected ']' after index"));
                        }
                        let optional = self.eat(&Token::Question);

                        Ast::Index(Box::new(ast), n as i64, optional)
                    }
                    Some(Token::Str(name)) => {
                        if !self.eat(&Token::RBracket) {
                            return Err(self.error("expected ']' after key"));
                        }
                        let optional = self.eat(&Token::Question);

                        Ast::Field(Box::new(ast), name, optional)
                    }
                    _ => return Err(self.error("expected an index or a key inside '[]'")),
                };
            } else {
                return Ok(ast);
            }
        }
    }

    fn primary(&mut self) -> Result<Ast, Error> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Ast::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Ast::Literal(number(n))),
            Some(Token::True) => Ok(Ast::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Ast::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Ast::Literal(Value::Null)),
            Some(Token::LParen) => {
                let ast = self.pipe()?;
                if !self.eat(&Token::RParen) {
                    return Err(self.error("expected ')'"));
                }

                Ok(ast)
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "not" => Ok(Ast::Builtin(Builtin::Not)),
                "length" => Ok(Ast::Builtin(Builtin::Length)),
                "tostring" => Ok(Ast::Builtin(Builtin::ToString)),
                "tonumber" => Ok(Ast::Builtin(Builtin::ToNumber)),
                _ => {
                    self.position -= 1;
                    Err(self.error(format!("unknown function '{name}'")))
                }
            },
            _ => Err(self.error("expected an expression")),
        }
    }
}

// -----------------------------------------------------------------------------
// Evaluation

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        return Value::Number(Number::from(n as i64));
    }

    Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn numbers_eq(lhs: &Value, rhs: &Value) -> Option<bool> {
    match (lhs, rhs) {
        (Value::Number(l), Value::Number(r)) => Some(l.as_f64() == r.as_f64()),
        _ => None,
    }
}

fn eval(ast: &Ast, input: &Value) -> Result<Value, Error> {
    match ast {
        Ast::Identity => Ok(input.to_owned()),
        Ast::Literal(value) => Ok(value.to_owned()),
        Ast::Field(inner, name, optional) => {
            let value = eval(inner, input)?;
            match value {
                Value::Null => Ok(Value::Null),
                Value::Object(map) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
                _ if *optional => Ok(Value::Null),
                value => Err(Error::Evaluate(format!(
                    "cannot index {} with '{name}'",
                    kind_of(&value)
                ))),
            }
        }
        Ast::Index(inner, index, optional) => {
            let value = eval(inner, input)?;
            match value {
                Value::Null => Ok(Value::Null),
                Value::Array(items) => {
                    let len = items.len() as i64;
                    let index = if *index < 0 { len + index } else { *index };

                    if (0..len).contains(&index) {
                        Ok(items[index as usize].to_owned())
                    } else {
                        Ok(Value::Null)
                    }
                }
                _ if *optional => Ok(Value::Null),
                value => Err(Error::Evaluate(format!(
                    "cannot index {} with number {index}",
                    kind_of(&value)
                ))),
            }
        }
        Ast::Pipe(lhs, rhs) => {
            let value = eval(lhs, input)?;
            eval(rhs, &value)
        }
        Ast::Compare(lhs, op, rhs) => {
            let lhs = eval(lhs, input)?;
            let rhs = eval(rhs, input)?;

            compare(&lhs, *op, &rhs)
        }
        Ast::And(lhs, rhs) => {
            if !truthy(&eval(lhs, input)?) {
                return Ok(Value::Bool(false));
            }

            Ok(Value::Bool(truthy(&eval(rhs, input)?)))
        }
        Ast::Or(lhs, rhs) => {
            if truthy(&eval(lhs, input)?) {
                return Ok(Value::Bool(true));
            }

            Ok(Value::Bool(truthy(&eval(rhs, input)?)))
        }
        Ast::Alternative(lhs, rhs) => {
            let value = eval(lhs, input)?;
            if truthy(&value) {
                return Ok(value);
            }

            eval(rhs, input)
        }
        Ast::Builtin(builtin) => apply(*builtin, input),
    }
}

fn compare(lhs: &Value, op: CmpOp, rhs: &Value) -> Result<Value, Error> {
    let result = match op {
        CmpOp::Eq => numbers_eq(lhs, rhs).unwrap_or_else(|| lhs == rhs),
        CmpOp::Ne => !numbers_eq(lhs, rhs).unwrap_or_else(|| lhs == rhs),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ordering = match (lhs, rhs) {
                (Value::Number(l), Value::Number(r)) => l
                    .as_f64()
                    .partial_cmp(&r.as_f64())
                    .ok_or_else(|| Error::Evaluate("numbers are not comparable".to_string()))?,
                (Value::String(l), Value::String(r)) => l.cmp(r),
                (lhs, rhs) => {
                    return Err(Error::Evaluate(format!(
                        "cannot compare {} with {}",
                        kind_of(lhs),
                        kind_of(rhs)
                    )))
                }
            };

            match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Ge => ordering.is_ge(),
                CmpOp::Eq | CmpOp::Ne => unreachable!("handled above"),
            }
        }
    };

    Ok(Value::Bool(result))
}

fn apply(builtin: Builtin, input: &Value) -> Result<Value, Error> {
    match builtin {
        Builtin::Not => Ok(Value::Bool(!truthy(input))),
        Builtin::Length => match input {
            Value::Null => Ok(Value::Number(Number::from(0))),
            Value::String(s) => Ok(Value::Number(Number::from(s.chars().count() as u64))),
            Value::Array(items) => Ok(Value::Number(Number::from(items.len() as u64))),
            Value::Object(map) => Ok(Value::Number(Number::from(map.len() as u64))),
            value => Err(Error::Evaluate(format!(
                "{} has no length",
                kind_of(value)
            ))),
        },
        Builtin::ToString => match input {
            Value::String(s) => Ok(Value::String(s.to_owned())),
            value => serde_json::to_string(value)
                .map(Value::String)
                .map_err(|err| Error::Evaluate(err.to_string())),
        },
        Builtin::ToNumber => match input {
            Value::Number(n) => Ok(Value::Number(n.to_owned())),
            Value::String(s) => s
                .parse::<f64>()
                .map(number)
                .map_err(|err| Error::Evaluate(format!("cannot parse '{s}' as number, {err}"))),
            value => Err(Error::Evaluate(format!(
                "cannot convert {} to number",
                kind_of(value)
            ))),
        },
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// -----------------------------------------------------------------------------
// Filter structure

pub struct Filter {
    ast: Ast,
}

impl Expression for Filter {
    fn evaluate(&self, input: &Value) -> Result<Value, Error> {
        eval(&self.ast, input)
    }
}

// -----------------------------------------------------------------------------
// FilterEngine structure

#[derive(Clone, Copy, Default, Debug)]
pub struct FilterEngine;

impl Engine for FilterEngine {
    fn compile(&self, source: &str) -> Result<Arc<dyn Expression>, Error> {
        let tokens = Lexer::new(source).tokenize()?;
        let ast = Parser::new(source, tokens).parse()?;

        Ok(Arc::new(Filter { ast }))
    }
}

// -----------------------------------------------------------------------------
// Tests

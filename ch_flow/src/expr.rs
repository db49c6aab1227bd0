//! ABOUTME: Minimal boolean condition language for workflow steps
//! ABOUTME: ==, !=, &&, ||, !, parentheses, literals and identifiers

use ch_core::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;

/// Tokens of the condition grammar
#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Eq,
    Ne,
    And,
    Or,
    Not,
    LParen,
    RParen,
}

/// Parsed condition AST
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Ident(String),
    Str(String),
    Num(f64),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

fn lex(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '=' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(Error::BadRequest("expected '==' in condition".to_string()));
                }
                tokens.push(Token::Eq);
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Not);
                }
            }
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    return Err(Error::BadRequest("expected '&&' in condition".to_string()));
                }
                tokens.push(Token::And);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return Err(Error::BadRequest("expected '||' in condition".to_string()));
                }
                tokens.push(Token::Or);
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => s.push(ch),
                        None => {
                            return Err(Error::BadRequest(
                                "unterminated string in condition".to_string(),
                            ))
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let mut s = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_digit() || ch == '.' {
                        s.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n: f64 = s
                    .parse()
                    .map_err(|_| Error::BadRequest(format!("bad number '{}' in condition", s)))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        s.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(s));
            }
            other => {
                return Err(Error::BadRequest(format!(
                    "unexpected character '{}' in condition",
                    other
                )))
            }
        }
    }

    Ok(tokens)
}

/// Recursive-descent parser: or -> and -> unary -> comparison -> primary
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_primary()?;
        match self.peek() {
            Some(Token::Eq) => {
                self.next();
                let right = self.parse_primary()?;
                Ok(Expr::Eq(Box::new(left), Box::new(right)))
            }
            Some(Token::Ne) => {
                self.next();
                let right = self.parse_primary()?;
                Ok(Expr::Ne(Box::new(left), Box::new(right)))
            }
            _ => Ok(left),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Ident(s)) => Ok(Expr::Ident(s)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(Error::BadRequest("missing ')' in condition".to_string())),
                }
            }
            other => Err(Error::BadRequest(format!(
                "unexpected token {:?} in condition",
                other
            ))),
        }
    }
}

/// Parse a condition into its AST; rejects everything the grammar does not
/// explicitly accept.
pub fn parse(input: &str) -> Result<Expr> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::BadRequest("empty condition".to_string()));
    }

    // Bareword status shortcuts are sugar for task_status comparisons
    if matches!(trimmed, "success" | "failed" | "error" | "timeout") {
        return Ok(Expr::Eq(
            Box::new(Expr::Ident("task_status".to_string())),
            Box::new(Expr::Str(trimmed.to_string())),
        ));
    }

    let tokens = lex(trimmed)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(Error::BadRequest(format!(
            "trailing input in condition '{}'",
            input
        )));
    }
    Ok(expr)
}

/// Evaluated value lattice: everything compares as a string or number
#[derive(Debug, Clone, PartialEq)]
enum Evaluated {
    Str(String),
    Num(f64),
    Bool(bool),
    Missing,
}

impl Evaluated {
    fn truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Num(n) => *n != 0.0,
            Self::Str(s) => !s.is_empty() && s != "false",
            Self::Missing => false,
        }
    }

    fn loose_eq(&self, other: &Evaluated) -> bool {
        match (self, other) {
            (Self::Num(a), Self::Num(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            // Numbers reported as strings still compare
            (Self::Num(a), Self::Str(b)) | (Self::Str(b), Self::Num(a)) => {
                b.parse::<f64>().map(|v| v == *a).unwrap_or(false)
            }
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Bool(a), Self::Str(b)) | (Self::Str(b), Self::Bool(a)) => {
                b == if *a { "true" } else { "false" }
            }
            (Self::Missing, Self::Missing) => true,
            _ => false,
        }
    }
}

fn value_to_evaluated(v: &Value) -> Evaluated {
    match v {
        Value::String(s) => Evaluated::Str(s.clone()),
        Value::Number(n) => Evaluated::Num(n.as_f64().unwrap_or(f64::NAN)),
        Value::Bool(b) => Evaluated::Bool(*b),
        Value::Null => Evaluated::Missing,
        other => Evaluated::Str(other.to_string()),
    }
}

fn eval(expr: &Expr, ctx: &HashMap<String, Value>) -> Evaluated {
    match expr {
        Expr::Ident(name) => ctx
            .get(name)
            .map(value_to_evaluated)
            .unwrap_or(Evaluated::Missing),
        Expr::Str(s) => Evaluated::Str(s.clone()),
        Expr::Num(n) => Evaluated::Num(*n),
        Expr::Eq(a, b) => Evaluated::Bool(eval(a, ctx).loose_eq(&eval(b, ctx))),
        Expr::Ne(a, b) => Evaluated::Bool(!eval(a, ctx).loose_eq(&eval(b, ctx))),
        Expr::And(a, b) => Evaluated::Bool(eval(a, ctx).truthy() && eval(b, ctx).truthy()),
        Expr::Or(a, b) => Evaluated::Bool(eval(a, ctx).truthy() || eval(b, ctx).truthy()),
        Expr::Not(a) => Evaluated::Bool(!eval(a, ctx).truthy()),
    }
}

/// Evaluate a condition against a read-only context. Empty input means
/// always-run.
pub fn evaluate(input: &str, ctx: &HashMap<String, Value>) -> Result<bool> {
    if input.trim().is_empty() {
        return Ok(true);
    }
    let expr = parse(input)?;
    Ok(eval(&expr, ctx).truthy())
}

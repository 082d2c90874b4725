//! Expression Parsing and Evaluation
//!
//! A small recursive-descent parser building a tagged AST, evaluated
//! against a read-only [`ExprScope`]. Precedence, loosest first:
//! `||`, `&&`, `==`/`!=`, `!`, primary.

use crate::error::EngineError;

use super::lexer::{tokenize, Token};
use super::{ExprScope, StatusFlags, Value};

/// Expression AST.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal value
    Lit(Value),
    /// Dotted context path
    Path(Vec<String>),
    /// Zero-argument built-in predicate
    Call(String),
    /// `!expr`
    Not(Box<Expr>),
    /// `lhs && rhs`
    And(Box<Expr>, Box<Expr>),
    /// `lhs || rhs`
    Or(Box<Expr>, Box<Expr>),
    /// `lhs == rhs`
    Eq(Box<Expr>, Box<Expr>),
    /// `lhs != rhs`
    Ne(Box<Expr>, Box<Expr>),
}

struct Parser<'a> {
    text: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, message: impl Into<String>) -> EngineError {
        EngineError::ExpressionSyntax {
            expression: self.text.to_string(),
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Expr, EngineError> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Token::Or) {
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, EngineError> {
        let mut lhs = self.parse_equality()?;
        while self.eat(&Token::And) {
            let rhs = self.parse_equality()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr, EngineError> {
        let mut lhs = self.parse_unary()?;
        loop {
            if self.eat(&Token::Eq) {
                let rhs = self.parse_unary()?;
                lhs = Expr::Eq(Box::new(lhs), Box::new(rhs));
            } else if self.eat(&Token::Ne) {
                let rhs = self.parse_unary()?;
                lhs = Expr::Ne(Box::new(lhs), Box::new(rhs));
            } else {
                break;
            }
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, EngineError> {
        if self.eat(&Token::Bang) {
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, EngineError> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Expr::Lit(Value::Num(n))),
            Some(Token::Str(s)) => Ok(Expr::Lit(Value::Str(s))),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                if !self.eat(&Token::RParen) {
                    return Err(self.error("expected ')'"));
                }
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                // Keyword literals first.
                match name.as_str() {
                    "true" => return Ok(Expr::Lit(Value::Bool(true))),
                    "false" => return Ok(Expr::Lit(Value::Bool(false))),
                    "null" => return Ok(Expr::Lit(Value::Empty)),
                    _ => {}
                }

                // A '(' makes this a predicate call; the built-ins take
                // no arguments.
                if self.eat(&Token::LParen) {
                    if !self.eat(&Token::RParen) {
                        return Err(self.error(format!("'{}' takes no arguments", name)));
                    }
                    return Ok(Expr::Call(name));
                }

                // Otherwise it is a dotted context path.
                let mut path = vec![name];
                while self.eat(&Token::Dot) {
                    match self.next() {
                        Some(Token::Ident(segment)) => path.push(segment),
                        _ => return Err(self.error("expected path segment after '.'")),
                    }
                }
                Ok(Expr::Path(path))
            }
            Some(other) => Err(self.error(format!("unexpected token {:?}", other))),
            None => Err(self.error("unexpected end of expression")),
        }
    }
}

/// Parses expression text into an AST.
pub fn parse(text: &str) -> Result<Expr, EngineError> {
    let tokens = tokenize(text)?;
    if tokens.is_empty() {
        return Err(EngineError::ExpressionSyntax {
            expression: text.to_string(),
            message: "empty expression".to_string(),
        });
    }

    let mut parser = Parser {
        text,
        tokens,
        pos: 0,
    };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(parser.error("trailing tokens after expression"));
    }
    Ok(expr)
}

fn eval_call(name: &str, flags: StatusFlags, text: &str) -> Result<Value, EngineError> {
    let result = match name {
        "always" => true,
        "success" => flags.success,
        "failure" => flags.failure,
        "cancelled" => flags.cancelled,
        _ => {
            return Err(EngineError::ExpressionSyntax {
                expression: text.to_string(),
                message: format!("unknown function '{}'", name),
            })
        }
    };
    Ok(Value::Bool(result))
}

fn eval_expr(expr: &Expr, scope: &dyn ExprScope, text: &str) -> Result<Value, EngineError> {
    match expr {
        Expr::Lit(value) => Ok(value.clone()),
        Expr::Path(path) => {
            let segments: Vec<&str> = path.iter().map(String::as_str).collect();
            Ok(scope.lookup(&segments))
        }
        Expr::Call(name) => eval_call(name, scope.status(), text),
        Expr::Not(inner) => Ok(Value::Bool(!eval_expr(inner, scope, text)?.truthy())),
        // && and || return the deciding operand, as the source
        // expressions do, not a coerced boolean.
        Expr::And(lhs, rhs) => {
            let left = eval_expr(lhs, scope, text)?;
            if left.truthy() {
                eval_expr(rhs, scope, text)
            } else {
                Ok(left)
            }
        }
        Expr::Or(lhs, rhs) => {
            let left = eval_expr(lhs, scope, text)?;
            if left.truthy() {
                Ok(left)
            } else {
                eval_expr(rhs, scope, text)
            }
        }
        Expr::Eq(lhs, rhs) => {
            let left = eval_expr(lhs, scope, text)?;
            let right = eval_expr(rhs, scope, text)?;
            Ok(Value::Bool(left.loose_eq(&right)))
        }
        Expr::Ne(lhs, rhs) => {
            let left = eval_expr(lhs, scope, text)?;
            let right = eval_expr(rhs, scope, text)?;
            Ok(Value::Bool(!left.loose_eq(&right)))
        }
    }
}

/// Strips a single `${{ ... }}` wrapper when it spans the whole text.
/// Conditions are written both bare and wrapped in the source material.
fn strip_wrapper(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(inner) = trimmed
        .strip_prefix("${{")
        .and_then(|rest| rest.strip_suffix("}}"))
    {
        if !inner.contains("${{") {
            return inner;
        }
    }
    trimmed
}

/// Evaluates expression text against a context snapshot.
pub fn evaluate(text: &str, scope: &dyn ExprScope) -> Result<Value, EngineError> {
    let expr = parse(strip_wrapper(text))?;
    eval_expr(&expr, scope, text)
}

/// Evaluates a conditional expression to a boolean.
pub fn evaluate_condition(text: &str, scope: &dyn ExprScope) -> Result<bool, EngineError> {
    Ok(evaluate(text, scope)?.truthy())
}

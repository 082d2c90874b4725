//! Expression Tokenizer
//!
//! Scans expression text into tokens. The grammar is intentionally small:
//! dotted context paths, single-quoted strings, numbers, booleans, the
//! boolean operators, (in)equality, and zero-argument function calls.

use crate::error::EngineError;

/// One scanned token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Identifier or path segment
    Ident(String),
    /// Single-quoted string literal (doubled quote escapes a quote)
    Str(String),
    /// Numeric literal
    Num(f64),
    /// `.`
    Dot,
    /// `!`
    Bang,
    /// `&&`
    And,
    /// `||`
    Or,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `(`
    LParen,
    /// `)`
    RParen,
}

fn syntax_error(expression: &str, message: impl Into<String>) -> EngineError {
    EngineError::ExpressionSyntax {
        expression: expression.to_string(),
        message: message.into(),
    }
}

/// Scans an expression into a token list.
pub fn tokenize(text: &str) -> Result<Vec<Token>, EngineError> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
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
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Bang);
                }
            }
            '=' => {
                chars.next();
                if chars.next() == Some('=') {
                    tokens.push(Token::Eq);
                } else {
                    return Err(syntax_error(text, "single '=' (did you mean '==')"));
                }
            }
            '&' => {
                chars.next();
                if chars.next() == Some('&') {
                    tokens.push(Token::And);
                } else {
                    return Err(syntax_error(text, "single '&' (did you mean '&&')"));
                }
            }
            '|' => {
                chars.next();
                if chars.next() == Some('|') {
                    tokens.push(Token::Or);
                } else {
                    return Err(syntax_error(text, "single '|' (did you mean '||')"));
                }
            }
            '\'' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => {
                            // A doubled quote is an escaped quote.
                            if chars.peek() == Some(&'\'') {
                                chars.next();
                                s.push('\'');
                            } else {
                                break;
                            }
                        }
                        Some(c) => s.push(c),
                        None => return Err(syntax_error(text, "unterminated string literal")),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut num = String::new();
                num.push(c);
                chars.next();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        num.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value: f64 = num
                    .parse()
                    .map_err(|_| syntax_error(text, format!("bad number '{}'", num)))?;
                tokens.push(Token::Num(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' || d == '-' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(syntax_error(text, format!("unexpected character '{}'", other)));
            }
        }
    }

    Ok(tokens)
}

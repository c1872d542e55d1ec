// Hand-rolled lexer for the contents of a single `${{ ... }}` block. A
// hand-rolled lexer/parser pair matches the teacher's own hand-rolled
// expression evaluator (`expressions/mod.rs`) rather than pulling in a
// generic parser-combinator crate for a grammar this small.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum LexError {
    #[error("unterminated string literal starting at byte {0}")]
    UnterminatedString(usize),
    #[error("unexpected character '{0}' at byte {1}")]
    UnexpectedChar(char, usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    String(String),
    Number(f64),
    Bool(bool),
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    Bang,
}

pub fn tokenize(input: &str) -> Result<Vec<Token>, LexError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '=' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::EqEq);
                i += 2;
            }
            '&' if bytes.get(i + 1) == Some(&b'&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '|' if bytes.get(i + 1) == Some(&b'|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let start = i;
                i += 1;
                let mut s = String::new();
                let mut closed = false;
                while i < bytes.len() {
                    let ch = bytes[i] as char;
                    if ch == quote {
                        closed = true;
                        i += 1;
                        break;
                    }
                    s.push(ch);
                    i += 1;
                }
                if !closed {
                    return Err(LexError::UnterminatedString(start));
                }
                tokens.push(Token::String(s));
            }
            c if c.is_ascii_digit() || (c == '-' && next_is_digit(bytes, i)) => {
                let start = i;
                i += 1;
                while i < bytes.len() {
                    let ch = bytes[i] as char;
                    if ch.is_ascii_digit() || ch == '.' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let text = &input[start..i];
                let n: f64 = text
                    .parse()
                    .map_err(|_| LexError::UnexpectedChar(c, start))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                i += 1;
                while i < bytes.len() {
                    let ch = bytes[i] as char;
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let text = &input[start..i];
                match text {
                    "true" => tokens.push(Token::Bool(true)),
                    "false" => tokens.push(Token::Bool(false)),
                    _ => tokens.push(Token::Ident(text.to_string())),
                }
            }
            other => return Err(LexError::UnexpectedChar(other, i)),
        }
    }

    Ok(tokens)
}

fn next_is_digit(bytes: &[u8], i: usize) -> bool {
    bytes.get(i + 1).is_some_and(|b| b.is_ascii_digit())
}

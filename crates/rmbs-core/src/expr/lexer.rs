//! Rule tokenizer.
//!
//! Normalizes SQL-style tokens while lexing: `AND`/`OR`/`NOT` (word-bound),
//! `<>`, and `TRUE`/`FALSE` in any of their conventional spellings.

use rust_decimal::Decimal;

use crate::error::RmbsError;
use crate::RmbsResult;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(Decimal),
    Text(String),
    Ident(String),
    Bool(bool),
    Dot,
    Comma,
    LParen,
    RParen,
    Plus,
    Minus,
    Star,
    Slash,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    Not,
}

pub fn tokenize(input: &str) -> RmbsResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
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
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else if chars.get(i + 1) == Some(&'>') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(RmbsError::Calculation(
                        "single '=' is not a valid operator (use '==')".into(),
                    ));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    return Err(RmbsError::Calculation(
                        "unexpected character '!' in expression".into(),
                    ));
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => {
                            return Err(RmbsError::Calculation(
                                "unterminated string literal".into(),
                            ))
                        }
                    }
                }
                tokens.push(Token::Text(s));
            }
            _ if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    // A dot followed by a letter belongs to a path, not a number.
                    if chars[i] == '.'
                        && !chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())
                    {
                        break;
                    }
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let number = literal.parse::<Decimal>().map_err(|e| {
                    RmbsError::Calculation(format!("invalid number '{}': {}", literal, e))
                })?;
                tokens.push(Token::Number(number));
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(keyword_or_ident(word));
            }
            other => {
                return Err(RmbsError::Calculation(format!(
                    "unexpected character '{}' in expression",
                    other
                )))
            }
        }
    }

    Ok(tokens)
}

fn keyword_or_ident(word: String) -> Token {
    match word.as_str() {
        "and" | "AND" => Token::And,
        "or" | "OR" => Token::Or,
        "not" | "NOT" => Token::Not,
        "true" | "True" | "TRUE" => Token::Bool(true),
        "false" | "False" | "FALSE" => Token::Bool(false),
        _ => Token::Ident(word),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_tokenize_arithmetic() {
        let tokens = tokenize("1 + 2.5 * balance").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Number(dec!(1)),
                Token::Plus,
                Token::Number(dec!(2.5)),
                Token::Star,
                Token::Ident("balance".into()),
            ]
        );
    }

    #[test]
    fn test_tokenize_path() {
        let tokens = tokenize("bonds.A.balance").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("bonds".into()),
                Token::Dot,
                Token::Ident("A".into()),
                Token::Dot,
                Token::Ident("balance".into()),
            ]
        );
    }

    #[test]
    fn test_sql_tokens_normalized() {
        let tokens = tokenize("a AND b OR NOT c <> TRUE").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("a".into()),
                Token::And,
                Token::Ident("b".into()),
                Token::Or,
                Token::Not,
                Token::Ident("c".into()),
                Token::Ne,
                Token::Bool(true),
            ]
        );
    }

    #[test]
    fn test_number_then_path_dot() {
        // "2.wam" must not swallow the dot into the number
        let tokens = tokenize("collateral.wam - 2").unwrap();
        assert_eq!(tokens.len(), 5);
    }

    #[test]
    fn test_string_literals() {
        let tokens = tokenize("PoolStatus == 'ACTIVE'").unwrap();
        assert_eq!(tokens[2], Token::Text("ACTIVE".into()));
    }

    #[test]
    fn test_unterminated_string_fails() {
        assert!(tokenize("'oops").is_err());
    }

    #[test]
    fn test_single_equals_rejected() {
        assert!(tokenize("a = 1").is_err());
    }
}

//! Pratt parser for the rule grammar.
//!
//! Precedence, loosest first: `or`, `and`, `not`, comparisons, `+ -`,
//! `* /`, unary minus, calls/paths/literals/parentheses.

use rust_decimal::Decimal;

use crate::error::RmbsError;
use crate::RmbsResult;

use super::lexer::{tokenize, Token};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(Decimal),
    Bool(bool),
    Text(String),
    /// Dotted identifier path, e.g. `bonds.A.balance` or a bare name.
    Path(Vec<String>),
    /// Built-in call, e.g. `MIN(a, b)`.
    Call(String, Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

pub fn parse(input: &str) -> RmbsResult<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr(0)?;
    if parser.pos != parser.tokens.len() {
        return Err(RmbsError::Calculation(format!(
            "unexpected trailing input in expression '{}'",
            input
        )));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: &Token) -> RmbsResult<()> {
        match self.next() {
            Some(ref tok) if tok == expected => Ok(()),
            other => Err(RmbsError::Calculation(format!(
                "expected {:?}, found {:?}",
                expected, other
            ))),
        }
    }

    fn parse_expr(&mut self, min_bp: u8) -> RmbsResult<Expr> {
        let mut lhs = self.parse_prefix()?;

        while let Some(op) = self.peek().and_then(binary_op) {
            let bp = binding_power(op);
            if bp < min_bp {
                break;
            }
            self.next();
            let rhs = self.parse_expr(bp + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }

        Ok(lhs)
    }

    fn parse_prefix(&mut self) -> RmbsResult<Expr> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Bool(b)) => Ok(Expr::Bool(b)),
            Some(Token::Text(s)) => Ok(Expr::Text(s)),
            Some(Token::Minus) => {
                // Binds tighter than any binary operator
                let operand = self.parse_expr(7)?;
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(operand)))
            }
            Some(Token::Not) => {
                let operand = self.parse_expr(3)?;
                Ok(Expr::Unary(UnaryOp::Not, Box::new(operand)))
            }
            Some(Token::LParen) => {
                let inner = self.parse_expr(0)?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.next();
                    let args = self.parse_args()?;
                    return Ok(Expr::Call(name, args));
                }
                let mut path = vec![name];
                while self.peek() == Some(&Token::Dot) {
                    self.next();
                    match self.next() {
                        Some(Token::Ident(segment)) => path.push(segment),
                        other => {
                            return Err(RmbsError::Calculation(format!(
                                "expected identifier after '.', found {:?}",
                                other
                            )))
                        }
                    }
                }
                Ok(Expr::Path(path))
            }
            other => Err(RmbsError::Calculation(format!(
                "unexpected token {:?} in expression",
                other
            ))),
        }
    }

    fn parse_args(&mut self) -> RmbsResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.next();
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr(0)?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                other => {
                    return Err(RmbsError::Calculation(format!(
                        "expected ',' or ')' in argument list, found {:?}",
                        other
                    )))
                }
            }
        }
        Ok(args)
    }
}

fn binary_op(token: &Token) -> Option<BinaryOp> {
    match token {
        Token::Or => Some(BinaryOp::Or),
        Token::And => Some(BinaryOp::And),
        Token::Lt => Some(BinaryOp::Lt),
        Token::Le => Some(BinaryOp::Le),
        Token::Gt => Some(BinaryOp::Gt),
        Token::Ge => Some(BinaryOp::Ge),
        Token::Eq => Some(BinaryOp::Eq),
        Token::Ne => Some(BinaryOp::Ne),
        Token::Plus => Some(BinaryOp::Add),
        Token::Minus => Some(BinaryOp::Sub),
        Token::Star => Some(BinaryOp::Mul),
        Token::Slash => Some(BinaryOp::Div),
        _ => None,
    }
}

fn binding_power(op: BinaryOp) -> u8 {
    match op {
        BinaryOp::Or => 1,
        BinaryOp::And => 2,
        BinaryOp::Lt
        | BinaryOp::Le
        | BinaryOp::Gt
        | BinaryOp::Ge
        | BinaryOp::Eq
        | BinaryOp::Ne => 4,
        BinaryOp::Add | BinaryOp::Sub => 5,
        BinaryOp::Mul | BinaryOp::Div => 6,
    }
}

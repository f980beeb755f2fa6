//! Recursive descent parser for condition expressions.
//!
//! Precedence, lowest first: `||`, `&&`, equality and `=~`, ordering,
//! `+ -`, `* / %`, unary `! -`.

use super::ConditionError;
use super::Value;
use super::lexer::Token;

const MAX_NESTING: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Match,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Lit(Value),
    Var(String),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

pub(crate) fn parse(tokens: &[Token]) -> Result<Expr, ConditionError> {
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };

    if parser.peek() == Some(&Token::Return) {
        parser.pos += 1;
    }
    if parser.peek().is_none() {
        return Err(ConditionError::Parse("empty expression".to_string()));
    }

    let expr = parser.expression()?;
    while parser.peek() == Some(&Token::Semi) {
        parser.pos += 1;
    }

    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(ConditionError::Parse(format!("unexpected {token:?}"))),
    }
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        self.pos += 1;
        token
    }

    fn expression(&mut self) -> Result<Expr, ConditionError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(ConditionError::Parse("expression is nested too deeply".to_string()));
        }
        let expr = self.or();
        self.depth -= 1;
        expr
    }

    fn binary(
        &mut self,
        operand: fn(&mut Self) -> Result<Expr, ConditionError>,
        operator: fn(&Token) -> Option<BinOp>,
    ) -> Result<Expr, ConditionError> {
        let mut left = operand(self)?;
        while let Some(op) = self.peek().and_then(operator) {
            self.pos += 1;
            let right = operand(self)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn or(&mut self) -> Result<Expr, ConditionError> {
        self.binary(Self::and, |t| (t == &Token::Or).then_some(BinOp::Or))
    }

    fn and(&mut self) -> Result<Expr, ConditionError> {
        self.binary(Self::equality, |t| (t == &Token::And).then_some(BinOp::And))
    }

    fn equality(&mut self) -> Result<Expr, ConditionError> {
        self.binary(Self::ordering, |t| match t {
            Token::Eq => Some(BinOp::Eq),
            Token::Ne => Some(BinOp::Ne),
            Token::Match => Some(BinOp::Match),
            _ => None,
        })
    }

    fn ordering(&mut self) -> Result<Expr, ConditionError> {
        self.binary(Self::additive, |t| match t {
            Token::Lt => Some(BinOp::Lt),
            Token::Le => Some(BinOp::Le),
            Token::Gt => Some(BinOp::Gt),
            Token::Ge => Some(BinOp::Ge),
            _ => None,
        })
    }

    fn additive(&mut self) -> Result<Expr, ConditionError> {
        self.binary(Self::multiplicative, |t| match t {
            Token::Plus => Some(BinOp::Add),
            Token::Minus => Some(BinOp::Sub),
            _ => None,
        })
    }

    fn multiplicative(&mut self) -> Result<Expr, ConditionError> {
        self.binary(Self::unary, |t| match t {
            Token::Star => Some(BinOp::Mul),
            Token::Slash => Some(BinOp::Div),
            Token::Percent => Some(BinOp::Rem),
            _ => None,
        })
    }

    fn unary(&mut self) -> Result<Expr, ConditionError> {
        match self.peek() {
            Some(Token::Not) => {
                self.pos += 1;
                let operand = self.nested(Self::unary)?;
                Ok(Expr::Not(Box::new(operand)))
            }
            Some(Token::Minus) => {
                self.pos += 1;
                let operand = self.nested(Self::unary)?;
                Ok(Expr::Neg(Box::new(operand)))
            }
            _ => self.primary(),
        }
    }

    fn nested(&mut self, f: fn(&mut Self) -> Result<Expr, ConditionError>) -> Result<Expr, ConditionError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(ConditionError::Parse("expression is nested too deeply".to_string()));
        }
        let expr = f(self);
        self.depth -= 1;
        expr
    }

    fn primary(&mut self) -> Result<Expr, ConditionError> {
        let token = self
            .advance()
            .cloned()
            .ok_or_else(|| ConditionError::Parse("unexpected end of expression".to_string()))?;

        match token {
            Token::Num(n) => Ok(Expr::Lit(Value::Num(n))),
            Token::Str(s) => Ok(Expr::Lit(Value::Str(s))),
            Token::True => Ok(Expr::Lit(Value::Bool(true))),
            Token::False => Ok(Expr::Lit(Value::Bool(false))),
            Token::Null => Ok(Expr::Lit(Value::Null)),
            Token::Ident(name) => Ok(Expr::Var(name)),
            Token::LParen => {
                let expr = self.expression()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(expr),
                    _ => Err(ConditionError::Parse("missing ')'".to_string())),
                }
            }
            other => Err(ConditionError::Parse(format!("unexpected {other:?}"))),
        }
    }
}

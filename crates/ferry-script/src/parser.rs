//! Recursive descent parser for fy.

use thiserror::Error;

use crate::ast::{BinaryOp, Expr, Literal, Program, Stmt, UnaryOp};
use crate::lexer::{LexError, Lexer, Position, Token, TokenKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at {position}")]
pub struct ParseError {
    pub message: String,
    pub position: Position,
}

impl From<LexError> for ParseError {
    fn from(e: LexError) -> Self {
        Self {
            message: e.message,
            position: e.position,
        }
    }
}

const MAX_EXPRESSION_DEPTH: usize = 64;

/// Parse a complete program.
pub fn parse(source: &str) -> Result<Program, ParseError> {
    let tokens = Lexer::new(source).tokenize()?;
    Parser::new(tokens).parse_program()
}

pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
    depth: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            current: 0,
            depth: 0,
        }
    }

    pub fn parse_program(&mut self) -> Result<Program, ParseError> {
        let mut statements = Vec::new();
        self.skip_separators();
        while !self.check(&TokenKind::Eof) {
            statements.push(self.statement()?);
            if !self.check(&TokenKind::Eof) {
                if !self.is_separator() {
                    return Err(self.unexpected("end of statement"));
                }
                self.skip_separators();
            }
        }
        Ok(Program { statements })
    }

    // Token navigation

    fn peek(&self) -> &Token {
        // `tokenize` always ends with Eof and `advance` never moves past it.
        &self.tokens[self.current.min(self.tokens.len() - 1)]
    }

    fn peek_next(&self) -> &TokenKind {
        let index = (self.current + 1).min(self.tokens.len() - 1);
        &self.tokens[index].kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.current += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn matches(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<Token, ParseError> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(&format!("'{}'", kind)))
        }
    }

    fn identifier(&mut self) -> Result<String, ParseError> {
        match self.peek().kind.clone() {
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected("identifier")),
        }
    }

    fn is_separator(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Newline | TokenKind::Semicolon)
    }

    fn skip_separators(&mut self) {
        while self.is_separator() {
            self.advance();
        }
    }

    fn skip_newlines(&mut self) {
        while self.check(&TokenKind::Newline) {
            self.advance();
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        let token = self.peek();
        ParseError {
            message: format!("expected {} but found {}", expected, token.kind),
            position: token.position,
        }
    }

    // Statements

    fn statement(&mut self) -> Result<Stmt, ParseError> {
        let position = self.peek().position;
        match self.peek().kind {
            TokenKind::Export => {
                self.advance();
                self.expect(&TokenKind::Let)?;
                self.let_binding(true, position)
            }
            TokenKind::Let => {
                self.advance();
                self.let_binding(false, position)
            }
            TokenKind::Import if self.peek_next() == &TokenKind::LeftBrace => {
                self.import_declaration(position)
            }
            TokenKind::Throw => {
                self.advance();
                Ok(Stmt::Throw(self.expression()?, position))
            }
            TokenKind::Identifier(_)
                if matches!(
                    self.peek_next(),
                    TokenKind::Equal | TokenKind::PlusEqual | TokenKind::MinusEqual
                ) =>
            {
                let name = self.identifier()?;
                let op = match self.advance().kind {
                    TokenKind::PlusEqual => Some(BinaryOp::Add),
                    TokenKind::MinusEqual => Some(BinaryOp::Sub),
                    _ => None,
                };
                Ok(Stmt::Assign {
                    name,
                    op,
                    value: self.expression()?,
                    position,
                })
            }
            _ => Ok(Stmt::Expr(self.expression()?)),
        }
    }

    fn let_binding(&mut self, exported: bool, position: Position) -> Result<Stmt, ParseError> {
        let name = self.identifier()?;
        self.expect(&TokenKind::Equal)?;
        Ok(Stmt::Let {
            name,
            value: self.expression()?,
            exported,
            position,
        })
    }

    fn import_declaration(&mut self, position: Position) -> Result<Stmt, ParseError> {
        self.expect(&TokenKind::Import)?;
        self.expect(&TokenKind::LeftBrace)?;
        let mut names = Vec::new();
        self.skip_newlines();
        while !self.check(&TokenKind::RightBrace) {
            names.push(self.identifier()?);
            self.skip_newlines();
            if !self.matches(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.expect(&TokenKind::RightBrace)?;
        self.expect(&TokenKind::From)?;

        match self.advance().kind {
            TokenKind::String(specifier) => Ok(Stmt::Import {
                names,
                specifier,
                position,
            }),
            _ => Err(ParseError {
                message: "expected a module specifier string after 'from'".to_string(),
                position,
            }),
        }
    }

    // Expressions, lowest precedence first

    fn expression(&mut self) -> Result<Expr, ParseError> {
        self.depth += 1;
        if self.depth > MAX_EXPRESSION_DEPTH {
            return Err(ParseError {
                message: "expression nested too deeply".to_string(),
                position: self.peek().position,
            });
        }
        let expr = self.or();
        self.depth -= 1;
        expr
    }

    fn binary_level(
        &mut self,
        operand: fn(&mut Self) -> Result<Expr, ParseError>,
        operators: &[(TokenKind, BinaryOp)],
    ) -> Result<Expr, ParseError> {
        let mut left = operand(self)?;
        'outer: loop {
            for (kind, op) in operators {
                if self.check(kind) {
                    let position = self.advance().position;
                    let right = operand(self)?;
                    left = Expr::Binary(*op, Box::new(left), Box::new(right), position);
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn or(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(Self::and, &[(TokenKind::Or, BinaryOp::Or)])
    }

    fn and(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(Self::equality, &[(TokenKind::And, BinaryOp::And)])
    }

    fn equality(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(
            Self::comparison,
            &[
                (TokenKind::EqualEqual, BinaryOp::Eq),
                (TokenKind::NotEqual, BinaryOp::Ne),
            ],
        )
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(
            Self::additive,
            &[
                (TokenKind::Less, BinaryOp::Lt),
                (TokenKind::LessEqual, BinaryOp::Le),
                (TokenKind::Greater, BinaryOp::Gt),
                (TokenKind::GreaterEqual, BinaryOp::Ge),
            ],
        )
    }

    fn additive(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(
            Self::multiplicative,
            &[
                (TokenKind::Plus, BinaryOp::Add),
                (TokenKind::Minus, BinaryOp::Sub),
            ],
        )
    }

    fn multiplicative(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(
            Self::unary,
            &[
                (TokenKind::Star, BinaryOp::Mul),
                (TokenKind::Slash, BinaryOp::Div),
                (TokenKind::Percent, BinaryOp::Rem),
            ],
        )
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek().kind {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Not => UnaryOp::Not,
            _ => return self.postfix(),
        };
        self.advance();
        self.depth += 1;
        if self.depth > MAX_EXPRESSION_DEPTH {
            return Err(ParseError {
                message: "expression nested too deeply".to_string(),
                position: self.peek().position,
            });
        }
        let operand = self.unary();
        self.depth -= 1;
        Ok(Expr::Unary(op, Box::new(operand?)))
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.primary()?;
        loop {
            let position = self.peek().position;
            if self.matches(&TokenKind::Dot) {
                let name = self.identifier()?;
                expr = Expr::Member(Box::new(expr), name, position);
            } else if self.matches(&TokenKind::LeftBracket) {
                self.skip_newlines();
                let index = self.expression()?;
                self.skip_newlines();
                self.expect(&TokenKind::RightBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index), position);
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        let token = self.advance();
        let position = token.position;
        let expr = match token.kind {
            TokenKind::Integer(n) => Expr::Literal(Literal::Integer(n)),
            TokenKind::Float(n) => Expr::Literal(Literal::Float(n)),
            TokenKind::String(s) => Expr::Literal(Literal::String(s)),
            TokenKind::True => Expr::Literal(Literal::Bool(true)),
            TokenKind::False => Expr::Literal(Literal::Bool(false)),
            TokenKind::Null => Expr::Literal(Literal::Null),
            TokenKind::Identifier(name) if self.check(&TokenKind::LeftParen) => {
                self.advance();
                let args = self.sequence(&TokenKind::RightParen)?;
                Expr::Call(name, args, position)
            }
            TokenKind::Identifier(name) => Expr::Identifier(name, position),
            TokenKind::Import => {
                self.expect(&TokenKind::LeftParen)?;
                self.skip_newlines();
                let target = self.expression()?;
                self.skip_newlines();
                self.expect(&TokenKind::RightParen)?;
                Expr::DynamicImport(Box::new(target), position)
            }
            TokenKind::LeftParen => {
                self.skip_newlines();
                let inner = self.expression()?;
                self.skip_newlines();
                self.expect(&TokenKind::RightParen)?;
                inner
            }
            TokenKind::LeftBracket => Expr::List(self.sequence(&TokenKind::RightBracket)?),
            TokenKind::LeftBrace => self.object()?,
            kind => {
                return Err(ParseError {
                    message: format!("expected an expression but found {}", kind),
                    position,
                });
            }
        };
        Ok(expr)
    }

    /// Comma-separated expressions up to `close`, which is consumed.
    fn sequence(&mut self, close: &TokenKind) -> Result<Vec<Expr>, ParseError> {
        let mut items = Vec::new();
        self.skip_newlines();
        while !self.check(close) {
            items.push(self.expression()?);
            self.skip_newlines();
            if !self.matches(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.expect(close)?;
        Ok(items)
    }

    fn object(&mut self) -> Result<Expr, ParseError> {
        let mut fields = Vec::new();
        self.skip_newlines();
        while !self.check(&TokenKind::RightBrace) {
            let key = match self.peek().kind.clone() {
                TokenKind::Identifier(name) | TokenKind::String(name) => {
                    self.advance();
                    name
                }
                _ => return Err(self.unexpected("object key")),
            };
            self.expect(&TokenKind::Colon)?;
            self.skip_newlines();
            fields.push((key, self.expression()?));
            self.skip_newlines();
            if !self.matches(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.expect(&TokenKind::RightBrace)?;
        Ok(Expr::Object(fields))
    }
}

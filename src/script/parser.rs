//! Recursive-descent parser for command scripts.

use std::sync::Arc;

use super::ast::{BinaryOp, Expr, ExprKind, FnDecl, Program, Stmt, StmtKind, UnaryOp};
use super::error::ParseError;
use super::lexer::{Lexer, Spanned, Token};

/// Maximum syntactic nesting (blocks, parentheses, unary chains, literals).
///
/// Together with [`MAX_EXPRESSION_DEPTH`] this keeps the parser, the
/// tree-walking interpreter and the drop of a syntax tree far away from the
/// host stack limit no matter what source they are handed.
pub const MAX_NESTING: usize = 64;

/// Maximum height of a single expression tree. Every operator in a chain
/// like `a + b + c` adds a level, as do calls, indexing and member access.
pub const MAX_EXPRESSION_DEPTH: usize = 256;

/// Maximum script size in bytes.
pub const MAX_SOURCE_LENGTH: usize = 64 * 1024;

type Result<T> = std::result::Result<T, ParseError>;

/// Parse a script into a [`Program`].
pub fn parse(source: &str) -> Result<Program> {
    if source.len() > MAX_SOURCE_LENGTH {
        return Err(ParseError::new(
            1,
            format!("script is too long (more than {MAX_SOURCE_LENGTH} bytes)"),
        ));
    }
    let tokens = Lexer::new(source).tokenize()?;
    Parser::new(tokens).parse_program()
}

/// Script parser.
struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    nesting: usize,
    loop_depth: usize,
    fn_depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Spanned>) -> Self {
        Self {
            tokens,
            pos: 0,
            nesting: 0,
            loop_depth: 0,
            fn_depth: 0,
        }
    }

    fn parse_program(mut self) -> Result<Program> {
        let mut body = Vec::new();
        while !self.check(&Token::Eof) {
            body.push(self.statement(true)?);
        }
        Ok(Program { body })
    }

    // ---- token helpers ----

    fn peek(&self) -> &Token {
        // The lexer always terminates the stream with Eof.
        self.tokens
            .get(self.pos)
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof)
    }

    fn line(&self) -> u32 {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|s| s.line)
            .unwrap_or(1)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String> {
        match self.peek() {
            Token::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected(what)),
        }
    }

    fn unexpected(&self, what: &str) -> ParseError {
        ParseError::new(
            self.line(),
            format!("expected {what}, found {}", self.peek().describe()),
        )
    }

    /// Run `f` one nesting level deeper.
    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.nesting >= MAX_NESTING {
            return Err(ParseError::new(
                self.line(),
                format!("script is nested too deeply (more than {MAX_NESTING} levels)"),
            ));
        }
        self.nesting += 1;
        let result = f(self);
        self.nesting -= 1;
        result
    }

    /// Build an expression node, refusing trees deeper than
    /// [`MAX_EXPRESSION_DEPTH`].
    fn node(&self, kind: ExprKind, line: u32) -> Result<Expr> {
        let expr = Expr::new(kind, line);
        if expr.depth > MAX_EXPRESSION_DEPTH {
            return Err(ParseError::new(
                line,
                format!("expression is too complex (more than {MAX_EXPRESSION_DEPTH} levels deep)"),
            ));
        }
        Ok(expr)
    }

    // ---- statements ----

    fn statement(&mut self, top_level: bool) -> Result<Stmt> {
        let line = self.line();
        let kind = match self.peek() {
            Token::Let => self.let_statement()?,
            Token::Fn => {
                if !top_level || self.fn_depth > 0 {
                    return Err(ParseError::new(
                        line,
                        "functions can only be declared at the top level",
                    ));
                }
                self.fn_declaration()?
            }
            Token::If => self.if_statement()?,
            Token::While => self.while_statement()?,
            Token::For => self.for_statement()?,
            Token::Return => {
                self.advance();
                let value = if self.check(&Token::Semicolon) {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.expect(&Token::Semicolon, "';' after return")?;
                StmtKind::Return(value)
            }
            Token::Break | Token::Continue => {
                let token = self.advance();
                if self.loop_depth == 0 {
                    return Err(ParseError::new(
                        line,
                        format!("{} outside of a loop", token.describe()),
                    ));
                }
                self.expect(&Token::Semicolon, "';'")?;
                if token == Token::Break {
                    StmtKind::Break
                } else {
                    StmtKind::Continue
                }
            }
            Token::Throw => {
                self.advance();
                let value = self.expression()?;
                self.expect(&Token::Semicolon, "';' after throw")?;
                StmtKind::Throw(value)
            }
            Token::LBrace => StmtKind::Block(self.block()?),
            _ => self.expression_statement()?,
        };
        Ok(Stmt { kind, line })
    }

    fn let_statement(&mut self) -> Result<StmtKind> {
        self.advance();
        let name = self.expect_ident("variable name after 'let'")?;
        self.expect(&Token::Assign, "'=' in let statement")?;
        let value = self.expression()?;
        self.expect(&Token::Semicolon, "';' after let statement")?;
        Ok(StmtKind::Let { name, value })
    }

    fn fn_declaration(&mut self) -> Result<StmtKind> {
        let line = self.line();
        self.advance();
        let name = self.expect_ident("function name")?;
        self.expect(&Token::LParen, "'(' after function name")?;

        let mut params: Vec<String> = Vec::new();
        if !self.check(&Token::RParen) {
            loop {
                let param = self.expect_ident("parameter name")?;
                if params.contains(&param) {
                    return Err(ParseError::new(
                        self.line(),
                        format!("duplicate parameter '{param}'"),
                    ));
                }
                params.push(param);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(&Token::RParen, "')' after parameters")?;

        // A loop around the declaration does not make break legal inside it.
        let saved_loop_depth = std::mem::replace(&mut self.loop_depth, 0);
        self.fn_depth += 1;
        let body = self.block();
        self.fn_depth -= 1;
        self.loop_depth = saved_loop_depth;

        Ok(StmtKind::Fn(Arc::new(FnDecl {
            name,
            params,
            body: body?,
            line,
        })))
    }

    fn if_statement(&mut self) -> Result<StmtKind> {
        self.advance();
        let condition = self.expression()?;
        let then_branch = self.block()?;

        let else_branch = if self.eat(&Token::Else) {
            if self.check(&Token::If) {
                let line = self.line();
                let nested = self.nested(|p| p.if_statement())?;
                Some(vec![Stmt { kind: nested, line }])
            } else {
                Some(self.block()?)
            }
        } else {
            None
        };

        Ok(StmtKind::If {
            condition,
            then_branch,
            else_branch,
        })
    }

    fn while_statement(&mut self) -> Result<StmtKind> {
        self.advance();
        let condition = self.expression()?;
        let body = self.loop_body()?;
        Ok(StmtKind::While { condition, body })
    }

    fn for_statement(&mut self) -> Result<StmtKind> {
        self.advance();
        let variable = self.expect_ident("loop variable after 'for'")?;
        self.expect(&Token::In, "'in' after loop variable")?;
        let iterable = self.expression()?;
        let body = self.loop_body()?;
        Ok(StmtKind::For {
            variable,
            iterable,
            body,
        })
    }

    fn loop_body(&mut self) -> Result<Vec<Stmt>> {
        self.loop_depth += 1;
        let body = self.block();
        self.loop_depth -= 1;
        body
    }

    fn block(&mut self) -> Result<Vec<Stmt>> {
        self.expect(&Token::LBrace, "'{'")?;
        self.nested(|p| {
            let mut stmts = Vec::new();
            while !p.check(&Token::RBrace) {
                if p.check(&Token::Eof) {
                    return Err(p.unexpected("'}'"));
                }
                stmts.push(p.statement(false)?);
            }
            p.advance();
            Ok(stmts)
        })
    }

    fn expression_statement(&mut self) -> Result<StmtKind> {
        let target = self.expression()?;
        if self.eat(&Token::Assign) {
            if !target.kind.is_assignable() {
                return Err(ParseError::new(target.line, "invalid assignment target"));
            }
            let value = self.expression()?;
            self.expect(&Token::Semicolon, "';' after assignment")?;
            return Ok(StmtKind::Assign { target, value });
        }
        self.expect(&Token::Semicolon, "';' after expression")?;
        Ok(StmtKind::Expr(target))
    }

    // ---- expressions ----

    fn expression(&mut self) -> Result<Expr> {
        self.nested(|p| p.or())
    }

    fn or(&mut self) -> Result<Expr> {
        let mut left = self.and()?;
        while self.check(&Token::OrOr) {
            let line = self.line();
            self.advance();
            let right = self.and()?;
            left = self.node(ExprKind::Or(Box::new(left), Box::new(right)), line)?;
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr> {
        let mut left = self.equality()?;
        while self.check(&Token::AndAnd) {
            let line = self.line();
            self.advance();
            let right = self.equality()?;
            left = self.node(ExprKind::And(Box::new(left), Box::new(right)), line)?;
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr> {
        self.binary_level(Self::comparison, |t| match t {
            Token::Eq => Some(BinaryOp::Eq),
            Token::NotEq => Some(BinaryOp::NotEq),
            _ => None,
        })
    }

    fn comparison(&mut self) -> Result<Expr> {
        self.binary_level(Self::term, |t| match t {
            Token::Lt => Some(BinaryOp::Lt),
            Token::LtEq => Some(BinaryOp::LtEq),
            Token::Gt => Some(BinaryOp::Gt),
            Token::GtEq => Some(BinaryOp::GtEq),
            _ => None,
        })
    }

    fn term(&mut self) -> Result<Expr> {
        self.binary_level(Self::factor, |t| match t {
            Token::Plus => Some(BinaryOp::Add),
            Token::Minus => Some(BinaryOp::Sub),
            _ => None,
        })
    }

    fn factor(&mut self) -> Result<Expr> {
        self.binary_level(Self::unary, |t| match t {
            Token::Star => Some(BinaryOp::Mul),
            Token::Slash => Some(BinaryOp::Div),
            Token::Percent => Some(BinaryOp::Rem),
            _ => None,
        })
    }

    /// Parse a left-associative chain of binary operators.
    fn binary_level(
        &mut self,
        operand: fn(&mut Self) -> Result<Expr>,
        operator: fn(&Token) -> Option<BinaryOp>,
    ) -> Result<Expr> {
        let mut left = operand(self)?;
        while let Some(op) = operator(self.peek()) {
            let line = self.line();
            self.advance();
            let right = operand(self)?;
            left = self.node(ExprKind::Binary(op, Box::new(left), Box::new(right)), line)?;
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr> {
        let op = match self.peek() {
            Token::Bang => UnaryOp::Not,
            Token::Minus => UnaryOp::Neg,
            _ => return self.postfix(),
        };
        let line = self.line();
        self.advance();
        let operand = self.nested(|p| p.unary())?;
        self.node(ExprKind::Unary(op, Box::new(operand)), line)
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            let line = self.line();
            if self.eat(&Token::LParen) {
                let mut args = Vec::new();
                if !self.check(&Token::RParen) {
                    loop {
                        args.push(self.expression()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&Token::RParen, "')' after arguments")?;
                expr = self.node(ExprKind::Call(Box::new(expr), args), line)?;
            } else if self.eat(&Token::LBracket) {
                let index = self.expression()?;
                self.expect(&Token::RBracket, "']' after index")?;
                expr = self.node(ExprKind::Index(Box::new(expr), Box::new(index)), line)?;
            } else if self.eat(&Token::Dot) {
                let name = self.expect_ident("property name after '.'")?;
                expr = self.node(ExprKind::Member(Box::new(expr), name), line)?;
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        let line = self.line();
        let kind = match self.advance() {
            Token::Int(n) => ExprKind::Int(n),
            Token::Float(n) => ExprKind::Float(n),
            Token::Str(s) => ExprKind::Str(s),
            Token::True => ExprKind::Bool(true),
            Token::False => ExprKind::Bool(false),
            Token::Null => ExprKind::Null,
            Token::Ident(name) => ExprKind::Ident(name),
            Token::LParen => {
                let inner = self.expression()?;
                self.expect(&Token::RParen, "')'")?;
                return Ok(inner);
            }
            Token::LBracket => self.nested(|p| p.array_literal())?,
            Token::LBrace => self.nested(|p| p.object_literal())?,
            _ => {
                self.pos -= 1;
                return Err(self.unexpected("an expression"));
            }
        };
        self.node(kind, line)
    }

    fn array_literal(&mut self) -> Result<ExprKind> {
        let mut items = Vec::new();
        while !self.check(&Token::RBracket) {
            items.push(self.expression()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RBracket, "']' after array items")?;
        Ok(ExprKind::Array(items))
    }

    fn object_literal(&mut self) -> Result<ExprKind> {
        let mut entries: Vec<(String, Expr)> = Vec::new();
        while !self.check(&Token::RBrace) {
            let key = match self.advance() {
                Token::Ident(name) | Token::Str(name) => name,
                _ => {
                    self.pos -= 1;
                    return Err(self.unexpected("object key"));
                }
            };
            self.expect(&Token::Colon, "':' after object key")?;
            let value = self.expression()?;
            entries.push((key, value));
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RBrace, "'}' after object entries")?;
        Ok(ExprKind::Object(entries))
    }
}

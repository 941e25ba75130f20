use std::{fmt, mem, sync::Arc};

use super::{
    ast::{
        Body, ClassDecl, Expr, ImportName, MethodDecl, MethodKind, Program, SignatureKind, Stmt,
        StmtKind, signature,
    },
    lexer::{Token, TokenKind, tokenize},
    with_stack,
};

const MAX_PARAMETERS: usize = 16;
/// Combined depth of nested statements and expressions.
const MAX_NESTING: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub line: usize,
    pub message: String,
}

impl CompileError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] {}", self.line, self.message)
    }
}

impl std::error::Error for CompileError {}

pub fn parse(source: &str) -> Result<Program, CompileError> {
    let tokens = tokenize(source)?;
    Parser::new(tokens).program()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    Lowest,
    Assignment,
    Conditional,
    LogicalOr,
    LogicalAnd,
    Equality,
    Is,
    Comparison,
    BitwiseOr,
    BitwiseXor,
    BitwiseAnd,
    Shift,
    Range,
    Term,
    Factor,
    Unary,
    Call,
}

impl Precedence {
    fn next(self) -> Self {
        use Precedence::*;
        match self {
            Lowest => Assignment,
            Assignment => Conditional,
            Conditional => LogicalOr,
            LogicalOr => LogicalAnd,
            LogicalAnd => Equality,
            Equality => Is,
            Is => Comparison,
            Comparison => BitwiseOr,
            BitwiseOr => BitwiseXor,
            BitwiseXor => BitwiseAnd,
            BitwiseAnd => Shift,
            Shift => Range,
            Range => Term,
            Term => Factor,
            Factor => Unary,
            Unary | Call => Call,
        }
    }

    fn of_infix(kind: &TokenKind) -> Option<Self> {
        use TokenKind as T;
        Some(match kind {
            T::Dot | T::LeftBracket => Precedence::Call,
            T::Question => Precedence::Conditional,
            T::PipePipe => Precedence::LogicalOr,
            T::AmpAmp => Precedence::LogicalAnd,
            T::EqEq | T::BangEq => Precedence::Equality,
            T::Is => Precedence::Is,
            T::Lt | T::Gt | T::LtEq | T::GtEq => Precedence::Comparison,
            T::Pipe => Precedence::BitwiseOr,
            T::Caret => Precedence::BitwiseXor,
            T::Amp => Precedence::BitwiseAnd,
            T::LtLt | T::GtGt => Precedence::Shift,
            T::DotDot | T::DotDotDot => Precedence::Range,
            T::Plus | T::Minus => Precedence::Term,
            T::Star | T::Slash | T::Percent => Precedence::Factor,
            _ => return None,
        })
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    loop_depth: usize,
    nesting: usize,
    in_class: bool,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            loop_depth: 0,
            nesting: 0,
            in_class: false,
        }
    }

    fn peek_token(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek(&self) -> &TokenKind {
        &self.peek_token().kind
    }

    fn peek_next(&self) -> &TokenKind {
        &self.tokens[(self.pos + 1).min(self.tokens.len() - 1)].kind
    }

    fn line(&self) -> usize {
        self.peek_token().line
    }

    fn advance(&mut self) -> Token {
        let token = self.peek_token().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        mem::discriminant(self.peek()) == mem::discriminant(kind)
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, message: &str) -> Result<Token, CompileError> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.error(message))
        }
    }

    fn expect_name(&mut self, message: &str) -> Result<String, CompileError> {
        match self.peek().clone() {
            TokenKind::Name(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.error(message)),
        }
    }

    fn error(&self, message: &str) -> CompileError {
        error_at(self.peek_token(), message)
    }

    fn nested<T>(
        &mut self,
        message: &str,
        parse: impl FnOnce(&mut Self) -> Result<T, CompileError>,
    ) -> Result<T, CompileError> {
        if self.nesting == MAX_NESTING {
            return Err(self.error(message));
        }
        self.nesting += 1;
        let result = with_stack(|| parse(self));
        self.nesting -= 1;
        result
    }

    fn skip_lines(&mut self) {
        while self.eat(&TokenKind::Line) {}
    }

    fn end_statement(&mut self) -> Result<(), CompileError> {
        if self.eat(&TokenKind::Line) {
            self.skip_lines();
            return Ok(());
        }
        match self.peek() {
            TokenKind::RightBrace | TokenKind::Eof => Ok(()),
            _ => Err(self.error("Expect newline after statement.")),
        }
    }

    fn program(mut self) -> Result<Program, CompileError> {
        let mut statements = Vec::new();
        self.skip_lines();
        while !self.check(&TokenKind::Eof) {
            statements.push(self.definition()?);
            if !self.check(&TokenKind::Eof) && !self.eat(&TokenKind::Line) {
                return Err(self.error("Expect newline after statement."));
            }
            self.skip_lines();
        }
        Ok(Program { statements })
    }

    fn definition(&mut self) -> Result<Stmt, CompileError> {
        self.nested("Statement nesting too deep.", Self::declaration)
    }

    fn declaration(&mut self) -> Result<Stmt, CompileError> {
        let line = self.line();
        let kind = match self.peek() {
            TokenKind::Class => {
                self.advance();
                self.class_decl(false)?
            }
            TokenKind::Foreign => {
                self.advance();
                self.expect(&TokenKind::Class, "Expect 'class' after 'foreign'.")?;
                self.class_decl(true)?
            }
            TokenKind::Import => {
                self.advance();
                self.import()?
            }
            TokenKind::Var => {
                self.advance();
                let name = self.expect_name("Expect variable name.")?;
                let init = if self.eat(&TokenKind::Eq) {
                    self.skip_lines();
                    Some(self.expression()?)
                } else {
                    None
                };
                StmtKind::Var { name, init }
            }
            _ => return self.statement(),
        };
        Ok(Stmt { kind, line })
    }

    fn statement(&mut self) -> Result<Stmt, CompileError> {
        let line = self.line();
        let kind = match self.peek() {
            TokenKind::Break => {
                if self.loop_depth == 0 {
                    return Err(self.error("Cannot use 'break' outside of a loop."));
                }
                self.advance();
                StmtKind::Break
            }
            TokenKind::Continue => {
                if self.loop_depth == 0 {
                    return Err(self.error("Cannot use 'continue' outside of a loop."));
                }
                self.advance();
                StmtKind::Continue
            }
            TokenKind::Return => {
                self.advance();
                match self.peek() {
                    TokenKind::Line | TokenKind::RightBrace | TokenKind::Eof => {
                        StmtKind::Return(None)
                    }
                    _ => StmtKind::Return(Some(self.expression()?)),
                }
            }
            TokenKind::If => {
                self.advance();
                self.expect(&TokenKind::LeftParen, "Expect '(' after 'if'.")?;
                self.skip_lines();
                let condition = self.expression()?;
                self.skip_lines();
                self.expect(&TokenKind::RightParen, "Expect ')' after if condition.")?;
                let then = Box::new(self.statement()?);
                if self.check(&TokenKind::Line) && matches!(self.peek_next(), TokenKind::Else) {
                    self.advance();
                }
                let otherwise = if self.eat(&TokenKind::Else) {
                    Some(Box::new(self.statement()?))
                } else {
                    None
                };
                StmtKind::If {
                    condition,
                    then,
                    otherwise,
                }
            }
            TokenKind::While => {
                self.advance();
                self.expect(&TokenKind::LeftParen, "Expect '(' after 'while'.")?;
                self.skip_lines();
                let condition = self.expression()?;
                self.skip_lines();
                self.expect(&TokenKind::RightParen, "Expect ')' after while condition.")?;
                let body = Box::new(self.loop_body()?);
                StmtKind::While { condition, body }
            }
            TokenKind::For => {
                self.advance();
                self.expect(&TokenKind::LeftParen, "Expect '(' after 'for'.")?;
                self.skip_lines();
                let name = self.expect_name("Expect for loop variable name.")?;
                self.expect(&TokenKind::In, "Expect 'in' after loop variable.")?;
                self.skip_lines();
                let sequence = self.expression()?;
                self.skip_lines();
                self.expect(&TokenKind::RightParen, "Expect ')' after loop expression.")?;
                let body = Box::new(self.loop_body()?);
                StmtKind::For {
                    name,
                    sequence,
                    body,
                }
            }
            TokenKind::LeftBrace => {
                self.advance();
                StmtKind::Block(self.block()?)
            }
            _ => StmtKind::Expr(self.expression()?),
        };
        Ok(Stmt { kind, line })
    }

    fn loop_body(&mut self) -> Result<Stmt, CompileError> {
        self.loop_depth += 1;
        let body = self.statement();
        self.loop_depth -= 1;
        body
    }

    /// Statements up to the closing brace; the opening one is consumed.
    fn block(&mut self) -> Result<Vec<Stmt>, CompileError> {
        let mut statements = Vec::new();
        self.skip_lines();
        while !self.check(&TokenKind::RightBrace) {
            if self.check(&TokenKind::Eof) {
                return Err(self.error("Expect '}' at end of block."));
            }
            statements.push(self.definition()?);
            self.end_statement()?;
        }
        self.advance();
        Ok(statements)
    }

    fn import(&mut self) -> Result<StmtKind, CompileError> {
        let module = match self.peek().clone() {
            TokenKind::String(bytes) => {
                self.advance();
                String::from_utf8_lossy(&bytes).into_owned()
            }
            _ => return Err(self.error("Expect a string after 'import'.")),
        };
        let mut names = Vec::new();
        if self.eat(&TokenKind::For) {
            self.skip_lines();
            loop {
                let name = self.expect_name("Expect variable name.")?;
                let alias = if self.eat(&TokenKind::As) {
                    Some(self.expect_name("Expect variable name.")?)
                } else {
                    None
                };
                names.push(ImportName { name, alias });
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
                self.skip_lines();
            }
        }
        Ok(StmtKind::Import { module, names })
    }

    fn class_decl(&mut self, foreign: bool) -> Result<StmtKind, CompileError> {
        let name = self.expect_name("Expect class name.")?;
        let superclass = if self.eat(&TokenKind::Is) {
            Some(self.parse_precedence(Precedence::Call)?)
        } else {
            None
        };
        self.expect(&TokenKind::LeftBrace, "Expect '{' after class declaration.")?;
        self.skip_lines();

        let was_in_class = mem::replace(&mut self.in_class, true);
        let mut methods: Vec<MethodDecl> = Vec::new();
        while !self.eat(&TokenKind::RightBrace) {
            if self.check(&TokenKind::Eof) {
                return Err(self.error("Expect '}' after class body."));
            }
            let method = self.method()?;
            if methods
                .iter()
                .any(|m| m.signature == method.signature && (m.kind == MethodKind::Static) == (method.kind == MethodKind::Static))
            {
                return Err(CompileError::new(
                    method.line,
                    format!(
                        "Error: Class {name} already defines a method '{}'.",
                        method.signature
                    ),
                ));
            }
            methods.push(method);
            self.end_statement()?;
        }
        self.in_class = was_in_class;

        Ok(StmtKind::Class(Arc::new(ClassDecl {
            name,
            superclass,
            foreign,
            methods,
        })))
    }

    fn method(&mut self) -> Result<MethodDecl, CompileError> {
        let line = self.line();
        let foreign = self.eat(&TokenKind::Foreign);
        let kind = if self.eat(&TokenKind::Static) {
            MethodKind::Static
        } else if self.eat(&TokenKind::Construct) {
            MethodKind::Construct
        } else {
            MethodKind::Instance
        };

        let token = self.advance();
        let (name, signature, params) = match &token.kind {
            TokenKind::Name(name) => {
                if self.eat(&TokenKind::Eq) {
                    self.expect(&TokenKind::LeftParen, "Expect '(' after '='.")?;
                    let param = self.expect_name("Expect variable name.")?;
                    self.expect(&TokenKind::RightParen, "Expect ')' after parameter name.")?;
                    (name.clone(), signature(name, 1, SignatureKind::Setter), vec![param])
                } else if self.eat(&TokenKind::LeftParen) {
                    let params = self.parameters(&TokenKind::RightParen, "Expect ')' after parameters.")?;
                    let sig = signature(name, params.len(), SignatureKind::Method);
                    (name.clone(), sig, params)
                } else {
                    (name.clone(), name.clone(), Vec::new())
                }
            }
            TokenKind::LeftBracket => {
                let mut params =
                    self.parameters(&TokenKind::RightBracket, "Expect ']' after parameters.")?;
                if self.eat(&TokenKind::Eq) {
                    self.expect(&TokenKind::LeftParen, "Expect '(' after '='.")?;
                    let arity = params.len();
                    params.push(self.expect_name("Expect variable name.")?);
                    self.expect(&TokenKind::RightParen, "Expect ')' after parameter name.")?;
                    ("[]".to_owned(), signature("", arity, SignatureKind::SubscriptSetter), params)
                } else {
                    let sig = signature("", params.len(), SignatureKind::Subscript);
                    ("[]".to_owned(), sig, params)
                }
            }
            other => match other.operator() {
                Some(op) if self.eat(&TokenKind::LeftParen) => {
                    let param = self.expect_name("Expect variable name.")?;
                    self.expect(&TokenKind::RightParen, "Expect ')' after parameter name.")?;
                    (op.to_owned(), format!("{op}(_)"), vec![param])
                }
                Some(op @ ("-" | "!" | "~")) => (op.to_owned(), op.to_owned(), Vec::new()),
                _ => return Err(error_at(&token, "Expect method definition.")),
            },
        };
        if kind == MethodKind::Construct && !signature.ends_with(')') {
            return Err(error_at(&token, "A constructor cannot be a getter."));
        }

        let body = if foreign {
            None
        } else {
            self.expect(&TokenKind::LeftBrace, "Expect '{' to begin method body.")?;
            Some(Arc::new(self.method_body()?))
        };

        Ok(MethodDecl {
            kind,
            foreign,
            name,
            signature,
            params,
            body,
            line,
        })
    }

    fn parameters(&mut self, close: &TokenKind, message: &str) -> Result<Vec<String>, CompileError> {
        let mut params = Vec::new();
        self.skip_lines();
        if !self.check(close) {
            loop {
                if params.len() == MAX_PARAMETERS {
                    return Err(self.error("Methods cannot have more than 16 parameters."));
                }
                params.push(self.expect_name("Expect variable name.")?);
                self.skip_lines();
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
                self.skip_lines();
            }
        }
        self.expect(close, message)?;
        Ok(params)
    }

    fn method_body(&mut self) -> Result<Body, CompileError> {
        let loop_depth = mem::take(&mut self.loop_depth);
        let body = self.method_body_inner();
        self.loop_depth = loop_depth;
        body
    }

    fn method_body_inner(&mut self) -> Result<Body, CompileError> {
        if self.eat(&TokenKind::RightBrace) {
            return Ok(Body::Block(Vec::new()));
        }
        if self.check(&TokenKind::Line) {
            return Ok(Body::Block(self.block()?));
        }
        let starts_statement = matches!(
            self.peek(),
            TokenKind::Return
                | TokenKind::Var
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::LeftBrace
                | TokenKind::Class
                | TokenKind::Import
        );
        let body = if starts_statement {
            Body::Block(vec![self.definition()?])
        } else {
            Body::Expr(self.expression()?)
        };
        self.skip_lines();
        self.expect(&TokenKind::RightBrace, "Expect '}' at end of block.")?;
        Ok(body)
    }

    fn expression(&mut self) -> Result<Expr, CompileError> {
        self.parse_precedence(Precedence::Lowest)
    }

    fn parse_precedence(&mut self, precedence: Precedence) -> Result<Expr, CompileError> {
        self.nested("Expression nesting too deep.", |parser| {
            parser.parse_operators(precedence)
        })
    }

    fn parse_operators(&mut self, precedence: Precedence) -> Result<Expr, CompileError> {
        let can_assign = precedence <= Precedence::Conditional;
        let token = self.advance();
        let mut left = self.prefix(token, can_assign)?;
        while let Some(infix) = Precedence::of_infix(self.peek()) {
            if precedence > infix {
                break;
            }
            let token = self.advance();
            left = self.infix(left, token, infix, can_assign)?;
        }
        if can_assign && self.check(&TokenKind::Eq) {
            return Err(self.error("Invalid assignment target."));
        }
        Ok(left)
    }

    fn assignment(&mut self, target: Expr, can_assign: bool) -> Result<Expr, CompileError> {
        if can_assign && self.eat(&TokenKind::Eq) {
            self.skip_lines();
            let value = self.parse_precedence(Precedence::Assignment)?;
            Ok(Expr::Assign {
                target: Box::new(target),
                value: Box::new(value),
            })
        } else {
            Ok(target)
        }
    }

    fn arguments(&mut self, close: &TokenKind, message: &str) -> Result<Vec<Expr>, CompileError> {
        let mut args = Vec::new();
        self.skip_lines();
        if !self.check(close) {
            loop {
                if args.len() == MAX_PARAMETERS {
                    return Err(self.error("Methods cannot have more than 16 parameters."));
                }
                args.push(self.expression()?);
                self.skip_lines();
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
                self.skip_lines();
            }
        }
        self.expect(close, message)?;
        Ok(args)
    }

    /// After a method name: `(args)`, `= value`, or nothing.
    fn call_tail(
        &mut self,
        name: &str,
        can_assign: bool,
    ) -> Result<(String, Vec<Expr>), CompileError> {
        if self.eat(&TokenKind::LeftParen) {
            let args = self.arguments(&TokenKind::RightParen, "Expect ')' after arguments.")?;
            Ok((signature(name, args.len(), SignatureKind::Method), args))
        } else if can_assign && self.eat(&TokenKind::Eq) {
            self.skip_lines();
            let value = self.parse_precedence(Precedence::Assignment)?;
            Ok((signature(name, 1, SignatureKind::Setter), vec![value]))
        } else {
            Ok((name.to_owned(), Vec::new()))
        }
    }

    fn prefix(&mut self, token: Token, can_assign: bool) -> Result<Expr, CompileError> {
        match token.kind.clone() {
            TokenKind::LeftParen => {
                self.skip_lines();
                let expr = self.expression()?;
                self.skip_lines();
                self.expect(&TokenKind::RightParen, "Expect ')' after expression.")?;
                Ok(expr)
            }
            TokenKind::LeftBracket => {
                let mut items = Vec::new();
                self.skip_lines();
                while !self.check(&TokenKind::RightBracket) {
                    items.push(self.expression()?);
                    self.skip_lines();
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                    self.skip_lines();
                }
                self.expect(&TokenKind::RightBracket, "Expect ']' after list elements.")?;
                Ok(Expr::List(items))
            }
            TokenKind::Minus | TokenKind::Bang | TokenKind::Tilde => {
                let op = token.kind.operator().unwrap_or("-");
                let operand = self.parse_precedence(Precedence::Unary.next())?;
                Ok(Expr::Call {
                    receiver: Box::new(operand),
                    signature: op.to_owned(),
                    args: Vec::new(),
                })
            }
            TokenKind::True => Ok(Expr::Bool(true)),
            TokenKind::False => Ok(Expr::Bool(false)),
            TokenKind::Null => Ok(Expr::Null),
            TokenKind::Number(n) => Ok(Expr::Num(n)),
            TokenKind::String(bytes) => Ok(Expr::Str(bytes.into())),
            TokenKind::Interpolation(first) => self.interpolation(first),
            TokenKind::This => {
                if !self.in_class {
                    return Err(error_at(&token, "Cannot use 'this' outside of a method."));
                }
                Ok(Expr::This)
            }
            TokenKind::Name(name) => {
                if self.check(&TokenKind::LeftParen) {
                    self.advance();
                    let args = self.arguments(&TokenKind::RightParen, "Expect ')' after arguments.")?;
                    return Ok(Expr::SelfCall {
                        signature: signature(&name, args.len(), SignatureKind::Method),
                        args,
                    });
                }
                self.assignment(Expr::Name(name), can_assign)
            }
            TokenKind::Field(_) | TokenKind::StaticField(_) if !self.in_class => Err(error_at(
                &token,
                "Cannot reference a field outside of a class definition.",
            )),
            TokenKind::Field(name) => self.assignment(Expr::Field(name), can_assign),
            TokenKind::StaticField(name) => self.assignment(Expr::StaticField(name), can_assign),
            TokenKind::Super => {
                if !self.in_class {
                    return Err(error_at(&token, "Cannot use 'super' outside of a method."));
                }
                if self.eat(&TokenKind::Dot) {
                    let name = self.expect_name("Expect method name after 'super.'.")?;
                    let (signature, args) = self.call_tail(&name, can_assign)?;
                    Ok(Expr::SuperCall {
                        signature: Some(signature),
                        args,
                    })
                } else if self.eat(&TokenKind::LeftParen) {
                    let args = self.arguments(&TokenKind::RightParen, "Expect ')' after arguments.")?;
                    Ok(Expr::SuperCall {
                        signature: None,
                        args,
                    })
                } else {
                    Err(self.error("Expect '.' or '(' after 'super'."))
                }
            }
            _ => Err(error_at(&token, "Expected expression.")),
        }
    }

    fn infix(
        &mut self,
        left: Expr,
        token: Token,
        precedence: Precedence,
        can_assign: bool,
    ) -> Result<Expr, CompileError> {
        match token.kind.clone() {
            TokenKind::Dot => {
                self.skip_lines();
                let name = self.expect_name("Expect method name after '.'.")?;
                let (signature, args) = self.call_tail(&name, can_assign)?;
                Ok(Expr::Call {
                    receiver: Box::new(left),
                    signature,
                    args,
                })
            }
            TokenKind::LeftBracket => {
                let mut args =
                    self.arguments(&TokenKind::RightBracket, "Expect ']' after arguments.")?;
                let arity = args.len();
                let signature = if can_assign && self.eat(&TokenKind::Eq) {
                    self.skip_lines();
                    args.push(self.parse_precedence(Precedence::Assignment)?);
                    signature("", arity, SignatureKind::SubscriptSetter)
                } else {
                    signature("", arity, SignatureKind::Subscript)
                };
                Ok(Expr::Call {
                    receiver: Box::new(left),
                    signature,
                    args,
                })
            }
            TokenKind::Question => {
                self.skip_lines();
                let then = self.parse_precedence(Precedence::Conditional)?;
                self.skip_lines();
                self.expect(&TokenKind::Colon, "Expect ':' after then branch of conditional operator.")?;
                self.skip_lines();
                let otherwise = self.parse_precedence(Precedence::Conditional)?;
                Ok(Expr::Conditional {
                    condition: Box::new(left),
                    then: Box::new(then),
                    otherwise: Box::new(otherwise),
                })
            }
            TokenKind::AmpAmp => {
                self.skip_lines();
                let right = self.parse_precedence(precedence.next())?;
                Ok(Expr::And(Box::new(left), Box::new(right)))
            }
            TokenKind::PipePipe => {
                self.skip_lines();
                let right = self.parse_precedence(precedence.next())?;
                Ok(Expr::Or(Box::new(left), Box::new(right)))
            }
            TokenKind::Is => {
                self.skip_lines();
                let right = self.parse_precedence(precedence.next())?;
                Ok(Expr::Call {
                    receiver: Box::new(left),
                    signature: "is(_)".to_owned(),
                    args: vec![right],
                })
            }
            kind => {
                let Some(op) = kind.operator() else {
                    return Err(error_at(&token, "Expected expression."));
                };
                self.skip_lines();
                let right = self.parse_precedence(precedence.next())?;
                Ok(Expr::Call {
                    receiver: Box::new(left),
                    signature: format!("{op}(_)"),
                    args: vec![right],
                })
            }
        }
    }

    fn interpolation(&mut self, first: Vec<u8>) -> Result<Expr, CompileError> {
        let mut parts = vec![Expr::Str(first.into())];
        loop {
            self.skip_lines();
            parts.push(self.expression()?);
            self.skip_lines();
            match self.advance().kind {
                TokenKind::Interpolation(piece) => parts.push(Expr::Str(piece.into())),
                TokenKind::String(piece) => {
                    parts.push(Expr::Str(piece.into()));
                    return Ok(Expr::Interpolation(parts));
                }
                _ => return Err(self.error("Expect end of string interpolation.")),
            }
        }
    }
}

fn error_at(token: &Token, message: &str) -> CompileError {
    let message = match token.kind {
        TokenKind::Line => format!("Error at newline: {message}"),
        TokenKind::Eof => format!("Error at end of file: {message}"),
        _ => format!("Error at '{}': {message}", token.lexeme),
    };
    CompileError::new(token.line, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_expr(source: &str) -> Expr {
        let program = parse(source).unwrap();
        match &program.statements[0].kind {
            StmtKind::Expr(expr) => expr.clone(),
            other => panic!("expected an expression statement, got {other:?}"),
        }
    }

    #[test]
    fn binary_operators_become_method_calls() {
        let Expr::Call {
            signature, args, ..
        } = first_expr("1 + 2 * 3")
        else {
            panic!("not a call");
        };
        assert_eq!(signature, "+(_)");
        assert!(matches!(&args[0], Expr::Call { signature, .. } if signature == "*(_)"));
    }

    #[test]
    fn setters_and_subscripts() {
        assert!(matches!(
            first_expr("a.b = 1"),
            Expr::Call { signature, .. } if signature == "b=(_)"
        ));
        assert!(matches!(
            first_expr("a[1, 2] = 3"),
            Expr::Call { signature, args, .. } if signature == "[_,_]=(_)" && args.len() == 3
        ));
        assert!(matches!(first_expr("x = 1"), Expr::Assign { .. }));
    }

    #[test]
    fn class_members_get_signatures() {
        let program = parse(
            "foreign class Point {\n  construct new(x, y) {}\n  foreign x\n  x=(v) { _x = v }\n  [i] { i }\n  -(other) { this }\n  - { this }\n  static origin { __origin }\n}",
        )
        .unwrap();
        let StmtKind::Class(class) = &program.statements[0].kind else {
            panic!("not a class");
        };
        assert!(class.foreign);
        let sigs: Vec<_> = class.methods.iter().map(|m| m.signature.as_str()).collect();
        assert_eq!(sigs, ["new(_,_)", "x", "x=(_)", "[_]", "-(_)", "-", "origin"]);
        assert!(class.methods[1].foreign && class.methods[1].body.is_none());
        assert_eq!(class.methods[0].kind, MethodKind::Construct);
        assert_eq!(class.methods[6].kind, MethodKind::Static);
    }

    #[test]
    fn one_line_bodies_are_expressions() {
        let program = parse("class A {\n  twice(n) { n * 2 }\n  log(n) { return n }\n}").unwrap();
        let StmtKind::Class(class) = &program.statements[0].kind else {
            panic!("not a class");
        };
        assert!(matches!(class.methods[0].body.as_deref(), Some(Body::Expr(_))));
        assert!(matches!(class.methods[1].body.as_deref(), Some(Body::Block(b)) if b.len() == 1));
    }

    #[test]
    fn imports_are_collected() {
        let program = parse("import \"a\" for X, Y as Z\nif (true) {\n  import \"b\"\n}\nimport \"a\"").unwrap();
        assert_eq!(
            program.imports(),
            vec![("a".to_owned(), 1), ("b".to_owned(), 3)]
        );
    }

    #[test]
    fn error_messages_name_the_token() {
        let err = parse("var = ").unwrap_err();
        assert_eq!(err.line, 1);
        assert_eq!(err.message, "Error at '=': Expect variable name.");

        let err = parse("System.print(1\n\n").unwrap_err();
        assert_eq!(err.message, "Error at end of file: Expect ')' after arguments.");

        let err = parse("break").unwrap_err();
        assert_eq!(err.message, "Error at 'break': Cannot use 'break' outside of a loop.");
    }

    #[test]
    fn deep_nesting_is_a_compile_error() {
        let depth = 1000;
        let source = format!("var x = {}1{}", "(".repeat(depth), ")".repeat(depth));
        let err = parse(&source).unwrap_err();
        assert_eq!(err.message, "Error at '(': Expression nesting too deep.");

        let source = format!("{}{}", "{\n".repeat(depth), "}\n".repeat(depth));
        let err = parse(&source).unwrap_err();
        assert!(err.message.ends_with("Statement nesting too deep."), "{}", err.message);

        let shallow = 100;
        let source = format!("var x = {}1{}", "(".repeat(shallow), ")".repeat(shallow));
        assert!(parse(&source).is_ok());
    }

    #[test]
    fn interpolation_keeps_piece_order() {
        let Expr::Interpolation(parts) = first_expr("\"a%(1)b%(2)c\"") else {
            panic!("not an interpolation");
        };
        assert_eq!(parts.len(), 5);
        assert!(matches!(&parts[4], Expr::Str(s) if &**s == b"c"));
    }
}

//! Parser: token stream → AST, with statement-level error recovery.
//!
//! A statement that produced an error is dropped and parsing resumes at
//! the next synchronization point (statement keyword, `;`, block
//! terminator, or a name starting a later line). Every problem found
//! along the way ends up in the returned diagnostics.

use std::collections::HashSet;
use std::mem::discriminant;
use std::rc::Rc;

use crate::ast::*;
use crate::error::{DeclarationError, Diagnostic, DiagnosticKind, Position, SyntaxError, SyntaxErrorKind};
use crate::lexer::{Token, TokenKind};
use crate::native::NativeRegistry;
use crate::value::{values_equal, Value};

type PResult<T> = Result<T, SyntaxError>;

pub const DEFAULT_MAX_DEPTH: usize = 64;

pub struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    natives: &'a NativeRegistry,
    max_depth: usize,
    depth: usize,
    loop_depth: usize,
    /// Set when an error was recorded without aborting the statement.
    poisoned: bool,
    overflowed: bool,
    unwinding: bool,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Parser<'a> {
    /// `natives` decides which bare names start a command statement.
    pub fn new(mut tokens: Vec<Token>, natives: &'a NativeRegistry) -> Self {
        if !tokens.last().is_some_and(|t| t.kind.is_eof()) {
            let (line, column) = tokens.last().map_or((1, 1), |t| (t.line, t.end_column()));
            tokens.push(Token {
                kind: TokenKind::Eof,
                lexeme: String::new(),
                line,
                column,
            });
        }
        Self {
            tokens,
            pos: 0,
            natives,
            max_depth: DEFAULT_MAX_DEPTH,
            depth: 0,
            loop_depth: 0,
            poisoned: false,
            overflowed: false,
            unwinding: false,
            diagnostics: Vec::new(),
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Parses the whole input. The program holds every statement that
    /// parsed cleanly; diagnostics are in source order.
    pub fn parse(mut self) -> (Program, Vec<Diagnostic>) {
        self.report_invalid_tokens();
        let mut statements = Vec::new();
        loop {
            statements.extend(self.parse_block());
            let tok = self.peek().clone();
            if tok.kind.is_eof() {
                break;
            }
            // a terminator with nothing open
            self.diagnostics.push(
                SyntaxError::new(
                    SyntaxErrorKind::UnexpectedToken {
                        found: tok.lexeme.clone(),
                        expected: "a statement".into(),
                    },
                    tok.position(),
                )
                .into(),
            );
            self.advance();
        }
        self.diagnostics.sort_by_key(|d| (d.line, d.column));
        (Program { statements }, self.diagnostics)
    }

    fn report_invalid_tokens(&mut self) {
        for t in &self.tokens {
            if t.kind == TokenKind::Invalid {
                self.diagnostics.push(Diagnostic::error(
                    DiagnosticKind::Lexical,
                    t.position(),
                    format!("invalid character `{}`", t.lexeme),
                ));
            }
        }
    }

    // ===== Token helpers =====

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let i = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[i]
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if !tok.kind.is_eof() {
            self.pos += 1;
        }
        tok
    }

    fn is(&self, kind: &TokenKind) -> bool {
        discriminant(&self.peek().kind) == discriminant(kind)
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.is(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn bump_while_semi(&mut self) {
        while self.eat(&TokenKind::Semicolon) {}
    }

    fn unexpected(&self, expected: impl Into<String>) -> SyntaxError {
        let tok = self.peek();
        let kind = match tok.kind {
            TokenKind::Eof => SyntaxErrorKind::UnexpectedEof {
                expected: expected.into(),
            },
            TokenKind::Invalid => SyntaxErrorKind::InvalidToken(tok.lexeme.clone()),
            _ => SyntaxErrorKind::UnexpectedToken {
                found: tok.lexeme.clone(),
                expected: expected.into(),
            },
        };
        SyntaxError::new(kind, tok.position())
    }

    fn expect(&mut self, kind: &TokenKind, expected: &str) -> PResult<Token> {
        if self.is(kind) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn expect_variable(&mut self, what: &str) -> PResult<Token> {
        self.expect(&TokenKind::Variable, what)
    }

    /// Closes a block opened by `opener` at `opened`.
    fn expect_terminator(
        &mut self,
        kind: TokenKind,
        opener: &'static str,
        terminator: &'static str,
        opened: Position,
    ) -> PResult<()> {
        if self.eat(&kind) {
            return Ok(());
        }
        if self.peek().kind.is_eof() {
            return Err(SyntaxError::new(
                SyntaxErrorKind::MissingTerminator {
                    opener,
                    terminator,
                    line: opened.line,
                },
                self.peek().position(),
            ));
        }
        Err(self.unexpected(format!("`{}`", terminator)))
    }

    fn record(&mut self, err: SyntaxError) {
        match err.kind {
            // already reported by the pre-pass
            SyntaxErrorKind::InvalidToken(_) => {}
            SyntaxErrorKind::StackOverflow { .. } => {
                self.unwinding = true;
                if !self.overflowed {
                    self.overflowed = true;
                    self.diagnostics.push(err.into());
                }
            }
            _ => self.diagnostics.push(err.into()),
        }
    }

    fn declaration_error(&mut self, err: DeclarationError, pos: Position) {
        self.diagnostics.push(Diagnostic::error(
            DiagnosticKind::Declaration,
            pos,
            err.to_string(),
        ));
        self.poisoned = true;
    }

    fn descend(&mut self) -> PResult<()> {
        if self.depth >= self.max_depth {
            return Err(SyntaxError::new(
                SyntaxErrorKind::StackOverflow {
                    limit: self.max_depth,
                },
                self.peek().position(),
            ));
        }
        self.depth += 1;
        Ok(())
    }

    fn ascend(&mut self) {
        self.depth -= 1;
    }

    /// Skips to a token a new statement can plausibly start at.
    fn synchronize(&mut self, failed_line: usize) {
        loop {
            let tok = self.peek();
            match &tok.kind {
                TokenKind::Eof => return,
                TokenKind::Semicolon => {
                    self.advance();
                    return;
                }
                k if k.starts_statement() || k.is_block_terminator() => return,
                TokenKind::Identifier | TokenKind::Variable if tok.line > failed_line => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    /// Skips a block construct through its matching terminator.
    fn skip_construct(&mut self) {
        let mut open = 0usize;
        loop {
            let kind = &self.peek().kind;
            if kind.is_eof() {
                return;
            }
            if opens_block(kind) {
                open += 1;
            } else if closes_block(kind) {
                open = open.saturating_sub(1);
                if open == 0 {
                    self.advance();
                    return;
                }
            }
            self.advance();
        }
    }

    // ===== Statements =====

    /// Statements up to (not including) a block terminator or end of input.
    fn parse_block(&mut self) -> Vec<Stmt> {
        let mut stmts = Vec::new();
        loop {
            self.bump_while_semi();
            let kind = &self.peek().kind;
            if kind.is_eof() || kind.is_block_terminator() {
                break;
            }
            if let Some(s) = self.parse_stmt_recovering() {
                stmts.push(s);
            }
        }
        stmts
    }

    fn parse_stmt_recovering(&mut self) -> Option<Stmt> {
        let start = self.pos;
        let start_line = self.peek().line;
        let outer = std::mem::replace(&mut self.poisoned, false);
        let result = self.parse_stmt();
        let mut poisoned = std::mem::replace(&mut self.poisoned, outer);
        let stmt = match result {
            Ok(stmt) => Some(stmt),
            Err(err) => {
                let line = err.line.max(start_line);
                self.record(err);
                self.synchronize(line);
                None
            }
        };
        if stmt.is_some() && (poisoned || self.at_trailing_invalid()) {
            poisoned = true;
            let line = self.peek().line;
            self.synchronize(line);
        }
        // an over-deep construct drops every statement enclosing it
        if self.unwinding {
            poisoned = true;
            if self.depth == 0 {
                self.unwinding = false;
            }
        }
        if self.pos == start {
            self.advance();
        }
        stmt.filter(|_| !poisoned)
    }

    fn at_trailing_invalid(&self) -> bool {
        self.pos > 0
            && self.peek().kind == TokenKind::Invalid
            && self.peek().line == self.tokens[self.pos - 1].line
    }

    fn parse_stmt(&mut self) -> PResult<Stmt> {
        let tok = self.peek().clone();
        let span = Span::from(tok.position());
        match tok.kind {
            TokenKind::Def | TokenKind::Const => self.parse_var_decl(),
            TokenKind::Function => self.nested(Self::parse_function),
            TokenKind::If => self.nested(Self::parse_if),
            TokenKind::While => self.nested(Self::parse_while),
            TokenKind::Repeat => self.nested(Self::parse_repeat),
            TokenKind::Switch => self.nested(Self::parse_switch),
            TokenKind::Try => self.nested(Self::parse_try),
            TokenKind::Return => {
                self.advance();
                let value = if self.peek().line == tok.line && self.starts_expr() {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                Ok(Stmt::new(StmtKind::Return(value), span))
            }
            TokenKind::Break | TokenKind::Continue => {
                self.advance();
                let (node, word) = if tok.kind == TokenKind::Break {
                    (StmtKind::Break, "BREAK")
                } else {
                    (StmtKind::Continue, "CONTINUE")
                };
                if self.loop_depth == 0 {
                    return Err(SyntaxError::new(
                        SyntaxErrorKind::OutsideLoop(word),
                        tok.position(),
                    ));
                }
                Ok(Stmt::new(node, span))
            }
            TokenKind::Identifier if self.is_command(&tok) => self.parse_command(),
            _ => self.parse_expr_stmt(),
        }
    }

    fn nested(&mut self, f: fn(&mut Self) -> PResult<Stmt>) -> PResult<Stmt> {
        if let Err(err) = self.descend() {
            self.skip_construct();
            return Err(err);
        }
        let result = f(self);
        self.ascend();
        result
    }

    fn parse_var_decl(&mut self) -> PResult<Stmt> {
        let kw = self.advance();
        let mutable = kw.kind == TokenKind::Def;
        let name = match self.peek().kind {
            TokenKind::Variable => self.advance().lexeme,
            TokenKind::Identifier => {
                let t = self.peek();
                return Err(SyntaxError::new(
                    SyntaxErrorKind::MalformedDeclaration(format!(
                        "variable names start with `$`, found `{}`",
                        t.lexeme
                    )),
                    t.position(),
                ));
            }
            _ => return Err(self.unexpected("a variable name")),
        };
        let init = if self.eat(&TokenKind::Assign) {
            self.parse_expr()?
        } else if mutable {
            Expr::literal(Literal::Null, kw.position().into())
        } else {
            return Err(SyntaxError::new(
                SyntaxErrorKind::MalformedDeclaration(format!("CONST {} needs a value", name)),
                kw.position(),
            ));
        };
        Ok(Stmt::new(
            StmtKind::VariableDeclaration {
                name,
                mutable,
                init,
            },
            kw.position().into(),
        ))
    }

    fn parse_function(&mut self) -> PResult<Stmt> {
        let kw = self.advance();
        let name = match self.peek().kind {
            TokenKind::Identifier => self.advance().lexeme,
            _ => return Err(self.unexpected("a function name")),
        };
        self.expect(&TokenKind::LParen, "`(`")?;
        let mut params: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        if !self.is(&TokenKind::RParen) {
            loop {
                let p = self.expect_variable("a parameter name")?;
                if !seen.insert(p.lexeme.clone()) {
                    self.declaration_error(
                        DeclarationError::DuplicateParameter {
                            function: name.clone(),
                            name: p.lexeme.clone(),
                        },
                        p.position(),
                    );
                }
                params.push(p.lexeme);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen, "`)`")?;

        // loops outside the function do not make BREAK legal inside it
        let saved_loops = std::mem::replace(&mut self.loop_depth, 0);
        let body = self.parse_block();
        self.loop_depth = saved_loops;
        self.expect_terminator(TokenKind::EndFunction, "FUNCTION", "ENDFUNCTION", kw.position())?;

        let span: Span = kw.position().into();
        Ok(Stmt::new(
            StmtKind::FunctionDeclaration(Rc::new(FunctionDecl {
                name,
                params,
                body,
                span,
            })),
            span,
        ))
    }

    fn parse_if(&mut self) -> PResult<Stmt> {
        let kw = self.advance();
        self.parse_if_tail(kw.position())
    }

    /// Condition and branches after `IF`/`ELSEIF`; one `ENDIF` closes the
    /// whole chain.
    fn parse_if_tail(&mut self, opened: Position) -> PResult<Stmt> {
        let cond = self.parse_expr()?;
        let then_branch = self.parse_block();
        let else_branch = match self.peek().kind {
            TokenKind::ElseIf => {
                let elif = self.advance();
                let nested = self.parse_if_tail(elif.position())?;
                return Ok(Stmt::new(
                    StmtKind::If {
                        cond,
                        then_branch,
                        else_branch: Some(vec![nested]),
                    },
                    opened.into(),
                ));
            }
            TokenKind::Else => {
                self.advance();
                Some(self.parse_block())
            }
            _ => None,
        };
        self.expect_terminator(TokenKind::EndIf, "IF", "ENDIF", opened)?;
        Ok(Stmt::new(
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            },
            opened.into(),
        ))
    }

    fn parse_loop_body(&mut self) -> Vec<Stmt> {
        self.loop_depth += 1;
        let body = self.parse_block();
        self.loop_depth -= 1;
        body
    }

    fn parse_while(&mut self) -> PResult<Stmt> {
        let kw = self.advance();
        let cond = self.parse_expr()?;
        let body = self.parse_loop_body();
        self.expect_terminator(TokenKind::EndWhile, "WHILE", "ENDWHILE", kw.position())?;
        Ok(Stmt::new(StmtKind::While { cond, body }, kw.position().into()))
    }

    fn parse_repeat(&mut self) -> PResult<Stmt> {
        let kw = self.advance();
        let count = self.parse_expr()?;
        let body = self.parse_loop_body();
        self.expect_terminator(TokenKind::EndRepeat, "REPEAT", "ENDREPEAT", kw.position())?;
        Ok(Stmt::new(StmtKind::Repeat { count, body }, kw.position().into()))
    }

    fn parse_switch(&mut self) -> PResult<Stmt> {
        let kw = self.advance();
        let subject = self.parse_expr()?;
        self.bump_while_semi();
        let mut cases = Vec::new();
        let mut default = None;
        let mut labels: Vec<Value> = Vec::new();
        loop {
            let tok = self.peek().clone();
            match tok.kind {
                TokenKind::Case => {
                    self.advance();
                    if default.is_some() {
                        return Err(SyntaxError::new(
                            SyntaxErrorKind::UnexpectedToken {
                                found: tok.lexeme.clone(),
                                expected: "`ENDSWITCH` after DEFAULT".into(),
                            },
                            tok.position(),
                        ));
                    }
                    let value = self.parse_expr()?;
                    // `CASE 1` and `CASE 1.0` match the same subjects
                    if let Some(lit) = value.as_literal() {
                        let label = Value::from(lit);
                        if labels.iter().any(|seen| values_equal(seen, &label)) {
                            self.declaration_error(
                                DeclarationError::DuplicateCase(lit.to_string()),
                                tok.position(),
                            );
                        } else {
                            labels.push(label);
                        }
                    }
                    self.eat(&TokenKind::Colon);
                    let body = self.parse_block();
                    cases.push(SwitchCase { value, body });
                }
                TokenKind::Default => {
                    self.advance();
                    if default.is_some() {
                        return Err(SyntaxError::new(
                            SyntaxErrorKind::MalformedDeclaration("SWITCH has two DEFAULT branches".into()),
                            tok.position(),
                        ));
                    }
                    self.eat(&TokenKind::Colon);
                    default = Some(self.parse_block());
                }
                TokenKind::EndSwitch => {
                    self.advance();
                    break;
                }
                TokenKind::Eof => {
                    return Err(SyntaxError::new(
                        SyntaxErrorKind::MissingTerminator {
                            opener: "SWITCH",
                            terminator: "ENDSWITCH",
                            line: kw.line,
                        },
                        tok.position(),
                    ));
                }
                _ => return Err(self.unexpected("`CASE`, `DEFAULT` or `ENDSWITCH`")),
            }
        }
        Ok(Stmt::new(
            StmtKind::Switch {
                subject,
                cases,
                default,
            },
            kw.position().into(),
        ))
    }

    fn parse_try(&mut self) -> PResult<Stmt> {
        let kw = self.advance();
        let body = self.parse_block();
        if !self.eat(&TokenKind::Catch) {
            if self.peek().kind.is_eof() {
                return Err(SyntaxError::new(
                    SyntaxErrorKind::MissingTerminator {
                        opener: "TRY",
                        terminator: "CATCH",
                        line: kw.line,
                    },
                    self.peek().position(),
                ));
            }
            return Err(self.unexpected("`CATCH`"));
        }
        let error_var = self.expect_variable("a variable to hold the error")?.lexeme;
        let handler = self.parse_block();
        self.expect_terminator(TokenKind::EndTry, "TRY", "ENDTRY", kw.position())?;
        Ok(Stmt::new(
            StmtKind::TryCatch {
                body,
                error_var,
                handler,
            },
            kw.position().into(),
        ))
    }

    /// A registered native used as a statement, not immediately followed
    /// by `(`.
    fn is_command(&self, tok: &Token) -> bool {
        if !self.natives.contains(&tok.lexeme) {
            return false;
        }
        let next = self.peek_at(1);
        !(next.kind == TokenKind::LParen && next.line == tok.line && next.column == tok.end_column())
    }

    /// `NAME arg arg ...` where every argument sits on the command's line.
    fn parse_command(&mut self) -> PResult<Stmt> {
        let name_tok = self.advance();
        let mut args = Vec::new();
        loop {
            if self.peek().line != name_tok.line || !self.starts_expr() {
                break;
            }
            args.push(self.parse_command_arg()?);
            if self.peek().line == name_tok.line {
                self.eat(&TokenKind::Comma);
            }
        }
        let span: Span = name_tok.position().into();
        Ok(Stmt::new(
            StmtKind::Command {
                name: name_tok.lexeme,
                args,
            },
            span,
        ))
    }

    fn parse_expr_stmt(&mut self) -> PResult<Stmt> {
        let start = self.peek().position();
        let expr = self.parse_expr()?;
        let op = match self.peek().kind {
            TokenKind::Assign => AssignOp::Assign,
            TokenKind::PlusAssign => AssignOp::Add,
            TokenKind::MinusAssign => AssignOp::Sub,
            TokenKind::StarAssign => AssignOp::Mul,
            TokenKind::SlashAssign => AssignOp::Div,
            _ => return Ok(Stmt::new(StmtKind::Expression(expr), start.into())),
        };
        let op_tok = self.advance();
        let ExprKind::Identifier(name) = expr.node else {
            return Err(SyntaxError::new(
                SyntaxErrorKind::InvalidAssignmentTarget,
                op_tok.position(),
            ));
        };
        let value = self.parse_expr()?;
        Ok(Stmt::new(StmtKind::Assignment { name, op, value }, start.into()))
    }

    // ===== Expressions =====

    fn starts_expr(&self) -> bool {
        matches!(
            self.peek().kind,
            TokenKind::Identifier
                | TokenKind::Variable
                | TokenKind::Integer(_)
                | TokenKind::Float(_)
                | TokenKind::Str(_)
                | TokenKind::Boolean(_)
                | TokenKind::Null
                | TokenKind::LParen
                | TokenKind::Minus
                | TokenKind::Bang
        )
    }

    pub fn parse_expr(&mut self) -> PResult<Expr> {
        self.parse_binary(1)
    }

    /// Each folded operator adds a tree level, so a flat chain counts
    /// against the nesting limit like parentheses do.
    fn parse_binary(&mut self, min_prec: u8) -> PResult<Expr> {
        let mut left = self.parse_unary(false)?;
        let mut folded = 0;
        let result = loop {
            let Some(op) = binary_op(&self.peek().kind) else {
                break Ok(left);
            };
            let prec = op.precedence();
            if prec < min_prec {
                break Ok(left);
            }
            if let Err(e) = self.descend() {
                break Err(e);
            }
            folded += 1;
            let op_tok = self.advance();
            let right = match self.parse_binary(prec + 1) {
                Ok(right) => right,
                Err(e) => break Err(e),
            };
            left = Expr::new(
                ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                op_tok.position().into(),
            );
        };
        self.depth -= folded;
        result
    }

    fn parse_command_arg(&mut self) -> PResult<Expr> {
        self.parse_unary(true)
    }

    fn parse_unary(&mut self, in_command: bool) -> PResult<Expr> {
        let op = match self.peek().kind {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Bang => UnaryOp::Not,
            _ => return self.parse_postfix(in_command),
        };
        let op_tok = self.advance();
        self.descend()?;
        let operand = self.parse_unary(in_command);
        self.ascend();
        Ok(Expr::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand?),
            },
            op_tok.position().into(),
        ))
    }

    /// Calls need `(` on the callee's line; inside command arguments it
    /// must also touch the callee so `SAY $a (1 + 2)` stays two arguments.
    fn parse_postfix(&mut self, in_command: bool) -> PResult<Expr> {
        let mut expr = self.parse_primary()?;
        let mut calls = 0;
        let result = loop {
            let prev = &self.tokens[self.pos.saturating_sub(1)];
            let next = self.peek();
            let callable = next.kind == TokenKind::LParen
                && next.line == prev.line
                && (!in_command || next.column == prev.end_column());
            if !callable {
                break Ok(expr);
            }
            if let Err(e) = self.descend() {
                break Err(e);
            }
            calls += 1;
            let open = self.advance();
            let args = match self.parse_call_args() {
                Ok(args) => args,
                Err(e) => break Err(e),
            };
            expr = Expr::new(
                ExprKind::Call {
                    callee: Box::new(expr),
                    args,
                },
                open.position().into(),
            );
        };
        self.depth -= calls;
        result
    }

    fn parse_call_args(&mut self) -> PResult<Vec<Expr>> {
        let mut args = Vec::new();
        if !self.is(&TokenKind::RParen) {
            loop {
                args.push(self.parse_expr()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen, "`)` to close the argument list")?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let tok = self.peek().clone();
        let span = Span::from(tok.position());
        let lit = match tok.kind {
            TokenKind::Integer(i) => Literal::Int(i),
            TokenKind::Float(f) => Literal::Float(f),
            TokenKind::Str(ref s) => Literal::Str(s.clone()),
            TokenKind::Boolean(b) => Literal::Bool(b),
            TokenKind::Null => Literal::Null,
            TokenKind::Identifier | TokenKind::Variable => {
                self.advance();
                return Ok(Expr::new(ExprKind::Identifier(tok.lexeme), span));
            }
            TokenKind::LParen => {
                self.advance();
                self.descend()?;
                let inner = self.parse_expr();
                self.ascend();
                let inner = inner?;
                self.expect(&TokenKind::RParen, "`)`")?;
                return Ok(inner);
            }
            _ => return self.recover_expr(),
        };
        self.advance();
        Ok(Expr::literal(lit, span))
    }

    /// Expression-level recovery: report, skip to the next operator or
    /// boundary and hand back a placeholder so the caller can go on. The
    /// statement is discarded afterwards.
    fn recover_expr(&mut self) -> PResult<Expr> {
        let err = self.unexpected("an expression");
        let span = Span::from(self.peek().position());
        if matches!(err.kind, SyntaxErrorKind::UnexpectedEof { .. }) {
            return Err(err);
        }
        let line = self.peek().line;
        self.record(err);
        self.poisoned = true;
        loop {
            let tok = self.peek();
            let kind = &tok.kind;
            let next_line_name =
                matches!(kind, TokenKind::Identifier | TokenKind::Variable) && tok.line > line;
            if kind.is_eof()
                || next_line_name
                || kind.is_binary_operator()
                || kind.starts_statement()
                || kind.is_block_terminator()
                || matches!(kind, TokenKind::Semicolon | TokenKind::RParen | TokenKind::Comma)
            {
                break;
            }
            self.advance();
        }
        Ok(Expr::literal(Literal::Null, span))
    }
}

fn opens_block(kind: &TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Function
            | TokenKind::If
            | TokenKind::While
            | TokenKind::Repeat
            | TokenKind::Switch
            | TokenKind::Try
    )
}

fn closes_block(kind: &TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::EndFunction
            | TokenKind::EndIf
            | TokenKind::EndWhile
            | TokenKind::EndRepeat
            | TokenKind::EndSwitch
            | TokenKind::EndTry
    )
}

fn binary_op(kind: &TokenKind) -> Option<BinaryOp> {
    Some(match kind {
        TokenKind::Plus => BinaryOp::Add,
        TokenKind::Minus => BinaryOp::Sub,
        TokenKind::Star => BinaryOp::Mul,
        TokenKind::Slash => BinaryOp::Div,
        TokenKind::Percent => BinaryOp::Rem,
        TokenKind::EqualEqual => BinaryOp::Eq,
        TokenKind::BangEqual => BinaryOp::Ne,
        TokenKind::Less => BinaryOp::Lt,
        TokenKind::LessEqual => BinaryOp::Le,
        TokenKind::Greater => BinaryOp::Gt,
        TokenKind::GreaterEqual => BinaryOp::Ge,
        TokenKind::AndAnd => BinaryOp::And,
        TokenKind::OrOr => BinaryOp::Or,
        _ => return None,
    })
}

/// Parses `tokens` with `natives` deciding command names.
pub fn parse(tokens: Vec<Token>, natives: &NativeRegistry) -> (Program, Vec<Diagnostic>) {
    Parser::new(tokens, natives).parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::native::Arity;

    fn bot_natives() -> NativeRegistry {
        let mut reg = NativeRegistry::new();
        reg.register("SAY", Arity::AtLeast(1), |_| Ok(crate::value::Value::Null));
        reg.register("GOTO", Arity::Exact(3), |_| Ok(crate::value::Value::Null));
        reg
    }

    fn parse_src(src: &str) -> (Program, Vec<Diagnostic>) {
        let natives = bot_natives();
        parse(tokenize(src).unwrap(), &natives)
    }

    fn parse_ok(src: &str) -> Program {
        let (prog, diags) = parse_src(src);
        assert!(diags.is_empty(), "unexpected diagnostics: {:?}", diags);
        prog
    }

    #[test]
    fn precedence_mul_over_add() {
        let prog = parse_ok("DEF $x = 1 + 2 * 3");
        let StmtKind::VariableDeclaration { init, .. } = &prog.statements[0].node else {
            panic!("expected declaration");
        };
        let ExprKind::Binary { op, right, .. } = &init.node else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(right.node, ExprKind::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn command_with_three_args() {
        let prog = parse_ok("GOTO 10 64 20");
        match &prog.statements[0].node {
            StmtKind::Command { name, args } => {
                assert_eq!(name, "GOTO");
                assert_eq!(args.len(), 3);
            }
            other => panic!("expected command, got {:?}", other),
        }
    }

    #[test]
    fn native_with_parens_is_a_call() {
        let prog = parse_ok("SAY(\"hi\")");
        assert!(matches!(
            &prog.statements[0].node,
            StmtKind::Expression(Expr { node: ExprKind::Call { .. }, .. })
        ));
    }

    #[test]
    fn command_args_stop_at_line_end() {
        let prog = parse_ok("SAY \"a\" $x\n$x = 2");
        assert_eq!(prog.statements.len(), 2);
        let StmtKind::Command { args, .. } = &prog.statements[0].node else {
            panic!("expected command");
        };
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn elseif_chain_closes_with_one_endif() {
        let prog = parse_ok("IF $a\nSAY 1\nELSEIF $b\nSAY 2\nELSE\nSAY 3\nENDIF");
        let StmtKind::If { else_branch, .. } = &prog.statements[0].node else {
            panic!("expected if");
        };
        let nested = &else_branch.as_ref().unwrap()[0];
        assert!(matches!(nested.node, StmtKind::If { else_branch: Some(_), .. }));
    }

    #[test]
    fn switch_with_cases_and_default() {
        let prog = parse_ok("SWITCH $d\nCASE 1:\nSAY 1\nCASE 2\nSAY 2\nDEFAULT:\nSAY 0\nENDSWITCH");
        let StmtKind::Switch { cases, default, .. } = &prog.statements[0].node else {
            panic!("expected switch");
        };
        assert_eq!(cases.len(), 2);
        assert!(default.is_some());
    }

    #[test]
    fn recovery_keeps_statements_after_error() {
        let (prog, diags) = parse_src("DEF $x = \nDEF $y = 2\nSAY $y");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].line, 2);
        assert_eq!(prog.statements.len(), 2);
    }

    #[test]
    fn missing_terminator_is_reported() {
        let (_, diags) = parse_src("WHILE $x\nSAY 1\n");
        assert_eq!(diags.len(), 1);
        assert!(diags[0].message.contains("ENDWHILE"));
    }

    #[test]
    fn break_outside_loop() {
        let (_, diags) = parse_src("BREAK");
        assert_eq!(diags.len(), 1);
        assert!(diags[0].message.contains("outside of a loop"));
        parse_ok("WHILE TRUE\nIF $x\nBREAK\nENDIF\nENDWHILE");
    }

    #[test]
    fn break_inside_function_inside_loop_is_rejected() {
        let (_, diags) = parse_src("WHILE TRUE\nFUNCTION f()\nBREAK\nENDFUNCTION\nBREAK\nENDWHILE");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].line, 3);
    }

    #[test]
    fn duplicate_parameter_and_case() {
        let (prog, diags) = parse_src("FUNCTION f($a, $a)\nRETURN $a\nENDFUNCTION");
        assert_eq!(diags[0].kind, DiagnosticKind::Declaration);
        assert!(prog.statements.is_empty());
        let (_, diags) = parse_src("SWITCH 1\nCASE 1\nCASE 1\nENDSWITCH");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, DiagnosticKind::Declaration);
    }

    #[test]
    fn case_labels_compare_by_value() {
        let (_, diags) = parse_src("SWITCH $x\nCASE 1\nSAY 1\nCASE 1.0\nSAY 2\nENDSWITCH");
        assert_eq!(diags.len(), 1, "{:?}", diags);
        assert_eq!(diags[0].kind, DiagnosticKind::Declaration);
        assert_eq!(diags[0].line, 4);
        parse_ok("SWITCH $x\nCASE 1\nSAY 1\nCASE \"1\"\nSAY 2\nCASE 1.5\nSAY 3\nENDSWITCH");
    }

    #[test]
    fn flat_chains_count_toward_nesting() {
        let natives = bot_natives();
        let parse_limited = |src: &str| {
            Parser::new(tokenize(src).unwrap(), &natives)
                .with_max_depth(8)
                .parse()
        };
        let (prog, diags) = parse_limited(&format!("DEF $x = 1{}", " + 1".repeat(8)));
        assert!(diags.is_empty(), "{:?}", diags);
        assert_eq!(prog.statements.len(), 1);

        let (prog, diags) = parse_limited(&format!("DEF $x = 1{}\nSAY 2", " + 1".repeat(9)));
        assert_eq!(diags.len(), 1, "{:?}", diags);
        assert!(diags[0].message.contains("stack overflow"));
        assert_eq!(prog.statements.len(), 1);

        let (_, diags) = parse_limited(&format!("DEF $f = g{}", "()".repeat(9)));
        assert_eq!(diags.len(), 1, "{:?}", diags);
        let (_, diags) = parse_limited(&format!("DEF $f = {}1{}", "g(".repeat(9), ")".repeat(9)));
        assert_eq!(diags.len(), 1, "{:?}", diags);
    }

    #[test]
    fn invalid_tokens_reported_once_each() {
        let (prog, diags) = parse_src("DEF $a = 1 @ 2\nDEF $b = 3 ` 4\nSAY $a");
        let lexical = diags.iter().filter(|d| d.kind == DiagnosticKind::Lexical).count();
        assert_eq!(lexical, 2);
        assert_eq!(prog.statements.len(), 1);
    }

    #[test]
    fn nesting_limit_is_a_diagnostic() {
        let depth = 10;
        let src = format!("{}SAY 1\n{}", "IF TRUE\n".repeat(depth), "ENDIF\n".repeat(depth));
        let natives = bot_natives();
        let (_, diags) = Parser::new(tokenize(&src).unwrap(), &natives)
            .with_max_depth(4)
            .parse();
        assert_eq!(diags.len(), 1, "{:?}", diags);
        assert!(diags[0].message.contains("stack overflow"));

        let deep = format!("DEF $x = {}1{}", "(".repeat(200), ")".repeat(200));
        let (_, diags) = parse_src(&deep);
        assert_eq!(diags.len(), 1);
    }

    #[test]
    fn assignment_target_must_be_a_name() {
        let (_, diags) = parse_src("1 = 2");
        assert!(diags[0].message.contains("invalid assignment target"));
        let prog = parse_ok("DEF $x = 1\n$x += 2");
        assert!(matches!(
            prog.statements[1].node,
            StmtKind::Assignment { op: AssignOp::Add, .. }
        ));
    }

    #[test]
    fn stray_terminator_at_top_level() {
        let (prog, diags) = parse_src("ENDIF\nSAY 1");
        assert_eq!(diags.len(), 1);
        assert_eq!(prog.statements.len(), 1);
    }

    #[test]
    fn print_then_parse_gives_same_tree() {
        let src = "FUNCTION f($a, $b)\nIF $a > 1 && !$b\nRETURN ($a - 1) * 2\nELSE\nRETURN -$a\nENDIF\nENDFUNCTION\nGOTO 1 (2 + 3) f(4, 5)\nTRY\nSAY \"q\\\"x\"\nCATCH $e\nSAY $e\nENDTRY";
        let first = parse_ok(src);
        let second = parse_ok(&first.to_string());
        assert_eq!(first, second);
    }
}

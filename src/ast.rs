//! AST: owned syntax tree produced by the parser, rewritten by the
//! optimizer and walked by the interpreter.
//!
//! `Display` prints a tree back as BotScript source. Printing then parsing
//! yields a structurally equal tree; spans never take part in equality.

use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

use crate::error::Position;

/// Source position of a node. Compares equal to every other span.
#[derive(Clone, Copy, Debug, Default)]
pub struct Span {
    pub line: usize,
    pub column: usize,
}

impl PartialEq for Span {
    fn eq(&self, _: &Self) -> bool {
        true
    }
}

impl Span {
    pub fn position(&self) -> Position {
        Position::new(self.line, self.column)
    }
}

impl From<Position> for Span {
    fn from(p: Position) -> Self {
        Span {
            line: p.line,
            column: p.column,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Stmt {
    pub node: StmtKind,
    pub span: Span,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StmtKind {
    /// `DEF $x = e` (mutable) or `CONST $x = e`.
    VariableDeclaration {
        name: String,
        mutable: bool,
        init: Expr,
    },
    FunctionDeclaration(Rc<FunctionDecl>),
    Assignment {
        name: String,
        op: AssignOp,
        value: Expr,
    },
    If {
        cond: Expr,
        then_branch: Vec<Stmt>,
        else_branch: Option<Vec<Stmt>>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    Repeat {
        count: Expr,
        body: Vec<Stmt>,
    },
    Switch {
        subject: Expr,
        cases: Vec<SwitchCase>,
        default: Option<Vec<Stmt>>,
    },
    TryCatch {
        body: Vec<Stmt>,
        error_var: String,
        handler: Vec<Stmt>,
    },
    Return(Option<Expr>),
    Break,
    Continue,
    /// Native invoked in command form: `GOTO 10 64 20`.
    Command {
        name: String,
        args: Vec<Expr>,
    },
    Expression(Expr),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SwitchCase {
    pub value: Expr,
    pub body: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    pub node: ExprKind,
    pub span: Span,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    Literal(Literal),
    Identifier(String),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    /// Binding power; higher binds tighter. All levels are left-associative.
    pub fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq | BinaryOp::Ne => 3,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 4,
            BinaryOp::Add | BinaryOp::Sub => 5,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => 6,
        }
    }

    pub fn is_short_circuit(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnaryOp::Neg => f.write_str("-"),
            UnaryOp::Not => f.write_str("!"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
}

impl AssignOp {
    /// Operator a compound assignment applies before storing.
    pub fn binary(self) -> Option<BinaryOp> {
        match self {
            AssignOp::Assign => None,
            AssignOp::Add => Some(BinaryOp::Add),
            AssignOp::Sub => Some(BinaryOp::Sub),
            AssignOp::Mul => Some(BinaryOp::Mul),
            AssignOp::Div => Some(BinaryOp::Div),
        }
    }
}

impl fmt::Display for AssignOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AssignOp::Assign => "=",
            AssignOp::Add => "+=",
            AssignOp::Sub => "-=",
            AssignOp::Mul => "*=",
            AssignOp::Div => "/=",
        };
        f.write_str(s)
    }
}

impl Expr {
    pub fn new(node: ExprKind, span: Span) -> Self {
        Self { node, span }
    }

    pub fn literal(lit: Literal, span: Span) -> Self {
        Self::new(ExprKind::Literal(lit), span)
    }

    pub fn as_literal(&self) -> Option<&Literal> {
        match &self.node {
            ExprKind::Literal(l) => Some(l),
            _ => None,
        }
    }
}

impl Stmt {
    pub fn new(node: StmtKind, span: Span) -> Self {
        Self { node, span }
    }

    /// Whether control never falls through to the next statement.
    pub fn is_jump(&self) -> bool {
        matches!(
            self.node,
            StmtKind::Return(_) | StmtKind::Break | StmtKind::Continue
        )
    }

    /// Name this statement binds in the enclosing scope, if any.
    pub fn declared_name(&self) -> Option<&str> {
        match &self.node {
            StmtKind::VariableDeclaration { name, .. } => Some(name),
            StmtKind::FunctionDeclaration(f) => Some(&f.name),
            _ => None,
        }
    }
}

impl FunctionDecl {
    /// Names the body reads or writes that are not parameters. Used to
    /// decide what a closure must snapshot. Over-approximates: locals
    /// declared inside the body are included and simply resolve first at
    /// call time.
    pub fn free_variables(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        collect_block(&self.body, &mut names);
        for p in &self.params {
            names.remove(p);
        }
        names.into_iter().collect()
    }
}

fn collect_block(stmts: &[Stmt], out: &mut BTreeSet<String>) {
    for s in stmts {
        collect_stmt(s, out);
    }
}

fn collect_stmt(stmt: &Stmt, out: &mut BTreeSet<String>) {
    match &stmt.node {
        StmtKind::VariableDeclaration { init, .. } => collect_expr(init, out),
        StmtKind::FunctionDeclaration(f) => {
            let mut inner = BTreeSet::new();
            collect_block(&f.body, &mut inner);
            for p in &f.params {
                inner.remove(p);
            }
            out.extend(inner);
        }
        StmtKind::Assignment { name, value, .. } => {
            out.insert(name.clone());
            collect_expr(value, out);
        }
        StmtKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            collect_expr(cond, out);
            collect_block(then_branch, out);
            if let Some(e) = else_branch {
                collect_block(e, out);
            }
        }
        StmtKind::While { cond, body } => {
            collect_expr(cond, out);
            collect_block(body, out);
        }
        StmtKind::Repeat { count, body } => {
            collect_expr(count, out);
            collect_block(body, out);
        }
        StmtKind::Switch {
            subject,
            cases,
            default,
        } => {
            collect_expr(subject, out);
            for c in cases {
                collect_expr(&c.value, out);
                collect_block(&c.body, out);
            }
            if let Some(d) = default {
                collect_block(d, out);
            }
        }
        StmtKind::TryCatch { body, handler, .. } => {
            collect_block(body, out);
            collect_block(handler, out);
        }
        StmtKind::Return(Some(e)) | StmtKind::Expression(e) => collect_expr(e, out),
        StmtKind::Command { name, args } => {
            out.insert(name.clone());
            for a in args {
                collect_expr(a, out);
            }
        }
        StmtKind::Return(None) | StmtKind::Break | StmtKind::Continue => {}
    }
}

fn collect_expr(expr: &Expr, out: &mut BTreeSet<String>) {
    match &expr.node {
        ExprKind::Literal(_) => {}
        ExprKind::Identifier(name) => {
            out.insert(name.clone());
        }
        ExprKind::Binary { left, right, .. } => {
            collect_expr(left, out);
            collect_expr(right, out);
        }
        ExprKind::Unary { operand, .. } => collect_expr(operand, out),
        ExprKind::Call { callee, args } => {
            collect_expr(callee, out);
            for a in args {
                collect_expr(a, out);
            }
        }
    }
}

// ===== Printing =====

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => f.write_str("NULL"),
            Literal::Bool(true) => f.write_str("TRUE"),
            Literal::Bool(false) => f.write_str("FALSE"),
            Literal::Int(i) => write!(f, "{}", i),
            Literal::Float(x) => {
                let s = x.to_string();
                if s.contains('.') || !x.is_finite() {
                    f.write_str(&s)
                } else {
                    write!(f, "{}.0", s)
                }
            }
            Literal::Str(s) => {
                f.write_str("\"")?;
                for c in s.chars() {
                    match c {
                        '"' => f.write_str("\\\"")?,
                        '\\' => f.write_str("\\\\")?,
                        '\n' => f.write_str("\\n")?,
                        '\t' => f.write_str("\\t")?,
                        '\r' => f.write_str("\\r")?,
                        '\0' => f.write_str("\\0")?,
                        c => write!(f, "{}", c)?,
                    }
                }
                f.write_str("\"")
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node {
            ExprKind::Literal(lit) => match lit {
                // a bare `-5` would read back as a negation
                Literal::Int(i) if *i < 0 => write!(f, "({})", lit),
                Literal::Float(x) if x.is_sign_negative() => write!(f, "({})", lit),
                _ => write!(f, "{}", lit),
            },
            ExprKind::Identifier(name) => f.write_str(name),
            ExprKind::Binary { op, left, right } => {
                let prec = op.precedence();
                write_operand(f, left, prec, false)?;
                write!(f, " {} ", op)?;
                write_operand(f, right, prec, true)
            }
            ExprKind::Unary { op, operand } => {
                write!(f, "{}", op)?;
                match operand.node {
                    ExprKind::Binary { .. } => write!(f, "({})", operand),
                    _ => write!(f, "{}", operand),
                }
            }
            ExprKind::Call { callee, args } => {
                match callee.node {
                    ExprKind::Identifier(_) | ExprKind::Call { .. } => write!(f, "{}", callee)?,
                    _ => write!(f, "({})", callee)?,
                }
                f.write_str("(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                f.write_str(")")
            }
        }
    }
}

fn write_operand(f: &mut fmt::Formatter<'_>, e: &Expr, parent: u8, right: bool) -> fmt::Result {
    let wrap = match &e.node {
        ExprKind::Binary { op, .. } => {
            let p = op.precedence();
            p < parent || (right && p == parent)
        }
        _ => false,
    };
    if wrap {
        write!(f, "({})", e)
    } else {
        write!(f, "{}", e)
    }
}

struct Printer<'a, 'b> {
    f: &'a mut fmt::Formatter<'b>,
    indent: usize,
}

impl Printer<'_, '_> {
    fn line(&mut self, text: fmt::Arguments<'_>) -> fmt::Result {
        for _ in 0..self.indent {
            self.f.write_str("    ")?;
        }
        self.f.write_fmt(text)?;
        self.f.write_str("\n")
    }

    fn block(&mut self, stmts: &[Stmt]) -> fmt::Result {
        self.indent += 1;
        for s in stmts {
            self.stmt(s)?;
        }
        self.indent -= 1;
        Ok(())
    }

    fn stmt(&mut self, stmt: &Stmt) -> fmt::Result {
        match &stmt.node {
            StmtKind::VariableDeclaration {
                name,
                mutable,
                init,
            } => {
                let kw = if *mutable { "DEF" } else { "CONST" };
                self.line(format_args!("{} {} = {}", kw, name, init))
            }
            StmtKind::FunctionDeclaration(func) => {
                self.line(format_args!(
                    "FUNCTION {}({})",
                    func.name,
                    func.params.join(", ")
                ))?;
                self.block(&func.body)?;
                self.line(format_args!("ENDFUNCTION"))
            }
            StmtKind::Assignment { name, op, value } => {
                self.line(format_args!("{} {} {}", name, op, value))
            }
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.line(format_args!("IF {}", cond))?;
                self.block(then_branch)?;
                if let Some(e) = else_branch {
                    self.line(format_args!("ELSE"))?;
                    self.block(e)?;
                }
                self.line(format_args!("ENDIF"))
            }
            StmtKind::While { cond, body } => {
                self.line(format_args!("WHILE {}", cond))?;
                self.block(body)?;
                self.line(format_args!("ENDWHILE"))
            }
            StmtKind::Repeat { count, body } => {
                self.line(format_args!("REPEAT {}", count))?;
                self.block(body)?;
                self.line(format_args!("ENDREPEAT"))
            }
            StmtKind::Switch {
                subject,
                cases,
                default,
            } => {
                self.line(format_args!("SWITCH {}", subject))?;
                for c in cases {
                    self.line(format_args!("CASE {}:", c.value))?;
                    self.block(&c.body)?;
                }
                if let Some(d) = default {
                    self.line(format_args!("DEFAULT:"))?;
                    self.block(d)?;
                }
                self.line(format_args!("ENDSWITCH"))
            }
            StmtKind::TryCatch {
                body,
                error_var,
                handler,
            } => {
                self.line(format_args!("TRY"))?;
                self.block(body)?;
                self.line(format_args!("CATCH {}", error_var))?;
                self.block(handler)?;
                self.line(format_args!("ENDTRY"))
            }
            StmtKind::Return(None) => self.line(format_args!("RETURN")),
            StmtKind::Return(Some(e)) => self.line(format_args!("RETURN {}", e)),
            StmtKind::Break => self.line(format_args!("BREAK")),
            StmtKind::Continue => self.line(format_args!("CONTINUE")),
            StmtKind::Command { name, args } => {
                let mut text = name.clone();
                for a in args {
                    text.push(' ');
                    // command arguments are unary-level; wrap anything wider
                    match a.node {
                        ExprKind::Binary { .. } => text.push_str(&format!("({})", a)),
                        _ => text.push_str(&a.to_string()),
                    }
                }
                self.line(format_args!("{}", text))
            }
            StmtKind::Expression(e) => self.line(format_args!("{}", e)),
        }
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Printer { f, indent: 0 }.stmt(self)
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut p = Printer { f, indent: 0 };
        for s in &self.statements {
            p.stmt(s)?;
        }
        Ok(())
    }
}

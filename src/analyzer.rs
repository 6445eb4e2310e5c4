//! Static checks over a parsed program: duplicate declarations, call arity,
//! repeat counts, and lints for loops that never end or code that never runs.

use std::collections::{HashMap, HashSet};

use crate::ast::*;
use crate::error::{DeclarationError, Diagnostic, DiagnosticKind};
use crate::native::{Arity, NativeRegistry};

pub struct Analyzer<'a> {
    natives: &'a NativeRegistry,
    /// Names declared anywhere; these shadow natives of the same name.
    declared: HashSet<String>,
    /// Parameter counts of functions declared exactly once.
    functions: HashMap<String, Option<usize>>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Analyzer<'a> {
    pub fn new(natives: &'a NativeRegistry) -> Self {
        Self {
            natives,
            declared: HashSet::new(),
            functions: HashMap::new(),
            diagnostics: Vec::new(),
        }
    }

    pub fn analyze(mut self, program: &Program) -> Vec<Diagnostic> {
        self.collect_declarations(&program.statements);
        self.check_block(&program.statements);
        self.diagnostics.sort_by_key(|d| (d.line, d.column));
        self.diagnostics
    }

    fn collect_declarations(&mut self, stmts: &[Stmt]) {
        for s in stmts {
            match &s.node {
                StmtKind::VariableDeclaration { name, .. } => {
                    self.declared.insert(name.clone());
                }
                StmtKind::FunctionDeclaration(f) => {
                    self.declared.insert(f.name.clone());
                    self.declared.extend(f.params.iter().cloned());
                    self.functions
                        .entry(f.name.clone())
                        .and_modify(|arity| *arity = None)
                        .or_insert(Some(f.params.len()));
                    self.collect_declarations(&f.body);
                }
                StmtKind::If {
                    then_branch,
                    else_branch,
                    ..
                } => {
                    self.collect_declarations(then_branch);
                    if let Some(e) = else_branch {
                        self.collect_declarations(e);
                    }
                }
                StmtKind::While { body, .. } | StmtKind::Repeat { body, .. } => {
                    self.collect_declarations(body)
                }
                StmtKind::Switch { cases, default, .. } => {
                    for c in cases {
                        self.collect_declarations(&c.body);
                    }
                    if let Some(d) = default {
                        self.collect_declarations(d);
                    }
                }
                StmtKind::TryCatch {
                    body,
                    error_var,
                    handler,
                } => {
                    self.declared.insert(error_var.clone());
                    self.collect_declarations(body);
                    self.collect_declarations(handler);
                }
                _ => {}
            }
        }
    }

    fn error(&mut self, kind: DiagnosticKind, span: Span, msg: String) {
        self.diagnostics
            .push(Diagnostic::error(kind, span.position(), msg));
    }

    fn warning(&mut self, span: Span, msg: String) {
        self.diagnostics
            .push(Diagnostic::warning(DiagnosticKind::Analysis, span.position(), msg));
    }

    fn check_block(&mut self, stmts: &[Stmt]) {
        let mut names = HashSet::new();
        let mut warned = false;
        for (i, s) in stmts.iter().enumerate() {
            // one warning per block
            if !warned && i > 0 && stmts[i - 1].is_jump() {
                self.warning(s.span, "unreachable statement".into());
                warned = true;
            }
            if let Some(name) = s.declared_name() {
                if !names.insert(name.to_string()) {
                    self.error(
                        DiagnosticKind::Declaration,
                        s.span,
                        DeclarationError::DuplicateVariable(name.to_string()).to_string(),
                    );
                }
            }
            self.check_stmt(s);
        }
    }

    fn check_stmt(&mut self, stmt: &Stmt) {
        match &stmt.node {
            StmtKind::VariableDeclaration { init, .. } => self.check_expr(init),
            StmtKind::FunctionDeclaration(f) => self.check_block(&f.body),
            StmtKind::Assignment { value, .. } => self.check_expr(value),
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.check_expr(cond);
                self.check_block(then_branch);
                if let Some(e) = else_branch {
                    self.check_block(e);
                }
            }
            StmtKind::While { cond, body } => {
                self.check_expr(cond);
                let always = cond.as_literal().is_some_and(literal_truthy);
                if always && !body.iter().any(|s| exits_loop(s, true)) {
                    self.warning(
                        stmt.span,
                        "WHILE condition is always true and the body never exits".into(),
                    );
                }
                self.check_block(body);
            }
            StmtKind::Repeat { count, body } => {
                self.check_expr(count);
                self.check_repeat_count(count);
                self.check_block(body);
            }
            StmtKind::Switch {
                subject,
                cases,
                default,
            } => {
                self.check_expr(subject);
                for c in cases {
                    self.check_expr(&c.value);
                    self.check_block(&c.body);
                }
                if let Some(d) = default {
                    self.check_block(d);
                }
            }
            StmtKind::TryCatch { body, handler, .. } => {
                self.check_block(body);
                self.check_block(handler);
            }
            StmtKind::Return(Some(e)) | StmtKind::Expression(e) => self.check_expr(e),
            StmtKind::Command { name, args } => {
                for a in args {
                    self.check_expr(a);
                }
                self.check_arity(name, args.len(), stmt.span);
            }
            StmtKind::Return(None) | StmtKind::Break | StmtKind::Continue => {}
        }
    }

    fn check_expr(&mut self, expr: &Expr) {
        match &expr.node {
            ExprKind::Literal(_) | ExprKind::Identifier(_) => {}
            ExprKind::Binary { left, right, .. } => {
                self.check_expr(left);
                self.check_expr(right);
            }
            ExprKind::Unary { operand, .. } => self.check_expr(operand),
            ExprKind::Call { callee, args } => {
                self.check_expr(callee);
                for a in args {
                    self.check_expr(a);
                }
                if let ExprKind::Identifier(name) = &callee.node {
                    self.check_arity(name, args.len(), expr.span);
                }
            }
        }
    }

    fn check_arity(&mut self, name: &str, given: usize, span: Span) {
        let expected = if self.declared.contains(name) {
            match self.functions.get(name) {
                Some(Some(n)) => Arity::Exact(*n),
                _ => return,
            }
        } else {
            match self.natives.signature(name) {
                Some(arity) => arity,
                None => return,
            }
        };
        if !expected.accepts(given) {
            self.error(
                DiagnosticKind::Validation,
                span,
                format!("`{}` expects {} argument(s), got {}", name, expected, given),
            );
        }
    }

    fn check_repeat_count(&mut self, count: &Expr) {
        let Some(lit) = literal_value(count) else {
            return;
        };
        let span = count.span;
        match lit {
            Literal::Int(n) if n < 0 => self.error(
                DiagnosticKind::Validation,
                span,
                format!("REPEAT count must not be negative, got {}", n),
            ),
            Literal::Int(0) => self.warning(span, "REPEAT 0 never runs its body".into()),
            Literal::Int(_) => {}
            Literal::Float(f) if f < 0.0 || f.fract() != 0.0 => self.error(
                DiagnosticKind::Validation,
                span,
                format!("REPEAT count must be a whole number, got {}", f),
            ),
            Literal::Float(f) if f == 0.0 => {
                self.warning(span, "REPEAT 0 never runs its body".into())
            }
            Literal::Float(_) => {}
            other => self.error(
                DiagnosticKind::Validation,
                span,
                format!("REPEAT count must be a number, got {}", other),
            ),
        }
    }
}

/// A literal, or a negated numeric literal.
fn literal_value(e: &Expr) -> Option<Literal> {
    match &e.node {
        ExprKind::Literal(l) => Some(l.clone()),
        ExprKind::Unary {
            op: UnaryOp::Neg,
            operand,
        } => match operand.as_literal()? {
            Literal::Int(i) => Some(Literal::Int(i.checked_neg()?)),
            Literal::Float(f) => Some(Literal::Float(-f)),
            _ => None,
        },
        _ => None,
    }
}

fn literal_truthy(l: &Literal) -> bool {
    match l {
        Literal::Null => false,
        Literal::Bool(b) => *b,
        Literal::Int(i) => *i != 0,
        Literal::Float(f) => *f != 0.0 && !f.is_nan(),
        Literal::Str(s) => !s.is_empty(),
    }
}

/// Whether `stmt` can leave the loop it sits in. `BREAK` only counts at
/// this loop's level; `RETURN` and host halts count anywhere.
fn exits_loop(stmt: &Stmt, this_level: bool) -> bool {
    let any = |stmts: &[Stmt], level: bool| stmts.iter().any(|s| exits_loop(s, level));
    match &stmt.node {
        StmtKind::Break => this_level,
        StmtKind::Return(_) => true,
        StmtKind::Command { name, .. } => name.eq_ignore_ascii_case("HALT"),
        StmtKind::If {
            then_branch,
            else_branch,
            ..
        } => any(then_branch, this_level) || else_branch.as_deref().is_some_and(|e| any(e, this_level)),
        StmtKind::While { body, .. } | StmtKind::Repeat { body, .. } => any(body, false),
        StmtKind::Switch { cases, default, .. } => {
            cases.iter().any(|c| any(&c.body, this_level))
                || default.as_deref().is_some_and(|d| any(d, this_level))
        }
        StmtKind::TryCatch { body, handler, .. } => {
            any(body, this_level) || any(handler, this_level)
        }
        _ => false,
    }
}

pub fn analyze(program: &Program, natives: &NativeRegistry) -> Vec<Diagnostic> {
    Analyzer::new(natives).analyze(program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Severity;
    use crate::lexer::tokenize;
    use crate::parser::parse;
    use crate::value::Value;

    fn natives() -> NativeRegistry {
        let mut reg = NativeRegistry::with_prelude();
        reg.register("GOTO", Arity::Exact(3), |_| Ok(Value::Null));
        reg.register("SAY", Arity::AtLeast(1), |_| Ok(Value::Null));
        reg
    }

    fn check(src: &str) -> Vec<Diagnostic> {
        let reg = natives();
        let (prog, diags) = parse(tokenize(src).unwrap(), &reg);
        assert!(diags.is_empty(), "{:?}", diags);
        analyze(&prog, &reg)
    }

    #[test]
    fn native_arity_is_checked() {
        let diags = check("GOTO 10 64");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, DiagnosticKind::Validation);
        assert!(diags[0].message.contains("expects 3"));
        assert!(check("GOTO 10 64 20").is_empty());
        assert_eq!(check("DEF $m = MAX()").len(), 1);
    }

    #[test]
    fn user_function_shadows_native() {
        assert!(check("FUNCTION GOTO($x)\nRETURN $x\nENDFUNCTION\nGOTO(1)").is_empty());
    }

    #[test]
    fn user_function_arity() {
        let diags = check("FUNCTION f($a, $b)\nRETURN $a\nENDFUNCTION\nf(1)");
        assert_eq!(diags.len(), 1);
        assert!(diags[0].message.contains("`f` expects 2"));
    }

    #[test]
    fn repeat_counts() {
        let diags = check("REPEAT -1\nSAY 1\nENDREPEAT");
        assert_eq!(diags[0].severity, Severity::Error);
        let diags = check("REPEAT 0\nSAY 1\nENDREPEAT");
        assert_eq!(diags[0].severity, Severity::Warning);
        assert!(check("REPEAT 3\nSAY 1\nENDREPEAT").is_empty());
        assert_eq!(check("REPEAT \"x\"\nSAY 1\nENDREPEAT").len(), 1);
    }

    #[test]
    fn infinite_loop_warning() {
        let diags = check("WHILE TRUE\nSAY 1\nENDWHILE");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].severity, Severity::Warning);
        assert!(check("WHILE TRUE\nIF $x\nBREAK\nENDIF\nENDWHILE").is_empty());
        // a BREAK of an inner loop does not end the outer one
        assert_eq!(
            check("WHILE TRUE\nWHILE $x\nBREAK\nENDWHILE\nENDWHILE").len(),
            1
        );
    }

    #[test]
    fn unreachable_after_return() {
        let diags = check("FUNCTION f()\nRETURN 1\nSAY 2\nENDFUNCTION");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].line, 3);
        assert_eq!(diags[0].severity, Severity::Warning);
    }

    #[test]
    fn duplicate_declaration_in_one_block() {
        let diags = check("DEF $x = 1\nDEF $x = 2");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, DiagnosticKind::Declaration);
        assert!(check("DEF $x = 1\nIF TRUE\nDEF $x = 2\nENDIF").is_empty());
    }
}

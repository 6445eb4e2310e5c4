//! Compile-time optimizer: const propagation, folding, algebraic identities
//! and dead code pruning.
//!
//! `optimize` never mutates its input and is idempotent: running it on its
//! own output returns an equal tree.

use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::*;
use crate::value::{apply_binary, apply_unary, Value};

pub fn optimize(program: &Program) -> Program {
    let mut out = program.clone();
    optimize_program(&mut out);
    out
}

pub fn optimize_program(program: &mut Program) {
    let mut opt = Optimizer::new();
    let stmts = std::mem::take(&mut program.statements);
    program.statements = opt.optimize_block(stmts);
}

struct Optimizer {
    /// `Some` for a `CONST` with a literal value, `None` for a name that
    /// shadows an outer constant.
    scopes: Vec<HashMap<String, Option<Literal>>>,
}

impl Optimizer {
    fn new() -> Self {
        Self {
            scopes: vec![HashMap::new()],
        }
    }

    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn set_const(&mut self, name: &str, val: Literal) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), Some(val));
        }
    }

    fn shadow(&mut self, name: &str) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), None);
        }
    }

    fn get_const(&self, name: &str) -> Option<Literal> {
        for scope in self.scopes.iter().rev() {
            if let Some(v) = scope.get(name) {
                return v.clone();
            }
        }
        None
    }

    fn scoped_block(&mut self, stmts: Vec<Stmt>, bound: &[&str]) -> Vec<Stmt> {
        self.push_scope();
        for name in bound {
            self.shadow(name);
        }
        let out = self.optimize_block(stmts);
        self.pop_scope();
        out
    }

    /// Optimizes a statement list and drops whatever follows a jump.
    fn optimize_block(&mut self, stmts: Vec<Stmt>) -> Vec<Stmt> {
        let mut out = Vec::with_capacity(stmts.len());
        for stmt in stmts {
            self.optimize_stmt(stmt, &mut out);
            if out.last().is_some_and(Stmt::is_jump) {
                break;
            }
        }
        out
    }

    fn optimize_stmt(&mut self, stmt: Stmt, out: &mut Vec<Stmt>) {
        let span = stmt.span;
        let node = match stmt.node {
            StmtKind::VariableDeclaration {
                name,
                mutable,
                init,
            } => {
                let init = self.optimize_expr(init);
                match init.as_literal() {
                    Some(lit) if !mutable => self.set_const(&name, lit.clone()),
                    _ => self.shadow(&name),
                }
                StmtKind::VariableDeclaration {
                    name,
                    mutable,
                    init,
                }
            }
            StmtKind::FunctionDeclaration(decl) => {
                self.shadow(&decl.name);
                let params: Vec<&str> = decl.params.iter().map(String::as_str).collect();
                let body = self.scoped_block(decl.body.clone(), &params);
                StmtKind::FunctionDeclaration(Rc::new(FunctionDecl {
                    name: decl.name.clone(),
                    params: decl.params.clone(),
                    body,
                    span: decl.span,
                }))
            }
            StmtKind::Assignment { name, op, value } => StmtKind::Assignment {
                name,
                op,
                value: self.optimize_expr(value),
            },
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let cond = self.optimize_expr(cond);
                let then_branch = self.scoped_block(then_branch, &[]);
                let else_branch = else_branch.map(|e| self.scoped_block(e, &[]));
                let Some(lit) = cond.as_literal() else {
                    out.push(Stmt::new(
                        StmtKind::If {
                            cond,
                            then_branch,
                            else_branch,
                        },
                        span,
                    ));
                    return;
                };
                let taken = if literal_truthy(lit) {
                    Some(then_branch)
                } else {
                    else_branch
                };
                let Some(branch) = taken else {
                    return;
                };
                if branch.iter().all(|s| s.declared_name().is_none()) {
                    out.extend(branch);
                    return;
                }
                // keep the block scope for the branch's declarations
                StmtKind::If {
                    cond: Expr::literal(Literal::Bool(true), cond.span),
                    then_branch: branch,
                    else_branch: None,
                }
            }
            StmtKind::While { cond, body } => {
                let cond = self.optimize_expr(cond);
                if cond.as_literal().is_some_and(|l| !literal_truthy(l)) {
                    return;
                }
                StmtKind::While {
                    cond,
                    body: self.scoped_block(body, &[]),
                }
            }
            StmtKind::Repeat { count, body } => {
                let count = self.optimize_expr(count);
                let never = match count.as_literal() {
                    Some(Literal::Int(n)) => *n == 0,
                    Some(Literal::Float(f)) => *f == 0.0,
                    _ => false,
                };
                if never {
                    return;
                }
                StmtKind::Repeat {
                    count,
                    body: self.scoped_block(body, &[]),
                }
            }
            StmtKind::Switch {
                subject,
                cases,
                default,
            } => StmtKind::Switch {
                subject: self.optimize_expr(subject),
                cases: cases
                    .into_iter()
                    .map(|c| SwitchCase {
                        value: self.optimize_expr(c.value),
                        body: self.scoped_block(c.body, &[]),
                    })
                    .collect(),
                default: default.map(|d| self.scoped_block(d, &[])),
            },
            StmtKind::TryCatch {
                body,
                error_var,
                handler,
            } => {
                let body = self.scoped_block(body, &[]);
                let handler = self.scoped_block(handler, &[error_var.as_str()]);
                StmtKind::TryCatch {
                    body,
                    error_var,
                    handler,
                }
            }
            StmtKind::Return(e) => StmtKind::Return(e.map(|e| self.optimize_expr(e))),
            StmtKind::Command { name, args } => StmtKind::Command {
                name,
                args: args.into_iter().map(|a| self.optimize_expr(a)).collect(),
            },
            StmtKind::Expression(e) => StmtKind::Expression(self.optimize_expr(e)),
            node @ (StmtKind::Break | StmtKind::Continue) => node,
        };
        out.push(Stmt::new(node, span));
    }

    fn optimize_expr(&mut self, expr: Expr) -> Expr {
        let span = expr.span;
        match expr.node {
            ExprKind::Identifier(name) => match self.get_const(&name) {
                Some(lit) => Expr::literal(lit, span),
                None => Expr::new(ExprKind::Identifier(name), span),
            },
            ExprKind::Literal(_) => expr,
            ExprKind::Unary { op, operand } => {
                let operand = self.optimize_expr(*operand);
                if let Some(lit) = operand.as_literal() {
                    let folded = apply_unary(op, &Value::from(lit)).ok();
                    if let Some(lit) = folded.as_ref().and_then(Value::to_literal) {
                        return Expr::literal(lit, span);
                    }
                }
                Expr::new(
                    ExprKind::Unary {
                        op,
                        operand: Box::new(operand),
                    },
                    span,
                )
            }
            ExprKind::Binary { op, left, right } => {
                let left = self.optimize_expr(*left);
                let right = self.optimize_expr(*right);
                fold_binary(op, left, right, span)
            }
            ExprKind::Call { callee, args } => Expr::new(
                ExprKind::Call {
                    callee: Box::new(self.optimize_expr(*callee)),
                    args: args.into_iter().map(|a| self.optimize_expr(a)).collect(),
                },
                span,
            ),
        }
    }
}

fn fold_binary(op: BinaryOp, left: Expr, right: Expr, span: Span) -> Expr {
    if let Some(l) = left.as_literal() {
        let lt = literal_truthy(l);
        match op {
            // right side is never evaluated
            BinaryOp::And if !lt => return Expr::literal(Literal::Bool(false), span),
            BinaryOp::Or if lt => return Expr::literal(Literal::Bool(true), span),
            BinaryOp::And | BinaryOp::Or => {
                if let Some(r) = right.as_literal() {
                    return Expr::literal(Literal::Bool(literal_truthy(r)), span);
                }
            }
            _ => {
                if let Some(r) = right.as_literal() {
                    // division by zero and friends stay for the runtime to report
                    let folded = apply_binary(op, &Value::from(l), &Value::from(r)).ok();
                    if let Some(lit) = folded.as_ref().and_then(Value::to_literal) {
                        return Expr::literal(lit, span);
                    }
                }
            }
        }
    }

    let is_int = |e: &Expr, n: i64| matches!(e.as_literal(), Some(Literal::Int(v)) if *v == n);
    match op {
        BinaryOp::Add | BinaryOp::Sub if is_int(&right, 0) && numeric_shape(&left) => return left,
        BinaryOp::Add if is_int(&left, 0) && numeric_shape(&right) => return right,
        BinaryOp::Mul | BinaryOp::Div if is_int(&right, 1) && numeric_shape(&left) => return left,
        BinaryOp::Mul if is_int(&left, 1) && numeric_shape(&right) => return right,
        _ => {}
    }

    Expr::new(
        ExprKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        span,
    )
}

/// Whether `e` yields a number whenever it yields anything. Variables are
/// taken to hold numbers; a literal that got here failed to fold and must
/// keep its runtime error.
fn numeric_shape(e: &Expr) -> bool {
    match &e.node {
        ExprKind::Literal(Literal::Int(_) | Literal::Float(_)) => true,
        ExprKind::Literal(_) | ExprKind::Call { .. } => false,
        ExprKind::Identifier(_) => true,
        ExprKind::Unary { op, operand } => *op == UnaryOp::Neg && numeric_shape(operand),
        ExprKind::Binary { op, left, right } => match op {
            BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => true,
            BinaryOp::Add => numeric_shape(left) && numeric_shape(right),
            _ => false,
        },
    }
}

fn literal_truthy(l: &Literal) -> bool {
    Value::from(l).is_truthy()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::native::{Arity, NativeRegistry};
    use crate::parser::parse;

    fn parse_src(src: &str) -> Program {
        let mut reg = NativeRegistry::with_prelude();
        reg.register("SAY", Arity::AtLeast(1), |_| Ok(Value::Null));
        let (prog, diags) = parse(tokenize(src).unwrap(), &reg);
        assert!(diags.is_empty(), "{:?}", diags);
        prog
    }

    fn opt(src: &str) -> Program {
        optimize(&parse_src(src))
    }

    fn first_init(prog: &Program) -> &Expr {
        match &prog.statements[0].node {
            StmtKind::VariableDeclaration { init, .. } => init,
            other => panic!("expected declaration, got {:?}", other),
        }
    }

    #[test]
    fn folds_arithmetic() {
        let prog = opt("DEF $x = 2 + 3 * 4");
        assert_eq!(first_init(&prog).as_literal(), Some(&Literal::Int(14)));
        let prog = opt("DEF $s = \"hp: \" + 10");
        assert_eq!(first_init(&prog).as_literal(), Some(&Literal::Str("hp: 10".into())));
    }

    #[test]
    fn never_folds_division_by_zero() {
        let prog = opt("DEF $x = 1 / 0");
        assert!(matches!(first_init(&prog).node, ExprKind::Binary { op: BinaryOp::Div, .. }));
    }

    #[test]
    fn identities_simplify_to_operand() {
        for src in ["DEF $y = $x + 0", "DEF $y = 0 + $x", "DEF $y = $x * 1", "DEF $y = 1 * $x", "DEF $y = $x - 0", "DEF $y = $x / 1"] {
            let prog = opt(src);
            assert_eq!(
                first_init(&prog).node,
                ExprKind::Identifier("$x".into()),
                "{}",
                src
            );
        }
    }

    #[test]
    fn identities_keep_runtime_type_errors() {
        for src in ["DEF $y = TRUE + 0", "DEF $y = \"a\" - 0", "DEF $y = NULL * 1", "DEF $y = (\"a\" + $x) + 0", "DEF $y = ($x == 1) * 1"] {
            let prog = opt(src);
            assert!(
                matches!(first_init(&prog).node, ExprKind::Binary { .. }),
                "{} became {:?}",
                src,
                first_init(&prog)
            );
        }
        let prog = opt("DEF $y = ($x - 2) * 1");
        assert!(matches!(
            first_init(&prog).node,
            ExprKind::Binary { op: BinaryOp::Sub, .. }
        ));
    }

    #[test]
    fn removes_dead_branches_and_loops() {
        let prog = opt("IF FALSE\nSAY 1\nENDIF\nWHILE FALSE\nSAY 2\nENDWHILE\nSAY 3");
        assert_eq!(prog.statements.len(), 1);
        let prog = opt("IF 1 > 2\nSAY 1\nELSE\nSAY 2\nENDIF");
        assert!(matches!(prog.statements[0].node, StmtKind::Command { .. }));
    }

    #[test]
    fn branch_with_declarations_keeps_its_scope() {
        let prog = opt("IF FALSE\nSAY 1\nELSE\nDEF $x = 1\nENDIF");
        assert!(matches!(
            &prog.statements[0].node,
            StmtKind::If { else_branch: None, .. }
        ));
    }

    #[test]
    fn drops_code_after_return() {
        let prog = opt("FUNCTION f()\nRETURN 1\nSAY 2\nENDFUNCTION");
        let StmtKind::FunctionDeclaration(f) = &prog.statements[0].node else {
            panic!("expected function");
        };
        assert_eq!(f.body.len(), 1);
    }

    #[test]
    fn propagates_literal_consts_respecting_shadowing() {
        let prog = opt("CONST $n = 4\nDEF $a = $n * 2\nFUNCTION f($n)\nRETURN $n\nENDFUNCTION");
        let StmtKind::VariableDeclaration { init, .. } = &prog.statements[1].node else {
            panic!("expected declaration");
        };
        assert_eq!(init.as_literal(), Some(&Literal::Int(8)));
        let StmtKind::FunctionDeclaration(f) = &prog.statements[2].node else {
            panic!("expected function");
        };
        assert!(matches!(
            &f.body[0].node,
            StmtKind::Return(Some(Expr { node: ExprKind::Identifier(_), .. }))
        ));
    }

    #[test]
    fn short_circuit_folding() {
        let prog = opt("DEF $x = FALSE && $y");
        assert_eq!(first_init(&prog).as_literal(), Some(&Literal::Bool(false)));
        let prog = opt("DEF $x = 1 || $y");
        assert_eq!(first_init(&prog).as_literal(), Some(&Literal::Bool(true)));
    }

    #[test]
    fn input_is_untouched_and_output_is_stable() {
        let src = "IF TRUE\nSAY (1 + 2)\nENDIF\nDEF $x = ($y + 0) * 1";
        let original = parse_src(src);
        let once = optimize(&original);
        assert_eq!(original, parse_src(src));
        assert_eq!(optimize(&once), once);
    }
}

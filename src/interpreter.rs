//! AST-walking interpreter.

use std::rc::Rc;

use crate::ast::*;
use crate::config::EngineConfig;
use crate::environment::{ScopeError, ScopeKind, ScopeManager};
use crate::error::{DeclarationError, Position, RuntimeError, RuntimeErrorKind};
use crate::native::{NativeError, NativeFunction, NativeRegistry};
use crate::value::{apply_binary, apply_unary, values_equal, EvalResult, FunctionEnv, UserFunction, Value};

/// How a statement finished.
#[derive(Clone, Debug, PartialEq)]
pub enum ExecutionResult {
    /// Fell through, carrying the statement's value.
    Normal(Value),
    Return(Value),
    Break,
    Continue,
}

type ExecResult = Result<ExecutionResult, RuntimeError>;

pub struct Interpreter {
    scopes: ScopeManager,
    natives: NativeRegistry,
    config: EngineConfig,
    call_depth: usize,
}

impl Interpreter {
    pub fn new(natives: NativeRegistry) -> Self {
        Self::with_config(natives, EngineConfig::default())
    }

    pub fn with_config(natives: NativeRegistry, config: EngineConfig) -> Self {
        Self {
            scopes: ScopeManager::new(),
            natives,
            config,
            call_depth: 0,
        }
    }

    pub fn natives(&self) -> &NativeRegistry {
        &self.natives
    }

    pub fn natives_mut(&mut self) -> &mut NativeRegistry {
        &mut self.natives
    }

    pub fn scopes(&self) -> &ScopeManager {
        &self.scopes
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Adds a read-only host variable visible to every script.
    pub fn define_global(&mut self, name: &str, value: Value) -> Result<(), DeclarationError> {
        let global = self.scopes.global();
        self.scopes.define_in(global, name, value, false)
    }

    /// Refreshes a host variable between runs.
    pub fn set_global(&mut self, name: &str, value: Value) -> Result<(), RuntimeError> {
        self.scopes
            .set_global(name, value)
            .map_err(|e| scope_error(e, Position::default()))
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        let global = self.scopes.get(self.scopes.global())?;
        global.binding(name).map(|b| b.value.clone())
    }

    /// Runs a program in a fresh module scope that is discarded afterwards.
    /// Returns the value of the last statement, or the top-level `RETURN`.
    ///
    /// Functions read and update top-level `DEF`s live while the run lasts,
    /// as they would under [`Interpreter::run_in_global`]. A closure kept by
    /// the host past the end of the run no longer sees them.
    pub fn run(&mut self, program: &Program) -> EvalResult {
        self.in_scope(ScopeKind::Module, |this| this.run_top(&program.statements))
    }

    /// Runs a program directly in the global scope, so its declarations
    /// stay visible to later runs. Used by the REPL.
    pub fn run_in_global(&mut self, program: &Program) -> EvalResult {
        let depth = self.scopes.depth();
        let result = self.run_top(&program.statements);
        self.scopes.unwind_to(depth);
        result
    }

    fn run_top(&mut self, stmts: &[Stmt]) -> EvalResult {
        self.call_depth = 0;
        match self.run_stmts(stmts)? {
            ExecutionResult::Normal(v) | ExecutionResult::Return(v) => Ok(v),
            ExecutionResult::Break | ExecutionResult::Continue => Ok(Value::Null),
        }
    }

    /// Runs `f` inside a new child scope and always leaves it again.
    fn in_scope<T>(
        &mut self,
        kind: ScopeKind,
        f: impl FnOnce(&mut Self) -> Result<T, RuntimeError>,
    ) -> Result<T, RuntimeError> {
        let depth = self.scopes.depth();
        self.scopes.push(kind);
        let result = f(self);
        self.scopes.unwind_to(depth);
        result
    }

    fn run_block(&mut self, stmts: &[Stmt]) -> ExecResult {
        self.in_scope(ScopeKind::Block, |this| this.run_stmts(stmts))
    }

    fn run_stmts(&mut self, stmts: &[Stmt]) -> ExecResult {
        let mut last = Value::Null;
        for s in stmts {
            match self.run_stmt(s)? {
                ExecutionResult::Normal(v) => last = v,
                flow => return Ok(flow),
            }
        }
        Ok(ExecutionResult::Normal(last))
    }

    fn run_stmt(&mut self, stmt: &Stmt) -> ExecResult {
        let pos = stmt.span.position();
        match &stmt.node {
            StmtKind::VariableDeclaration {
                name,
                mutable,
                init,
            } => {
                let v = self.eval(init)?;
                self.scopes
                    .define(name, v.clone(), *mutable)
                    .map_err(|e| RuntimeError::new(e, pos))?;
                Ok(ExecutionResult::Normal(v))
            }
            StmtKind::FunctionDeclaration(decl) => {
                let f = UserFunction::new(decl.clone(), FunctionEnv::Live(self.scopes.current()));
                self.scopes
                    .define(&decl.name, Value::Function(f.clone()), false)
                    .map_err(|e| RuntimeError::new(e, pos))?;
                self.scopes.track_function(&f);
                Ok(ExecutionResult::Normal(Value::Null))
            }
            StmtKind::Assignment { name, op, value } => {
                let rhs = self.eval(value)?;
                let new = match op.binary() {
                    None => rhs,
                    Some(bin) => {
                        let current = self.lookup(name, pos)?;
                        apply_binary(bin, &current, &rhs).map_err(|k| RuntimeError::new(k, pos))?
                    }
                };
                self.scopes
                    .assign(name, new.clone())
                    .map_err(|e| scope_error(e, pos))?;
                Ok(ExecutionResult::Normal(new))
            }
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                if self.eval(cond)?.is_truthy() {
                    self.run_block(then_branch)
                } else if let Some(e) = else_branch {
                    self.run_block(e)
                } else {
                    Ok(ExecutionResult::Normal(Value::Null))
                }
            }
            StmtKind::While { cond, body } => {
                let mut last = Value::Null;
                while self.eval(cond)?.is_truthy() {
                    match self.run_block(body)? {
                        ExecutionResult::Normal(v) => last = v,
                        ExecutionResult::Break => break,
                        ExecutionResult::Continue => continue,
                        ret @ ExecutionResult::Return(_) => return Ok(ret),
                    }
                }
                Ok(ExecutionResult::Normal(last))
            }
            StmtKind::Repeat { count, body } => {
                let n = self.repeat_count(count)?;
                let mut last = Value::Null;
                for _ in 0..n {
                    match self.run_block(body)? {
                        ExecutionResult::Normal(v) => last = v,
                        ExecutionResult::Break => break,
                        ExecutionResult::Continue => continue,
                        ret @ ExecutionResult::Return(_) => return Ok(ret),
                    }
                }
                Ok(ExecutionResult::Normal(last))
            }
            StmtKind::Switch {
                subject,
                cases,
                default,
            } => {
                let v = self.eval(subject)?;
                for case in cases {
                    let label = self.eval(&case.value)?;
                    if values_equal(&v, &label) {
                        return self.run_block(&case.body);
                    }
                }
                match default {
                    Some(d) => self.run_block(d),
                    None => Ok(ExecutionResult::Normal(Value::Null)),
                }
            }
            StmtKind::TryCatch {
                body,
                error_var,
                handler,
            } => match self.run_block(body) {
                Ok(flow) => Ok(flow),
                Err(err) => self.in_scope(ScopeKind::Block, |this| {
                    this.scopes
                        .define(error_var, Value::Error(Rc::new(err)), true)
                        .map_err(|e| RuntimeError::new(e, pos))?;
                    this.run_stmts(handler)
                }),
            },
            StmtKind::Return(e) => {
                let v = match e {
                    Some(e) => self.eval(e)?,
                    None => Value::Null,
                };
                Ok(ExecutionResult::Return(v))
            }
            StmtKind::Break => Ok(ExecutionResult::Break),
            StmtKind::Continue => Ok(ExecutionResult::Continue),
            StmtKind::Command { name, args } => {
                self.call_named(name, args, pos)?;
                Ok(ExecutionResult::Normal(Value::Null))
            }
            StmtKind::Expression(e) => Ok(ExecutionResult::Normal(self.eval(e)?)),
        }
    }

    fn repeat_count(&mut self, count: &Expr) -> Result<u64, RuntimeError> {
        let pos = count.span.position();
        let invalid = |msg: String| RuntimeError::new(RuntimeErrorKind::InvalidRepeatCount(msg), pos);
        match self.eval(count)? {
            Value::Int(n) if n >= 0 => Ok(n as u64),
            Value::Int(n) => Err(invalid(format!("count must not be negative, got {}", n))),
            Value::Float(f) if f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64 => Ok(f as u64),
            Value::Float(f) => Err(invalid(format!("count must be a whole number >= 0, got {}", f))),
            other => Err(invalid(format!("expected a number, got {}", other.type_name()))),
        }
    }

    fn lookup(&mut self, name: &str, pos: Position) -> EvalResult {
        self.scopes
            .resolve(name)
            .ok_or_else(|| RuntimeError::new(RuntimeErrorKind::UndefinedVariable(name.to_string()), pos))
    }

    pub fn eval(&mut self, expr: &Expr) -> EvalResult {
        let pos = expr.span.position();
        match &expr.node {
            ExprKind::Literal(lit) => Ok(Value::from(lit)),
            ExprKind::Identifier(name) => self.lookup(name, pos),
            ExprKind::Unary { op, operand } => {
                let v = self.eval(operand)?;
                apply_unary(*op, &v).map_err(|k| RuntimeError::new(k, pos))
            }
            ExprKind::Binary { op, left, right } => {
                let l = self.eval(left)?;
                match op {
                    BinaryOp::And if !l.is_truthy() => Ok(Value::Bool(false)),
                    BinaryOp::Or if l.is_truthy() => Ok(Value::Bool(true)),
                    BinaryOp::And | BinaryOp::Or => Ok(Value::Bool(self.eval(right)?.is_truthy())),
                    _ => {
                        let r = self.eval(right)?;
                        apply_binary(*op, &l, &r).map_err(|k| RuntimeError::new(k, pos))
                    }
                }
            }
            ExprKind::Call { callee, args } => match &callee.node {
                ExprKind::Identifier(name) => self.call_named(name, args, pos),
                _ => {
                    let f = self.eval(callee)?;
                    let argv = self.eval_args(args)?;
                    self.call_value(&f, argv, pos)
                }
            },
        }
    }

    fn eval_args(&mut self, args: &[Expr]) -> Result<Vec<Value>, RuntimeError> {
        args.iter().map(|a| self.eval(a)).collect()
    }

    /// Scope bindings win over natives of the same name.
    fn call_named(&mut self, name: &str, args: &[Expr], pos: Position) -> EvalResult {
        if let Some(f) = self.scopes.resolve(name) {
            let argv = self.eval_args(args)?;
            return self.call_value(&f, argv, pos);
        }
        let Some(native) = self.natives.get(name).cloned() else {
            return Err(RuntimeError::new(
                RuntimeErrorKind::UndefinedVariable(name.to_string()),
                pos,
            ));
        };
        let argv = self.eval_args(args)?;
        self.call_native(&native, &argv, pos)
    }

    fn call_native(&mut self, native: &NativeFunction, args: &[Value], pos: Position) -> EvalResult {
        if !native.arity.accepts(args.len()) {
            return Err(RuntimeError::new(
                RuntimeErrorKind::ArityError {
                    callee: native.name.clone(),
                    expected: native.arity.to_string(),
                    actual: args.len(),
                },
                pos,
            ));
        }
        native.call(args).map_err(|e| {
            let kind = match e {
                NativeError::Failed(message) => RuntimeErrorKind::Native {
                    function: native.name.clone(),
                    message,
                },
                NativeError::Halt(reason) => RuntimeErrorKind::Halted {
                    function: native.name.clone(),
                    reason,
                },
            };
            RuntimeError::new(kind, pos)
        })
    }

    /// Calls a function value with already evaluated arguments. Hosts can
    /// use this to invoke script callbacks.
    pub fn call_value(&mut self, callee: &Value, args: Vec<Value>, pos: Position) -> EvalResult {
        let Value::Function(func) = callee else {
            return Err(RuntimeError::new(
                RuntimeErrorKind::NotCallable(callee.type_name().to_string()),
                pos,
            ));
        };
        if args.len() != func.arity() {
            return Err(RuntimeError::new(
                RuntimeErrorKind::ArityError {
                    callee: func.name().to_string(),
                    expected: func.arity().to_string(),
                    actual: args.len(),
                },
                pos,
            ));
        }
        if self.call_depth >= self.config.max_call_depth {
            return Err(RuntimeError::new(
                RuntimeErrorKind::StackOverflow {
                    limit: self.config.max_call_depth,
                },
                pos,
            ));
        }

        let depth = self.scopes.depth();
        self.scopes.push_call(func).map_err(|e| scope_error(e, pos))?;
        self.call_depth += 1;
        let result = self.run_call(func, args, pos);
        self.call_depth -= 1;
        self.scopes.unwind_to(depth);
        result
    }

    fn run_call(&mut self, func: &Rc<UserFunction>, args: Vec<Value>, pos: Position) -> EvalResult {
        for (param, arg) in func.decl.params.iter().zip(args) {
            self.scopes
                .define(param, arg, true)
                .map_err(|e| RuntimeError::new(e, pos))?;
        }
        match self.run_stmts(&func.decl.body)? {
            ExecutionResult::Return(v) => Ok(v),
            _ => Ok(Value::Null),
        }
    }
}

fn scope_error(e: ScopeError, pos: Position) -> RuntimeError {
    let kind = match e {
        ScopeError::Undefined(name) => RuntimeErrorKind::UndefinedVariable(name),
        ScopeError::Immutable(name) => RuntimeErrorKind::ImmutableBinding(name),
        ScopeError::Stale => RuntimeErrorKind::TypeMismatch("function's defining scope is gone".into()),
        ScopeError::Declaration(d) => RuntimeErrorKind::Declaration(d),
    };
    RuntimeError::new(kind, pos)
}

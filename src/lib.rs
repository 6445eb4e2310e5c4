//! BotScript: tokenizer, recovering parser, static analyzer, optimizer and
//! AST-walking interpreter for bot automation scripts.
//!
//! The host registers native functions (`SAY`, `GOTO`, ...) in a
//! [`NativeRegistry`]; scripts call them either as `GOTO(1, 2, 3)` or in
//! command form, `GOTO 1 2 3`.

pub mod analyzer;
pub mod ast;
pub mod config;
pub mod environment;
pub mod error;
pub mod interpreter;
pub mod lexer;
pub mod native;
pub mod optimizer;
pub mod parser;
pub mod value;

pub use ast::{Expr, Program, Stmt};
pub use config::{EngineConfig, Keywords};
pub use error::{BotScriptError, Diagnostic, DiagnosticKind, RuntimeError, RuntimeErrorKind, Severity};
pub use interpreter::{ExecutionResult, Interpreter};
pub use native::{Arity, NativeError, NativeRegistry};
pub use value::Value;

/// Output of the front end: the runnable part of the program plus every
/// diagnostic collected on the way.
#[derive(Clone, Debug)]
pub struct Compiled {
    pub program: Program,
    pub diagnostics: Vec<Diagnostic>,
}

impl Compiled {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.is_error())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| !d.is_error())
    }
}

/// Tokenize, parse, analyze and (if enabled) optimize `source`.
/// Only an unterminated string or block comment stops the pipeline early.
pub fn compile(
    source: &str,
    config: &EngineConfig,
    natives: &NativeRegistry,
) -> Result<Compiled, error::LexicalError> {
    let keywords = Keywords::from(config);
    let tokens = lexer::tokenize_with(source, &keywords)?;
    let (program, mut diagnostics) = parser::Parser::new(tokens, natives)
        .with_max_depth(config.max_nesting_depth)
        .parse();
    diagnostics.extend(analyzer::analyze(&program, natives));
    diagnostics.sort_by_key(|d| (d.line, d.column));
    let program = if config.optimize {
        optimizer::optimize(&program)
    } else {
        program
    };
    Ok(Compiled {
        program,
        diagnostics,
    })
}

/// Result of running a source text: diagnostics from the front end and the
/// outcome of evaluating whatever parsed.
#[derive(Debug)]
pub struct Report {
    pub diagnostics: Vec<Diagnostic>,
    pub result: Result<Value, RuntimeError>,
}

/// Config, natives and interpreter state bundled for hosts.
pub struct Engine {
    interpreter: Interpreter,
    /// Refuse to run programs that produced error diagnostics.
    strict: bool,
}

impl Engine {
    pub fn new(natives: NativeRegistry) -> Self {
        Self::with_config(natives, EngineConfig::default())
    }

    pub fn with_config(natives: NativeRegistry, config: EngineConfig) -> Self {
        Self {
            interpreter: Interpreter::with_config(natives, config),
            strict: false,
        }
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn interpreter(&self) -> &Interpreter {
        &self.interpreter
    }

    pub fn interpreter_mut(&mut self) -> &mut Interpreter {
        &mut self.interpreter
    }

    pub fn compile(&self, source: &str) -> Result<Compiled, error::LexicalError> {
        compile(source, self.interpreter.config(), self.interpreter.natives())
    }

    /// Compiles and runs `source` in a fresh module scope.
    pub fn run_source(&mut self, source: &str) -> Result<Report, BotScriptError> {
        let compiled = self.checked_compile(source)?;
        let result = self.interpreter.run(&compiled.program);
        Ok(Report {
            diagnostics: compiled.diagnostics,
            result,
        })
    }

    /// Like [`Engine::run_source`] but declarations persist between calls.
    pub fn run_in_global(&mut self, source: &str) -> Result<Report, BotScriptError> {
        let compiled = self.checked_compile(source)?;
        let result = self.interpreter.run_in_global(&compiled.program);
        Ok(Report {
            diagnostics: compiled.diagnostics,
            result,
        })
    }

    fn checked_compile(&self, source: &str) -> Result<Compiled, BotScriptError> {
        let compiled = self.compile(source)?;
        if self.strict && compiled.has_errors() {
            return Err(BotScriptError::Diagnostics(compiled.diagnostics));
        }
        Ok(compiled)
    }
}

/// Compiles and runs `source` once with the prelude natives, failing on the
/// first error of any kind.
pub fn run_source(source: &str) -> Result<Value, BotScriptError> {
    let mut engine = Engine::new(NativeRegistry::with_prelude()).strict(true);
    let report = engine.run_source(source)?;
    Ok(report.result?)
}

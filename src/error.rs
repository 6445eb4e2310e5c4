//! Error taxonomy: lexical, syntax, declaration and runtime errors, plus the
//! diagnostics list the front end hands back to the host.

use std::fmt;

/// A 1-based source position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// Which phase produced a diagnostic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiagnosticKind {
    Lexical,
    Syntax,
    Declaration,
    /// Static checks: native arity, repeat counts.
    Validation,
    /// Lints such as possible infinite loops.
    Analysis,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiagnosticKind::Lexical => "lexical",
            DiagnosticKind::Syntax => "syntax",
            DiagnosticKind::Declaration => "declaration",
            DiagnosticKind::Validation => "validation",
            DiagnosticKind::Analysis => "analysis",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("{severity} ({kind}) at {line}:{column}: {message}")]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: DiagnosticKind,
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl Diagnostic {
    pub fn error(kind: DiagnosticKind, pos: Position, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            kind,
            message: message.into(),
            line: pos.line,
            column: pos.column,
        }
    }

    pub fn warning(kind: DiagnosticKind, pos: Position, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            kind,
            message: message.into(),
            line: pos.line,
            column: pos.column,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    pub fn position(&self) -> Position {
        Position::new(self.line, self.column)
    }
}

/// Errors raised by the tokenizer. Only an unterminated string or block
/// comment stops the pass; invalid characters are reported through [`Diagnostic`]s built by
/// the parser from `Invalid` tokens.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum LexicalError {
    #[error("unterminated string starting at {line}:{column}")]
    UnterminatedString { line: usize, column: usize },
    #[error("unterminated block comment starting at {line}:{column}")]
    UnterminatedComment { line: usize, column: usize },
    #[error("invalid character `{lexeme}` at {line}:{column}")]
    InvalidCharacter {
        lexeme: String,
        line: usize,
        column: usize,
    },
}

impl LexicalError {
    pub fn position(&self) -> Position {
        match self {
            LexicalError::UnterminatedString { line, column }
            | LexicalError::UnterminatedComment { line, column }
            | LexicalError::InvalidCharacter { line, column, .. } => Position::new(*line, *column),
        }
    }
}

impl From<LexicalError> for Diagnostic {
    fn from(e: LexicalError) -> Self {
        Diagnostic::error(DiagnosticKind::Lexical, e.position(), e.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum SyntaxErrorKind {
    #[error("unexpected token `{found}`, expected {expected}")]
    UnexpectedToken { found: String, expected: String },
    #[error("unexpected end of input, expected {expected}")]
    UnexpectedEof { expected: String },
    #[error("missing `{terminator}` to close `{opener}` opened at line {line}")]
    MissingTerminator {
        opener: &'static str,
        terminator: &'static str,
        line: usize,
    },
    #[error("malformed declaration: {0}")]
    MalformedDeclaration(String),
    #[error("`{0}` outside of a loop")]
    OutsideLoop(&'static str),
    #[error("invalid assignment target")]
    InvalidAssignmentTarget,
    #[error("invalid token `{0}`")]
    InvalidToken(String),
    #[error("stack overflow: nesting deeper than {limit} levels")]
    StackOverflow { limit: usize },
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("syntax error at {line}:{column}: {kind}")]
pub struct SyntaxError {
    pub kind: SyntaxErrorKind,
    pub line: usize,
    pub column: usize,
}

impl SyntaxError {
    pub fn new(kind: SyntaxErrorKind, pos: Position) -> Self {
        Self {
            kind,
            line: pos.line,
            column: pos.column,
        }
    }
}

impl From<SyntaxError> for Diagnostic {
    fn from(e: SyntaxError) -> Self {
        let kind = match e.kind {
            SyntaxErrorKind::InvalidToken(_) => DiagnosticKind::Lexical,
            _ => DiagnosticKind::Syntax,
        };
        Diagnostic::error(kind, Position::new(e.line, e.column), e.kind.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeclarationError {
    #[error("`{0}` is already defined in this scope")]
    DuplicateVariable(String),
    #[error("duplicate parameter `{name}` in function `{function}`")]
    DuplicateParameter { function: String, name: String },
    #[error("duplicate case label `{0}`")]
    DuplicateCase(String),
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum RuntimeErrorKind {
    #[error("undefined variable `{0}`")]
    UndefinedVariable(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("`{callee}` expects {expected} argument(s), got {actual}")]
    ArityError {
        callee: String,
        expected: String,
        actual: usize,
    },
    #[error("unknown operator `{0}`")]
    UnknownOperator(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("stack overflow: call depth exceeded {limit}")]
    StackOverflow { limit: usize },
    #[error("cannot assign to immutable binding `{0}`")]
    ImmutableBinding(String),
    #[error("invalid repeat count: {0}")]
    InvalidRepeatCount(String),
    #[error("`{0}` is not callable")]
    NotCallable(String),
    #[error(transparent)]
    Declaration(#[from] DeclarationError),
    #[error("native `{function}` failed: {message}")]
    Native { function: String, message: String },
    #[error("halted by `{function}`: {reason}")]
    Halted { function: String, reason: String },
}

impl RuntimeErrorKind {
    /// Stable short name, exposed to scripts through `ERROR_KIND`.
    pub fn name(&self) -> &'static str {
        match self {
            RuntimeErrorKind::UndefinedVariable(_) => "UndefinedVariable",
            RuntimeErrorKind::DivisionByZero => "DivisionByZero",
            RuntimeErrorKind::ArityError { .. } => "ArityError",
            RuntimeErrorKind::UnknownOperator(_) => "UnknownOperator",
            RuntimeErrorKind::TypeMismatch(_) => "TypeMismatch",
            RuntimeErrorKind::StackOverflow { .. } => "StackOverflow",
            RuntimeErrorKind::ImmutableBinding(_) => "ImmutableBinding",
            RuntimeErrorKind::InvalidRepeatCount(_) => "InvalidRepeatCount",
            RuntimeErrorKind::NotCallable(_) => "NotCallable",
            RuntimeErrorKind::Declaration(_) => "DeclarationError",
            RuntimeErrorKind::Native { .. } => "NativeError",
            RuntimeErrorKind::Halted { .. } => "Halted",
        }
    }

    /// True when the failure came from the host rather than the script.
    pub fn is_host_failure(&self) -> bool {
        matches!(
            self,
            RuntimeErrorKind::Native { .. } | RuntimeErrorKind::Halted { .. }
        )
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("runtime error at {line}:{column}: {kind}")]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub line: usize,
    pub column: usize,
}

impl RuntimeError {
    pub fn new(kind: impl Into<RuntimeErrorKind>, pos: Position) -> Self {
        Self {
            kind: kind.into(),
            line: pos.line,
            column: pos.column,
        }
    }

    pub fn position(&self) -> Position {
        Position::new(self.line, self.column)
    }
}

/// Everything that can go wrong between source text and a final value.
#[derive(Debug, thiserror::Error)]
pub enum BotScriptError {
    #[error(transparent)]
    Lexical(#[from] LexicalError),
    #[error("{} error(s) in script:\n{}", count_errors(.0), join_diagnostics(.0))]
    Diagnostics(Vec<Diagnostic>),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

fn count_errors(diags: &[Diagnostic]) -> usize {
    diags.iter().filter(|d| d.is_error()).count()
}

fn join_diagnostics(diags: &[Diagnostic]) -> String {
    diags
        .iter()
        .map(|d| format!("  {}", d))
        .collect::<Vec<_>>()
        .join("\n")
}

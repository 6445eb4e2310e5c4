//! Lexer: source text → positioned token sequence ending in `Eof`.
//!
//! Raw matching is done by a `logos` automaton; positions come from a line
//! index so columns count characters, not bytes.

use std::fmt;

use logos::Logos;

use crate::config::Keywords;
use crate::error::{LexicalError, Position};

#[derive(Clone, Debug, PartialEq)]
pub enum TokenKind {
    // Keywords
    Def,
    Const,
    Function,
    EndFunction,
    Return,
    If,
    ElseIf,
    Else,
    EndIf,
    While,
    EndWhile,
    Repeat,
    EndRepeat,
    Switch,
    Case,
    Default,
    EndSwitch,
    Try,
    Catch,
    EndTry,
    Break,
    Continue,

    // Names
    Identifier,
    /// `$name`
    Variable,

    // Literals
    Integer(i64),
    Float(f64),
    Str(String),
    Boolean(bool),
    Null,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    EqualEqual,
    BangEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    AndAnd,
    OrOr,
    Bang,

    // Delimiters
    LParen,
    RParen,
    Comma,
    Semicolon,
    Colon,

    /// Input no rule matched; kept so every bad spot can be reported.
    Invalid,
    Eof,
}

impl TokenKind {
    /// Keywords that close a block. Statement parsing stops on these.
    pub fn is_block_terminator(&self) -> bool {
        matches!(
            self,
            TokenKind::EndFunction
                | TokenKind::EndIf
                | TokenKind::ElseIf
                | TokenKind::Else
                | TokenKind::EndWhile
                | TokenKind::EndRepeat
                | TokenKind::Case
                | TokenKind::Default
                | TokenKind::EndSwitch
                | TokenKind::Catch
                | TokenKind::EndTry
        )
    }

    pub fn starts_statement(&self) -> bool {
        matches!(
            self,
            TokenKind::Def
                | TokenKind::Const
                | TokenKind::Function
                | TokenKind::Return
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Repeat
                | TokenKind::Switch
                | TokenKind::Try
                | TokenKind::Break
                | TokenKind::Continue
        )
    }

    pub fn is_binary_operator(&self) -> bool {
        matches!(
            self,
            TokenKind::Plus
                | TokenKind::Minus
                | TokenKind::Star
                | TokenKind::Slash
                | TokenKind::Percent
                | TokenKind::EqualEqual
                | TokenKind::BangEqual
                | TokenKind::Less
                | TokenKind::LessEqual
                | TokenKind::Greater
                | TokenKind::GreaterEqual
                | TokenKind::AndAnd
                | TokenKind::OrOr
        )
    }

    pub fn is_assignment(&self) -> bool {
        matches!(
            self,
            TokenKind::Assign
                | TokenKind::PlusAssign
                | TokenKind::MinusAssign
                | TokenKind::StarAssign
                | TokenKind::SlashAssign
        )
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, TokenKind::Eof)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TokenKind::Def => "DEF",
            TokenKind::Const => "CONST",
            TokenKind::Function => "FUNCTION",
            TokenKind::EndFunction => "ENDFUNCTION",
            TokenKind::Return => "RETURN",
            TokenKind::If => "IF",
            TokenKind::ElseIf => "ELSEIF",
            TokenKind::Else => "ELSE",
            TokenKind::EndIf => "ENDIF",
            TokenKind::While => "WHILE",
            TokenKind::EndWhile => "ENDWHILE",
            TokenKind::Repeat => "REPEAT",
            TokenKind::EndRepeat => "ENDREPEAT",
            TokenKind::Switch => "SWITCH",
            TokenKind::Case => "CASE",
            TokenKind::Default => "DEFAULT",
            TokenKind::EndSwitch => "ENDSWITCH",
            TokenKind::Try => "TRY",
            TokenKind::Catch => "CATCH",
            TokenKind::EndTry => "ENDTRY",
            TokenKind::Break => "BREAK",
            TokenKind::Continue => "CONTINUE",
            TokenKind::Identifier => "identifier",
            TokenKind::Variable => "variable",
            TokenKind::Integer(_) => "integer",
            TokenKind::Float(_) => "number",
            TokenKind::Str(_) => "string",
            TokenKind::Boolean(_) => "boolean",
            TokenKind::Null => "NULL",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::Slash => "/",
            TokenKind::Percent => "%",
            TokenKind::Assign => "=",
            TokenKind::PlusAssign => "+=",
            TokenKind::MinusAssign => "-=",
            TokenKind::StarAssign => "*=",
            TokenKind::SlashAssign => "/=",
            TokenKind::EqualEqual => "==",
            TokenKind::BangEqual => "!=",
            TokenKind::Less => "<",
            TokenKind::LessEqual => "<=",
            TokenKind::Greater => ">",
            TokenKind::GreaterEqual => ">=",
            TokenKind::AndAnd => "&&",
            TokenKind::OrOr => "||",
            TokenKind::Bang => "!",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::Comma => ",",
            TokenKind::Semicolon => ";",
            TokenKind::Colon => ":",
            TokenKind::Invalid => "invalid input",
            TokenKind::Eof => "end of input",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Source text of the token, quotes included for strings.
    pub lexeme: String,
    pub line: usize,
    pub column: usize,
}

impl Token {
    pub fn position(&self) -> Position {
        Position::new(self.line, self.column)
    }

    /// Column just past the last character of the lexeme.
    pub fn end_column(&self) -> usize {
        self.column + self.lexeme.chars().count()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
enum RawError {
    #[default]
    Invalid,
    UnterminatedString,
    UnterminatedComment,
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(error = RawError)]
enum RawToken {
    // ===== Skip =====
    #[regex(r"[ \t\r\n\f]+", logos::skip)]
    #[regex(r"//[^\n]*", logos::skip, allow_greedy = true)]
    #[regex(r"#[^\n]*", logos::skip, allow_greedy = true)]
    Trivia,

    #[token("/*", block_comment)]
    BlockComment,

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*")]
    Word,
    #[regex(r"\$[A-Za-z_][A-Za-z0-9_]*")]
    Variable,

    #[regex(r"[0-9]+\.[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Integer(i64),

    #[token("\"", lex_string)]
    #[token("'", lex_string)]
    Str(String),

    // ===== Operators (longest match wins) =====
    #[token("==")]
    EqualEqual,
    #[token("!=")]
    BangEqual,
    #[token("<=")]
    LessEqual,
    #[token(">=")]
    GreaterEqual,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("+=")]
    PlusAssign,
    #[token("-=")]
    MinusAssign,
    #[token("*=")]
    StarAssign,
    #[token("/=")]
    SlashAssign,
    #[token("<")]
    Less,
    #[token(">")]
    Greater,
    #[token("=")]
    Assign,
    #[token("!")]
    Bang,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,

    // ===== Delimiters =====
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(",")]
    Comma,
    #[token(";")]
    Semicolon,
    #[token(":")]
    Colon,
}

fn lex_string(lex: &mut logos::Lexer<RawToken>) -> Result<String, RawError> {
    let quote = if lex.slice() == "'" { '\'' } else { '"' };
    match scan_string(lex.remainder(), quote) {
        Some((text, consumed)) => {
            lex.bump(consumed);
            Ok(text)
        }
        None => Err(RawError::UnterminatedString),
    }
}

/// Skips a `/* ... */` comment. Comments do not nest; the first `*/`
/// closes it.
fn block_comment(lex: &mut logos::Lexer<RawToken>) -> logos::FilterResult<(), RawError> {
    match lex.remainder().find("*/") {
        Some(end) => {
            lex.bump(end + 2);
            logos::FilterResult::Skip
        }
        None => {
            lex.bump(lex.remainder().len());
            logos::FilterResult::Error(RawError::UnterminatedComment)
        }
    }
}

/// Reads a string body up to and including the closing `quote`. Returns the
/// unescaped text and the number of bytes consumed.
fn scan_string(rest: &str, quote: char) -> Option<(String, usize)> {
    let mut out = String::new();
    let mut chars = rest.char_indices();
    while let Some((i, c)) = chars.next() {
        if c == quote {
            return Some((out, i + c.len_utf8()));
        }
        if c != '\\' {
            out.push(c);
            continue;
        }
        let (_, esc) = chars.next()?;
        match esc {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            '0' => out.push('\0'),
            '\\' => out.push('\\'),
            '"' => out.push('"'),
            '\'' => out.push('\''),
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    None
}

/// Byte offset → line/column lookup.
struct LineIndex<'a> {
    src: &'a str,
    line_starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    fn new(src: &'a str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(src.match_indices('\n').map(|(i, _)| i + 1));
        Self { src, line_starts }
    }

    fn position(&self, offset: usize) -> Position {
        let line = self.line_starts.partition_point(|&s| s <= offset);
        let start = self.line_starts[line - 1];
        let column = self.src[start..offset].chars().count() + 1;
        Position::new(line, column)
    }
}

/// Tokenizes with the default keyword table.
pub fn tokenize(source: &str) -> Result<Vec<Token>, LexicalError> {
    tokenize_with(source, &Keywords::default())
}

pub fn tokenize_with(source: &str, keywords: &Keywords) -> Result<Vec<Token>, LexicalError> {
    let index = LineIndex::new(source);
    let mut lexer = RawToken::lexer(source);
    let mut tokens = Vec::new();

    while let Some(result) = lexer.next() {
        let span = lexer.span();
        let lexeme = lexer.slice();
        let pos = index.position(span.start);
        let kind = match result {
            Ok(raw) => classify(raw, lexeme, keywords),
            Err(RawError::Invalid) => TokenKind::Invalid,
            Err(RawError::UnterminatedString) => {
                return Err(LexicalError::UnterminatedString {
                    line: pos.line,
                    column: pos.column,
                });
            }
            Err(RawError::UnterminatedComment) => {
                return Err(LexicalError::UnterminatedComment {
                    line: pos.line,
                    column: pos.column,
                });
            }
        };
        tokens.push(Token {
            kind,
            lexeme: lexeme.to_string(),
            line: pos.line,
            column: pos.column,
        });
    }

    let end = index.position(source.len());
    tokens.push(Token {
        kind: TokenKind::Eof,
        lexeme: String::new(),
        line: end.line,
        column: end.column,
    });
    Ok(tokens)
}

fn classify(raw: RawToken, lexeme: &str, keywords: &Keywords) -> TokenKind {
    match raw {
        RawToken::Trivia | RawToken::BlockComment => TokenKind::Invalid,
        RawToken::Word => keywords.lookup(lexeme).unwrap_or(TokenKind::Identifier),
        RawToken::Variable => TokenKind::Variable,
        RawToken::Float(f) => TokenKind::Float(f),
        RawToken::Integer(i) => TokenKind::Integer(i),
        RawToken::Str(s) => TokenKind::Str(s),
        RawToken::EqualEqual => TokenKind::EqualEqual,
        RawToken::BangEqual => TokenKind::BangEqual,
        RawToken::LessEqual => TokenKind::LessEqual,
        RawToken::GreaterEqual => TokenKind::GreaterEqual,
        RawToken::AndAnd => TokenKind::AndAnd,
        RawToken::OrOr => TokenKind::OrOr,
        RawToken::PlusAssign => TokenKind::PlusAssign,
        RawToken::MinusAssign => TokenKind::MinusAssign,
        RawToken::StarAssign => TokenKind::StarAssign,
        RawToken::SlashAssign => TokenKind::SlashAssign,
        RawToken::Less => TokenKind::Less,
        RawToken::Greater => TokenKind::Greater,
        RawToken::Assign => TokenKind::Assign,
        RawToken::Bang => TokenKind::Bang,
        RawToken::Plus => TokenKind::Plus,
        RawToken::Minus => TokenKind::Minus,
        RawToken::Star => TokenKind::Star,
        RawToken::Slash => TokenKind::Slash,
        RawToken::Percent => TokenKind::Percent,
        RawToken::LParen => TokenKind::LParen,
        RawToken::RParen => TokenKind::RParen,
        RawToken::Comma => TokenKind::Comma,
        RawToken::Semicolon => TokenKind::Semicolon,
        RawToken::Colon => TokenKind::Colon,
    }
}

//! Immutable configuration handed to the pipeline phases.

use std::collections::HashMap;

use crate::lexer::TokenKind;

/// Limits and switches for one engine. Built once, passed by reference.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// User-function call depth before `StackOverflow` is raised.
    pub max_call_depth: usize,
    /// Block/expression nesting the parser accepts.
    pub max_nesting_depth: usize,
    /// Run the optimizer between analysis and evaluation.
    pub optimize: bool,
    pub case_insensitive_keywords: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 128,
            max_nesting_depth: 64,
            optimize: true,
            case_insensitive_keywords: true,
        }
    }
}

/// Reserved words and the token kind each one lexes to.
#[derive(Clone, Debug)]
pub struct Keywords {
    table: HashMap<String, TokenKind>,
    case_insensitive: bool,
}

impl Keywords {
    pub fn new(case_insensitive: bool) -> Self {
        let mut table = HashMap::new();
        let entries: [(&str, TokenKind); 28] = [
            ("DEF", TokenKind::Def),
            ("CONST", TokenKind::Const),
            ("FUNCTION", TokenKind::Function),
            ("ENDFUNCTION", TokenKind::EndFunction),
            ("RETURN", TokenKind::Return),
            ("IF", TokenKind::If),
            ("ELSEIF", TokenKind::ElseIf),
            ("ELSE", TokenKind::Else),
            ("ENDIF", TokenKind::EndIf),
            ("WHILE", TokenKind::While),
            ("ENDWHILE", TokenKind::EndWhile),
            ("REPEAT", TokenKind::Repeat),
            ("ENDREPEAT", TokenKind::EndRepeat),
            ("SWITCH", TokenKind::Switch),
            ("CASE", TokenKind::Case),
            ("DEFAULT", TokenKind::Default),
            ("ENDSWITCH", TokenKind::EndSwitch),
            ("TRY", TokenKind::Try),
            ("CATCH", TokenKind::Catch),
            ("ENDTRY", TokenKind::EndTry),
            ("BREAK", TokenKind::Break),
            ("CONTINUE", TokenKind::Continue),
            ("TRUE", TokenKind::Boolean(true)),
            ("FALSE", TokenKind::Boolean(false)),
            ("NULL", TokenKind::Null),
            ("AND", TokenKind::AndAnd),
            ("OR", TokenKind::OrOr),
            ("NOT", TokenKind::Bang),
        ];
        for (word, kind) in entries {
            table.insert(word.to_string(), kind);
        }
        Self {
            table,
            case_insensitive,
        }
    }

    pub fn lookup(&self, word: &str) -> Option<TokenKind> {
        if self.case_insensitive {
            self.table.get(&word.to_ascii_uppercase()).cloned()
        } else {
            self.table.get(word).cloned()
        }
    }

    pub fn is_case_insensitive(&self) -> bool {
        self.case_insensitive
    }
}

impl Default for Keywords {
    fn default() -> Self {
        Self::new(true)
    }
}

impl From<&EngineConfig> for Keywords {
    fn from(cfg: &EngineConfig) -> Self {
        Keywords::new(cfg.case_insensitive_keywords)
    }
}

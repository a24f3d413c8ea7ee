//! Single-pass Lua lexer used by the expression injection guard.
//!
//! Only the token classes that matter for bracket structure are emitted:
//! brackets, `;`, block keywords, and string/comment spans (with a flag for
//! unterminated ones). Everything else is skipped. The lexing rules for
//! strings, long brackets and comments follow Lua 5.4 so that the guard and
//! the VM agree on where code ends and literal text begins.

use std::fmt;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Open(char),
    Close(char),
    Semicolon,
    /// `function`, `do`, `if`, `repeat`
    BlockOpen,
    /// `end`, `until`
    BlockClose,
    String { terminated: bool },
    Comment { terminated: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub range: Range<usize>,
    pub kind: TokenKind,
}

/// Why the guard refused to embed a snippet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardViolation {
    UnbalancedClose { ch: char, offset: usize },
    MismatchedClose { open: char, close: char, offset: usize },
    UnclosedBracket { ch: char, offset: usize },
    UnterminatedString { offset: usize },
    UnterminatedComment { offset: usize },
    TopLevelSeparator { offset: usize },
}

impl fmt::Display for GuardViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnbalancedClose { ch, offset } => {
                write!(f, "unbalanced '{ch}' at byte {offset}")
            }
            Self::MismatchedClose { open, close, offset } => {
                write!(f, "'{close}' at byte {offset} does not close '{open}'")
            }
            Self::UnclosedBracket { ch, offset } => {
                write!(f, "'{ch}' at byte {offset} is never closed")
            }
            Self::UnterminatedString { offset } => {
                write!(f, "unterminated string starting at byte {offset}")
            }
            Self::UnterminatedComment { offset } => {
                write!(f, "unterminated comment starting at byte {offset}")
            }
            Self::TopLevelSeparator { offset } => {
                write!(f, "statement separator ';' at byte {offset} outside any expression")
            }
        }
    }
}

/// Verify that `input` is one self-contained expression body: every bracket
/// it opens it closes, it never closes a bracket it did not open, and it has
/// no dangling string or comment that could swallow text placed after it.
pub fn check_expression(input: &str) -> Result<(), GuardViolation> {
    let mut brackets: Vec<(char, usize)> = Vec::new();
    let mut blocks = 0usize;

    for token in scan(input) {
        let offset = token.range.start;
        match token.kind {
            TokenKind::Open(ch) => brackets.push((ch, offset)),
            TokenKind::Close(close) => match brackets.pop() {
                Some((open, _)) if closing_for(open) == close => {}
                Some((open, _)) => {
                    return Err(GuardViolation::MismatchedClose { open, close, offset })
                }
                None => return Err(GuardViolation::UnbalancedClose { ch: close, offset }),
            },
            TokenKind::Semicolon => {
                if brackets.is_empty() && blocks == 0 {
                    return Err(GuardViolation::TopLevelSeparator { offset });
                }
            }
            TokenKind::BlockOpen => blocks += 1,
            TokenKind::BlockClose => blocks = blocks.saturating_sub(1),
            TokenKind::String { terminated: false } => {
                return Err(GuardViolation::UnterminatedString { offset })
            }
            TokenKind::Comment { terminated: false } => {
                return Err(GuardViolation::UnterminatedComment { offset })
            }
            TokenKind::String { .. } | TokenKind::Comment { .. } => {}
        }
    }

    if let Some((ch, offset)) = brackets.pop() {
        return Err(GuardViolation::UnclosedBracket { ch, offset });
    }
    Ok(())
}

fn closing_for(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}

/// Tokenize `input` into structural tokens.
pub fn scan(input: &str) -> Vec<Token> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];

        // Comment: -- (long form --[==[ ... ]==])
        if b == b'-' && bytes.get(i + 1) == Some(&b'-') {
            let start = i;
            if let Some(level) = long_bracket_level(bytes, i + 2) {
                let (end, terminated) = find_long_close(bytes, i + 2 + level + 2, level);
                tokens.push(Token { range: start..end, kind: TokenKind::Comment { terminated } });
                i = end;
            } else {
                // Lua ends short comments at either newline byte
                let mut j = i + 2;
                while j < bytes.len() && bytes[j] != b'\n' && bytes[j] != b'\r' {
                    j += 1;
                }
                tokens.push(Token { range: start..j, kind: TokenKind::Comment { terminated: true } });
                i = j;
            }
            continue;
        }

        // Quoted strings
        if b == b'"' || b == b'\'' {
            let start = i;
            let quote = b;
            let mut j = i + 1;
            let mut terminated = false;
            while j < bytes.len() {
                match bytes[j] {
                    b'\\' => j += 2,
                    b'\n' | b'\r' => break,
                    c if c == quote => {
                        terminated = true;
                        j += 1;
                        break;
                    }
                    _ => j += 1,
                }
            }
            let end = j.min(bytes.len());
            tokens.push(Token { range: start..end, kind: TokenKind::String { terminated } });
            i = end;
            continue;
        }

        // Long strings [==[ ... ]==], otherwise a plain bracket
        if b == b'[' {
            if let Some(level) = long_bracket_level(bytes, i) {
                let (end, terminated) = find_long_close(bytes, i + level + 2, level);
                tokens.push(Token { range: i..end, kind: TokenKind::String { terminated } });
                i = end;
            } else {
                tokens.push(Token { range: i..i + 1, kind: TokenKind::Open('[') });
                i += 1;
            }
            continue;
        }

        match b {
            b'(' | b'{' => {
                tokens.push(Token { range: i..i + 1, kind: TokenKind::Open(b as char) });
                i += 1;
            }
            b')' | b']' | b'}' => {
                tokens.push(Token { range: i..i + 1, kind: TokenKind::Close(b as char) });
                i += 1;
            }
            b';' => {
                tokens.push(Token { range: i..i + 1, kind: TokenKind::Semicolon });
                i += 1;
            }
            c if c.is_ascii_alphanumeric() || c == b'_' => {
                // Words: identifiers, keywords, and numeric literals all lex as one run
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                match &input[start..i] {
                    "function" | "do" | "if" | "repeat" => {
                        tokens.push(Token { range: start..i, kind: TokenKind::BlockOpen })
                    }
                    "end" | "until" => {
                        tokens.push(Token { range: start..i, kind: TokenKind::BlockClose })
                    }
                    _ => {}
                }
            }
            _ => i += 1,
        }
    }

    tokens
}

/// If a long bracket `[=*[` opens at `pos`, return its level (number of `=`).
fn long_bracket_level(bytes: &[u8], pos: usize) -> Option<usize> {
    if bytes.get(pos) != Some(&b'[') {
        return None;
    }
    let mut level = 0;
    loop {
        match bytes.get(pos + 1 + level) {
            Some(b'=') => level += 1,
            Some(b'[') => return Some(level),
            _ => return None,
        }
    }
}

/// Find the `]=*]` closing a long bracket of `level`, scanning from `from`.
/// Returns the byte after the close, or (len, false) if it never closes.
fn find_long_close(bytes: &[u8], from: usize, level: usize) -> (usize, bool) {
    let mut j = from;
    while j < bytes.len() {
        if bytes[j] == b']' {
            let mut eq = 0;
            while bytes.get(j + 1 + eq) == Some(&b'=') {
                eq += 1;
            }
            if eq == level && bytes.get(j + 1 + eq) == Some(&b']') {
                return (j + eq + 2, true);
            }
        }
        j += 1;
    }
    (bytes.len(), false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        scan(input).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_brackets_and_separator() {
        assert_eq!(
            kinds("f(a[1], {2}); x"),
            vec![
                TokenKind::Open('('),
                TokenKind::Open('['),
                TokenKind::Close(']'),
                TokenKind::Open('{'),
                TokenKind::Close('}'),
                TokenKind::Close(')'),
                TokenKind::Semicolon,
            ]
        );
    }

    #[test]
    fn test_brackets_inside_strings_are_text() {
        assert_eq!(kinds(r#"")" .. '(' "#), vec![
            TokenKind::String { terminated: true },
            TokenKind::String { terminated: true },
        ]);
        assert_eq!(kinds(r#""a\")""#), vec![TokenKind::String { terminated: true }]);
    }

    #[test]
    fn test_long_strings_and_levels() {
        assert_eq!(kinds("[[ ) ]]"), vec![TokenKind::String { terminated: true }]);
        assert_eq!(kinds("[==[ ]] ) ]==]"), vec![TokenKind::String { terminated: true }]);
        assert_eq!(kinds("[=[ ]] "), vec![TokenKind::String { terminated: false }]);
    }

    #[test]
    fn test_comments() {
        assert_eq!(kinds("1 -- )"), vec![TokenKind::Comment { terminated: true }]);
        assert_eq!(kinds("1 --[[ ) ]] + 2"), vec![TokenKind::Comment { terminated: true }]);
        assert_eq!(kinds("1 --[[ )"), vec![TokenKind::Comment { terminated: false }]);
        // `--[=` without a second `[` is a short comment
        assert_eq!(kinds("--[= x\n)"), vec![
            TokenKind::Comment { terminated: true },
            TokenKind::Close(')'),
        ]);
    }

    #[test]
    fn test_carriage_return_ends_short_comment() {
        assert_eq!(kinds("1 --\r)"), vec![
            TokenKind::Comment { terminated: true },
            TokenKind::Close(')'),
        ]);
    }

    #[test]
    fn test_newline_ends_quoted_string() {
        assert_eq!(kinds("'abc\n)"), vec![
            TokenKind::String { terminated: false },
            TokenKind::Close(')'),
        ]);
    }

    #[test]
    fn test_block_keywords() {
        assert_eq!(kinds("function() return 1 end"), vec![
            TokenKind::BlockOpen,
            TokenKind::Open('('),
            TokenKind::Close(')'),
            TokenKind::BlockClose,
        ]);
        // keyword-looking substrings are not keywords
        assert!(kinds("ending + doing + iffy").is_empty());
    }

    #[test]
    fn test_guard_accepts_expressions() {
        assert!(check_expression("1 + 1").is_ok());
        assert!(check_expression("data.scores[1] * (2 + 3)").is_ok());
        assert!(check_expression("{ a = 1, b = { 2, 3 } }").is_ok());
        assert!(check_expression("\")\" .. '('").is_ok());
        assert!(check_expression("1 -- trailing comment )").is_ok());
        assert!(check_expression("function() local a = 1; return a end").is_ok());
    }

    #[test]
    fn test_guard_rejections() {
        assert_eq!(
            check_expression("1) os.exit() --"),
            Err(GuardViolation::UnbalancedClose { ch: ')', offset: 1 })
        );
        assert_eq!(
            check_expression("(1]"),
            Err(GuardViolation::MismatchedClose { open: '(', close: ']', offset: 2 })
        );
        assert_eq!(
            check_expression("f(1"),
            Err(GuardViolation::UnclosedBracket { ch: '(', offset: 1 })
        );
        assert_eq!(
            check_expression("\"abc"),
            Err(GuardViolation::UnterminatedString { offset: 0 })
        );
        assert_eq!(
            check_expression("1 --[[ "),
            Err(GuardViolation::UnterminatedComment { offset: 2 })
        );
        assert_eq!(
            check_expression("1; x = 2"),
            Err(GuardViolation::TopLevelSeparator { offset: 1 })
        );
    }
}

// self-correct-rs/src/structural.rs
// Cheapest verification level: the artifact must have content and, when it
// reads as source code, its brackets must balance.

use shared_types::{Artifact, Diagnosis, DiagnosisLevel, PolicyCheckResult, Severity};

pub const STRUCTURAL_PRINCIPLE: &str = "structural";

/// Lexical family used to skip literals and comments while scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syntax {
    /// `//` and `/* */` comments, `"` strings, `'x'` char literals and lifetimes.
    CFamily,
    /// `#` comments, `'` and `"` strings, triple-quoted blocks.
    Hash,
}

const C_FAMILY_PREFIXES: &[&str] = &[
    "fn ", "pub ", "use ", "impl ", "struct ", "enum ", "trait ", "mod ", "let ", "const ",
    "static ", "function ", "func ", "package ", "interface ", "export ", "#include", "#[",
];

const HASH_PREFIXES: &[&str] = &["def ", "async def ", "import ", "elif ", "#!"];

/// Returns a STRUCTURAL diagnosis when the artifact is malformed.
pub fn structural_check(artifact: &Artifact) -> Option<Diagnosis> {
    let problem = if artifact.content.trim().is_empty() {
        Some("artifact is empty".to_string())
    } else {
        detect_syntax(&artifact.content)
            .and_then(|syntax| unbalanced_delimiter(&artifact.content, syntax))
    };

    problem.map(|message| {
        Diagnosis::new(
            DiagnosisLevel::Structural,
            vec![PolicyCheckResult::fail(STRUCTURAL_PRINCIPLE, Severity::High, message)],
        )
    })
}

/// Guesses whether `content` is source code, and of which family.
/// Prose and configuration text yield `None`.
pub fn detect_syntax(content: &str) -> Option<Syntax> {
    let mut c_family = 0usize;
    let mut hash = 0usize;

    for line in content.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        if HASH_PREFIXES.iter().any(|p| line.starts_with(p))
            || (line.starts_with("from ") && line.contains(" import "))
            || (line.starts_with("class ") && line.ends_with(':'))
        {
            hash += 1;
        }
        if C_FAMILY_PREFIXES.iter().any(|p| line.starts_with(p))
            || line.ends_with('{')
            || line.ends_with(';')
        {
            c_family += 1;
        }
    }

    match (c_family, hash) {
        (0, 0) => None,
        (c, h) if h > c => Some(Syntax::Hash),
        _ => Some(Syntax::CFamily),
    }
}

/// Lexer position between characters.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Code,
    Str(char),
    TripleStr(char),
    BlockComment,
}

/// First delimiter problem in `content`, skipping literals and comments
/// according to `syntax`.
pub fn unbalanced_delimiter(content: &str, syntax: Syntax) -> Option<String> {
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut mode = Mode::Code;

    for (line_no, line) in content.lines().enumerate() {
        let line_no = line_no + 1;
        let chars: Vec<char> = line.chars().collect();
        // Single-quoted forms never span lines.
        if matches!(mode, Mode::Str('\'')) || (syntax == Syntax::Hash && mode == Mode::Str('"')) {
            mode = Mode::Code;
        }

        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            match mode {
                Mode::Str(quote) => {
                    if c == '\\' {
                        i += 1;
                    } else if c == quote {
                        mode = Mode::Code;
                    }
                    i += 1;
                    continue;
                }
                Mode::TripleStr(quote) => {
                    if c == '\\' {
                        i += 1;
                    } else if chars[i..].starts_with(&[quote, quote, quote]) {
                        mode = Mode::Code;
                        i += 2;
                    }
                    i += 1;
                    continue;
                }
                Mode::BlockComment => {
                    if c == '*' && chars.get(i + 1) == Some(&'/') {
                        mode = Mode::Code;
                        i += 1;
                    }
                    i += 1;
                    continue;
                }
                Mode::Code => {}
            }

            match (syntax, c) {
                (Syntax::CFamily, '/') if chars.get(i + 1) == Some(&'/') => break,
                (Syntax::CFamily, '/') if chars.get(i + 1) == Some(&'*') => {
                    mode = Mode::BlockComment;
                    i += 1;
                }
                (Syntax::CFamily, '"') => mode = Mode::Str('"'),
                (Syntax::CFamily, '\'') => i = skip_c_quote(&chars, i),
                (Syntax::Hash, '#') => break,
                (Syntax::Hash, '"' | '\'') => {
                    if chars[i..].starts_with(&[c, c, c]) {
                        mode = Mode::TripleStr(c);
                        i += 2;
                    } else {
                        mode = Mode::Str(c);
                    }
                }
                (_, '(' | '[' | '{') => stack.push((c, line_no)),
                (_, ')' | ']' | '}') => {
                    let expected = match c {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    match stack.pop() {
                        Some((open, _)) if open == expected => {}
                        Some((open, opened_at)) => {
                            return Some(format!(
                                "'{c}' on line {line_no} closes '{open}' opened on line {opened_at}"
                            ))
                        }
                        None => return Some(format!("unmatched '{c}' on line {line_no}")),
                    }
                }
                _ => {}
            }
            i += 1;
        }
    }

    stack
        .pop()
        .map(|(open, line_no)| format!("'{open}' opened on line {line_no} is never closed"))
}

/// Index of the last character consumed by a `'` in C-family code: a char
/// literal (`'{'`, `'\n'`), a quoted word (`'abc'`), or a lifetime/label
/// (`'a`), which consumes only the quote.
fn skip_c_quote(chars: &[char], start: usize) -> usize {
    let closing = |from: usize| {
        chars
            .get(from..)
            .and_then(|rest| rest.iter().position(|&ch| ch == '\''))
            .map(|offset| from + offset)
    };

    match chars.get(start + 1) {
        Some('\\') => closing(start + 3).unwrap_or(start),
        Some(_) if chars.get(start + 2) == Some(&'\'') => start + 2,
        Some(ch) if ch.is_alphanumeric() || *ch == '_' => {
            let mut end = start + 1;
            while chars.get(end).map_or(false, |ch| ch.is_alphanumeric() || *ch == '_') {
                end += 1;
            }
            if chars.get(end) == Some(&'\'') {
                end
            } else {
                start
            }
        }
        Some(_) => closing(start + 1).unwrap_or(start),
        None => start,
    }
}

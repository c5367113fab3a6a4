//! Dependency extraction from transformed module content.
//!
//! JS-like content goes through a char scanner that understands comments, string,
//! regex and template literals (including `${...}` substitutions) well enough to
//! find:
//!
//! - `import ... from "x"` / `import "x"`
//! - `export ... from "x"`
//! - `import("x")`
//! - `require("x")`
//!
//! CSS content is scanned for `@import` rules. This is not a parser: it only
//! needs to be right about where specifiers are.

use regex_lite::Regex;
use serde::Serialize;
use std::sync::OnceLock;

/// How a dependency was referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DependencyKind {
    Import,
    ExportFrom,
    Require,
    DynamicImport,
    CssImport,
}

impl DependencyKind {
    /// Static edges are followed when building entry chunks under splitting.
    #[must_use]
    pub fn is_static(self) -> bool {
        !matches!(self, Self::DynamicImport)
    }
}

/// A dependency specifier found in module content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencySpec {
    pub specifier: String,
    pub kind: DependencyKind,
    /// 1-based line of the specifier.
    pub line: u32,
}

/// Extraction failure with the position where scanning gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanError {
    pub message: String,
    pub line: u32,
    pub column: u32,
}

/// Extract dependency specifiers from JS-like content.
///
/// Specifiers are returned in source order and deduplicated. When a specifier
/// appears both statically and dynamically, the static kind wins.
pub fn scan_js(source: &str) -> Result<Vec<DependencySpec>, ScanError> {
    let mut scanner = Scanner::new(source);
    let mut found = Vec::new();
    scanner.scan_code(&mut found, false)?;
    Ok(dedupe(found))
}

/// Keywords after which `/` starts a regex literal rather than a division.
const REGEX_PREFIX_KEYWORDS: &[&str] = &[
    "return", "typeof", "instanceof", "in", "of", "new", "delete", "void", "throw", "case",
    "do", "else", "yield", "await",
];

/// Extract `@import` specifiers from CSS content. Remote and data URLs are kept
/// out of the graph.
pub fn scan_css(source: &str) -> Result<Vec<DependencySpec>, ScanError> {
    static IMPORT: OnceLock<Regex> = OnceLock::new();
    let re = IMPORT.get_or_init(|| {
        Regex::new(r#"@import\s+(?:url\(\s*)?(?:"([^"]*)"|'([^']*)'|([^"'\s;)]+))"#)
            .unwrap_or_else(|e| unreachable!("static regex: {e}"))
    });

    let stripped = strip_css_comments(source)?;
    let mut found = Vec::new();
    for caps in re.captures_iter(&stripped) {
        let Some(spec) = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)) else {
            continue;
        };
        let specifier = spec.as_str().trim();
        if specifier.is_empty() || is_remote(specifier) {
            continue;
        }
        let line = stripped[..spec.start()].matches('\n').count() as u32 + 1;
        found.push(DependencySpec {
            specifier: specifier.to_string(),
            kind: DependencyKind::CssImport,
            line,
        });
    }
    Ok(dedupe(found))
}

fn is_remote(spec: &str) -> bool {
    spec.starts_with("http://")
        || spec.starts_with("https://")
        || spec.starts_with("//")
        || spec.starts_with("data:")
}

/// Replace comment bodies with spaces, keeping newlines so line numbers hold.
fn strip_css_comments(source: &str) -> Result<String, ScanError> {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    let mut line = 1u32;
    while let Some(start) = rest.find("/*") {
        out.push_str(&rest[..start]);
        line += rest[..start].matches('\n').count() as u32;
        let after = &rest[start + 2..];
        let Some(end) = after.find("*/") else {
            return Err(ScanError {
                message: "unterminated comment".to_string(),
                line,
                column: 1,
            });
        };
        let comment = &after[..end];
        out.push_str("  ");
        for ch in comment.chars() {
            out.push(if ch == '\n' { '\n' } else { ' ' });
        }
        out.push_str("  ");
        line += comment.matches('\n').count() as u32;
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn dedupe(found: Vec<DependencySpec>) -> Vec<DependencySpec> {
    let mut out: Vec<DependencySpec> = Vec::with_capacity(found.len());
    for dep in found {
        if let Some(existing) = out.iter_mut().find(|d| d.specifier == dep.specifier) {
            if !existing.kind.is_static() && dep.kind.is_static() {
                existing.kind = dep.kind;
            }
            continue;
        }
        out.push(dep);
    }
    out
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

struct Scanner {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
}

#[derive(Clone, Copy)]
struct Mark {
    pos: usize,
    line: u32,
    column: u32,
}

impl Scanner {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) {
        if let Some(c) = self.peek() {
            self.pos += 1;
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
    }

    fn mark(&self) -> Mark {
        Mark {
            pos: self.pos,
            line: self.line,
            column: self.column,
        }
    }

    fn reset(&mut self, mark: Mark) {
        self.pos = mark.pos;
        self.line = mark.line;
        self.column = mark.column;
    }

    /// Scan code for dependencies. With `in_substitution`, stop after the `}`
    /// closing a template `${`.
    fn scan_code(
        &mut self,
        found: &mut Vec<DependencySpec>,
        in_substitution: bool,
    ) -> Result<(), ScanError> {
        let mut depth = 0usize;
        while let Some(c) = self.peek() {
            match c {
                '/' if self.peek_at(1) == Some('/') => self.skip_line_comment(),
                '/' if self.peek_at(1) == Some('*') => self.skip_block_comment()?,
                '/' if self.regex_allowed() => self.skip_regex(),
                // A broken literal outside an import clause is rescanned from
                // the character after its opening quote.
                '"' | '\'' => {
                    let mark = self.mark();
                    if self.read_string().is_err() {
                        self.reset(mark);
                        self.bump();
                    }
                }
                '`' => {
                    let mark = self.mark();
                    if self.scan_template(found).is_err() {
                        self.reset(mark);
                        self.bump();
                    }
                }
                '{' if in_substitution => {
                    depth += 1;
                    self.bump();
                }
                '}' if in_substitution => {
                    self.bump();
                    if depth == 0 {
                        return Ok(());
                    }
                    depth -= 1;
                }
                c if is_ident_start(c) => {
                    let boundary = self.at_word_boundary();
                    let word = self.read_word();
                    if !boundary {
                        continue;
                    }
                    match word.as_str() {
                        "import" => self.scan_import(found)?,
                        "export" => self.scan_export(found)?,
                        "require" => self.scan_call(DependencyKind::Require, found)?,
                        _ => {}
                    }
                }
                _ => self.bump(),
            }
        }
        Ok(())
    }

    /// Whether a `/` at the cursor begins a regex literal, judged by the
    /// previous significant token.
    fn regex_allowed(&self) -> bool {
        let mut end = self.pos;
        while end > 0 && self.chars[end - 1].is_whitespace() {
            end -= 1;
        }
        let Some(&prev) = end.checked_sub(1).and_then(|p| self.chars.get(p)) else {
            return true;
        };
        if is_ident_char(prev) {
            let mut start = end;
            while start > 0 && is_ident_char(self.chars[start - 1]) {
                start -= 1;
            }
            let word: String = self.chars[start..end].iter().collect();
            return REGEX_PREFIX_KEYWORDS.contains(&word.as_str());
        }
        !matches!(prev, ')' | ']' | '"' | '\'' | '`')
    }

    /// Skip `/body/flags`. A `/` inside a `[...]` class does not close it. If
    /// the line ends first this was not a regex; only the slash is consumed.
    fn skip_regex(&mut self) {
        let start = self.mark();
        self.bump();
        let mut in_class = false;
        while let Some(c) = self.peek() {
            match c {
                '\n' => break,
                '\\' => {
                    self.bump();
                    if self.peek().is_some_and(|c| c != '\n') {
                        self.bump();
                    }
                }
                '[' => {
                    in_class = true;
                    self.bump();
                }
                ']' => {
                    in_class = false;
                    self.bump();
                }
                '/' if !in_class => {
                    self.bump();
                    while self.peek().is_some_and(is_ident_char) {
                        self.bump();
                    }
                    return;
                }
                _ => self.bump(),
            }
        }
        self.reset(start);
        self.bump();
    }

    fn error(&self, message: &str) -> ScanError {
        ScanError {
            message: message.to_string(),
            line: self.line,
            column: self.column,
        }
    }

    /// `foo.import` and `myrequire` are not keywords.
    fn at_word_boundary(&self) -> bool {
        match self.pos.checked_sub(1).and_then(|p| self.chars.get(p)) {
            Some(&prev) => !is_ident_char(prev) && prev != '.',
            None => true,
        }
    }

    fn read_word(&mut self) -> String {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_char) {
            self.bump();
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => self.bump(),
                Some('/') if self.peek_at(1) == Some('/') => self.skip_line_comment(),
                Some('/') if self.peek_at(1) == Some('*') => {
                    if self.skip_block_comment().is_err() {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    fn skip_line_comment(&mut self) {
        while self.peek().is_some_and(|c| c != '\n') {
            self.bump();
        }
    }

    fn skip_block_comment(&mut self) -> Result<(), ScanError> {
        let start = self.error("unterminated block comment");
        self.bump();
        self.bump();
        while let Some(c) = self.peek() {
            if c == '*' && self.peek_at(1) == Some('/') {
                self.bump();
                self.bump();
                return Ok(());
            }
            self.bump();
        }
        Err(start)
    }

    /// Read a quoted string literal at the cursor, returning its contents.
    fn read_string(&mut self) -> Result<String, ScanError> {
        let start = self.error("unterminated string literal");
        let Some(quote) = self.peek() else {
            return Err(start);
        };
        self.bump();
        let mut value = String::new();
        while let Some(c) = self.peek() {
            match c {
                '\\' => {
                    self.bump();
                    if let Some(escaped) = self.peek() {
                        value.push(escaped);
                        self.bump();
                    }
                }
                '\n' => return Err(start),
                c if c == quote => {
                    self.bump();
                    return Ok(value);
                }
                c => {
                    value.push(c);
                    self.bump();
                }
            }
        }
        Err(start)
    }

    /// Skip template text; `${...}` substitutions are scanned as code.
    fn scan_template(&mut self, found: &mut Vec<DependencySpec>) -> Result<(), ScanError> {
        let start = self.error("unterminated template literal");
        self.bump();
        while let Some(c) = self.peek() {
            match c {
                '\\' => {
                    self.bump();
                    self.bump();
                }
                '`' => {
                    self.bump();
                    return Ok(());
                }
                '$' if self.peek_at(1) == Some('{') => {
                    self.bump();
                    self.bump();
                    self.scan_code(found, true)?;
                }
                _ => self.bump(),
            }
        }
        Err(start)
    }

    fn at_quote(&self) -> bool {
        matches!(self.peek(), Some('"' | '\''))
    }

    fn push(&self, found: &mut Vec<DependencySpec>, specifier: String, kind: DependencyKind, line: u32) {
        if !specifier.is_empty() {
            found.push(DependencySpec {
                specifier,
                kind,
                line,
            });
        }
    }

    /// After `import`: side-effect import, dynamic import, or `import ... from`.
    fn scan_import(&mut self, found: &mut Vec<DependencySpec>) -> Result<(), ScanError> {
        self.skip_whitespace();
        match self.peek() {
            Some('(') => self.scan_call(DependencyKind::DynamicImport, found),
            Some('.') => Ok(()), // import.meta
            Some('"' | '\'') => {
                let line = self.line;
                let spec = self.read_string()?;
                self.push(found, spec, DependencyKind::Import, line);
                Ok(())
            }
            _ => self.scan_from_clause(DependencyKind::Import, found),
        }
    }

    /// After `export`: only `export ... from "x"` carries a dependency.
    fn scan_export(&mut self, found: &mut Vec<DependencySpec>) -> Result<(), ScanError> {
        self.skip_whitespace();
        match self.peek() {
            Some('*' | '{') => self.scan_from_clause(DependencyKind::ExportFrom, found),
            _ => Ok(()),
        }
    }

    /// Walk an import/export clause up to `from "x"`. Gives up at `;` or at a
    /// token that cannot belong to a clause.
    fn scan_from_clause(
        &mut self,
        kind: DependencyKind,
        found: &mut Vec<DependencySpec>,
    ) -> Result<(), ScanError> {
        let mut depth = 0usize;
        loop {
            self.skip_whitespace();
            let Some(c) = self.peek() else {
                return Ok(());
            };
            match c {
                '{' => {
                    depth += 1;
                    self.bump();
                }
                '}' => {
                    depth = depth.saturating_sub(1);
                    self.bump();
                }
                ';' if depth == 0 => return Ok(()),
                '"' | '\'' if depth > 0 => {
                    // `import { "string name" as x }`
                    self.read_string()?;
                }
                c if is_ident_start(c) => {
                    let word = self.read_word();
                    if word == "from" && depth == 0 {
                        self.skip_whitespace();
                        if !self.at_quote() {
                            return Ok(());
                        }
                        let line = self.line;
                        let spec = self.read_string()?;
                        self.push(found, spec, kind, line);
                        return Ok(());
                    }
                }
                ',' | '*' => self.bump(),
                _ if depth > 0 => self.bump(),
                _ => return Ok(()),
            }
        }
    }

    /// `(` "x" `)` after `import` or `require`. Non-literal arguments are skipped.
    fn scan_call(
        &mut self,
        kind: DependencyKind,
        found: &mut Vec<DependencySpec>,
    ) -> Result<(), ScanError> {
        self.skip_whitespace();
        if self.peek() != Some('(') {
            return Ok(());
        }
        self.bump();
        self.skip_whitespace();
        if !self.at_quote() {
            return Ok(());
        }
        let line = self.line;
        let spec = self.read_string()?;
        self.skip_whitespace();
        if matches!(self.peek(), Some(')' | ',')) {
            self.push(found, spec, kind, line);
        }
        Ok(())
    }
}

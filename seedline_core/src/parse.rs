//! Reader for the seed source-file format.
//!
//! The parser understands just enough C/C++ to recover the call sequence of a
//! `test_<library>_api_sequence` function: blocks, `if`/`else`, loops,
//! `return`, and expression statements. Anything it does not recognise as a
//! library call is kept verbatim as a raw statement, so rendering a parsed seed
//! reproduces an equivalent function.

use crate::library::{EdgeCaseKind, ResourceModel, TargetLibrary};
use crate::seed::{
    Binding, EdgeCaseTag, LibraryCall, Quality, ReturnHandling, ReturnValue, SeedMetadata,
    SeedRecord, Statement,
};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;
use thiserror::Error;

/// Nesting limit for blocks; deeper input is rejected rather than recursed into.
const MAX_BLOCK_DEPTH: usize = 128;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("No test_<library>_api_sequence function found")]
    MissingFunction,

    #[error("Expected exactly one sequence function, found {0}")]
    MultipleFunctions(usize),

    #[error("Unknown target library token '{0}'")]
    UnknownLibrary(String),

    #[error("Malformed {field} header: {value}")]
    InvalidHeader { field: &'static str, value: String },

    #[error("Malformed <Quality> JSON: {0}")]
    InvalidQuality(String),

    #[error("Function body starting on line {0} is never closed")]
    UnterminatedBody(usize),

    #[error("Blocks nested deeper than {MAX_BLOCK_DEPTH} levels")]
    TooDeep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Ident,
    Number,
    Str,
    Char,
    Punct,
    Comment,
    Preproc,
}

#[derive(Debug, Clone, Copy)]
struct Token {
    kind: TokenKind,
    start: usize,
    end: usize,
    line: usize,
}

const MULTI_PUNCT: &[&str] = &[
    "...", "<<=", ">>=", "->", "::", "==", "!=", "<=", ">=", "&&", "||", "++", "--", "+=", "-=",
    "*=", "/=", "%=", "&=", "|=", "^=", "<<", ">>",
];

/// Splits C/C++ source into tokens. Never fails: unterminated literals and
/// comments run to the end of input.
fn tokenize(src: &str) -> Vec<Token> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    let mut line = 1;
    let mut at_line_start = true;

    while i < bytes.len() {
        let b = bytes[i];
        if b == b'\n' {
            line += 1;
            at_line_start = true;
            i += 1;
            continue;
        }
        if b.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        let start_line = line;
        let kind;

        if b == b'#' && at_line_start {
            while i < bytes.len() && bytes[i] != b'\n' {
                if bytes[i] == b'\\' && bytes.get(i + 1) == Some(&b'\n') {
                    i += 2;
                    line += 1;
                    continue;
                }
                i += 1;
            }
            kind = TokenKind::Preproc;
        } else if b == b'/' && bytes.get(i + 1) == Some(&b'/') {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            kind = TokenKind::Comment;
        } else if b == b'/' && bytes.get(i + 1) == Some(&b'*') {
            i += 2;
            while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                if bytes[i] == b'\n' {
                    line += 1;
                }
                i += 1;
            }
            i = (i + 2).min(bytes.len());
            kind = TokenKind::Comment;
        } else if b == b'R' && bytes.get(i + 1) == Some(&b'"') {
            // C++ raw string: R"delim( ... )delim"
            let delim_start = i + 2;
            let mut j = delim_start;
            while j < bytes.len() && bytes[j] != b'(' && bytes[j] != b'\n' {
                j += 1;
            }
            let delim = &bytes[delim_start..j.min(bytes.len())];
            i = j + 1;
            while i < bytes.len() {
                if bytes[i] == b')'
                    && bytes[i + 1..].starts_with(delim)
                    && bytes.get(i + 1 + delim.len()) == Some(&b'"')
                {
                    i += delim.len() + 2;
                    break;
                }
                if bytes[i] == b'\n' {
                    line += 1;
                }
                i += 1;
            }
            i = i.min(bytes.len());
            kind = TokenKind::Str;
        } else if b == b'"' || b == b'\'' {
            let quote = b;
            i += 1;
            while i < bytes.len() && bytes[i] != quote && bytes[i] != b'\n' {
                if bytes[i] == b'\\' {
                    i += 1;
                }
                i += 1;
            }
            i = (i + 1).min(bytes.len());
            kind = if quote == b'"' {
                TokenKind::Str
            } else {
                TokenKind::Char
            };
        } else if b.is_ascii_alphabetic() || b == b'_' {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            // Prefixed literals such as L"..." or u8"...".
            if i < bytes.len()
                && bytes[i] == b'"'
                && matches!(&src[start..i], "L" | "u" | "U" | "u8")
            {
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' && bytes[i] != b'\n' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i = (i + 1).min(bytes.len());
                kind = TokenKind::Str;
            } else {
                kind = TokenKind::Ident;
            }
        } else if b.is_ascii_digit()
            || (b == b'.' && bytes.get(i + 1).is_some_and(|c| c.is_ascii_digit()))
        {
            while i < bytes.len() {
                let c = bytes[i];
                let exponent_sign = (c == b'+' || c == b'-')
                    && matches!(bytes[i - 1], b'e' | b'E' | b'p' | b'P')
                    && !src[start..i].starts_with("0x");
                if c.is_ascii_alphanumeric() || c == b'.' || c == b'\'' || exponent_sign {
                    i += 1;
                } else {
                    break;
                }
            }
            kind = TokenKind::Number;
        } else if b >= 0x80 {
            i += 1;
            while i < bytes.len() && (bytes[i] & 0xC0) == 0x80 {
                i += 1;
            }
            kind = TokenKind::Punct;
        } else {
            let rest = &bytes[i..];
            let width = MULTI_PUNCT
                .iter()
                .find(|p| rest.starts_with(p.as_bytes()))
                .map_or(1, |p| p.len());
            i += width;
            kind = TokenKind::Punct;
        }

        at_line_start = false;
        tokens.push(Token {
            kind,
            start,
            end: i.min(bytes.len()),
            line: start_line,
        });
    }
    tokens
}

const NOT_CALLS: &[&str] = &[
    "if", "while", "for", "switch", "return", "sizeof", "alignof", "decltype", "typeof",
    "static_assert", "defined", "catch", "do", "else", "case", "new", "delete", "throw",
    "static_cast", "reinterpret_cast", "const_cast", "dynamic_cast", "offsetof", "_Alignof",
    "__attribute__",
];

/// Every identifier that is immediately followed by `(` in `text`, minus
/// keywords and operators that look like calls.
pub fn scan_call_identifiers(text: &str) -> BTreeSet<String> {
    let tokens = tokenize(text);
    let mut names = BTreeSet::new();
    for (idx, tok) in tokens.iter().enumerate() {
        if tok.kind != TokenKind::Ident {
            continue;
        }
        let name = &text[tok.start..tok.end];
        if NOT_CALLS.contains(&name) {
            continue;
        }
        let next = tokens[idx + 1..].iter().find(|t| t.kind != TokenKind::Comment);
        if next.is_some_and(|t| &text[t.start..t.end] == "(") {
            names.insert(name.to_string());
        }
    }
    names
}

fn function_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\bint\s+test_(\w+)_api_sequence\s*\(\s*(?:void)?\s*\)\s*\{")
            .expect("static regex")
    })
}

fn score_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^//<score>\s*([-+0-9.eEinfa]+)\s*,\s*nr_unique_branch:\s*(\d+)")
            .expect("static regex")
    })
}

fn edge_case_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bedge[ -]?cases?\b").expect("static regex"))
}

fn deliberate_ub_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\bUB\b|(?i)undefined behaviou?r").expect("static regex")
    })
}

fn void_discard_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\(\s*void\s*\)\s*([A-Za-z_]\w*)\s*;$").expect("static regex")
    })
}

/// Parses a seed source file into a `SeedRecord` that keeps the original text.
pub fn parse_seed(text: &str) -> Result<SeedRecord, ParseError> {
    let matches: Vec<_> = function_regex().captures_iter(text).collect();
    let caps = match matches.len() {
        0 => return Err(ParseError::MissingFunction),
        1 => &matches[0],
        n => return Err(ParseError::MultipleFunctions(n)),
    };
    let (Some(whole), Some(token)) = (caps.get(0), caps.get(1)) else {
        return Err(ParseError::MissingFunction);
    };
    let target_library: TargetLibrary = token
        .as_str()
        .parse()
        .map_err(|_| ParseError::UnknownLibrary(token.as_str().to_string()))?;

    let header = &text[..whole.start()];
    let (metadata, includes, prelude) = parse_header(header)?;

    let body_offset = whole.end();
    let body_text = &text[body_offset..];
    let open_line = text[..body_offset].lines().count().max(1);
    let mut parser = BodyParser::new(body_text, ResourceModel::new());
    let mut body = parser
        .parse_block()
        .map_err(|err| match err {
            ParseError::UnterminatedBody(_) => ParseError::UnterminatedBody(open_line),
            other => other,
        })?;
    apply_void_discards(&mut body);

    Ok(SeedRecord::from_parts(
        metadata,
        target_library,
        includes,
        prelude,
        body,
        text.to_string(),
    ))
}

/// Parses a run of statements as they would appear inside a function body.
pub fn parse_statements(fragment: &str) -> Result<Vec<Statement>, ParseError> {
    let text = format!("{fragment}\n}}");
    let mut parser = BodyParser::new(&text, ResourceModel::new());
    let mut body = parser.parse_block()?;
    apply_void_discards(&mut body);
    Ok(body)
}

/// Reads includes, the metadata comment block and any other top-level code
/// that precedes the sequence function.
fn parse_header(header: &str) -> Result<(SeedMetadata, Vec<String>, String), ParseError> {
    let mut metadata = SeedMetadata::default();
    let mut includes = Vec::new();
    let mut prelude = Vec::new();
    let mut lines = header.lines();

    while let Some(raw) = lines.next() {
        let line = raw.trim();
        if let Some(rest) = line.strip_prefix("#include") {
            includes.push(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("//<ID>") {
            let value = rest.trim();
            metadata.id = value.parse().map_err(|_| ParseError::InvalidHeader {
                field: "<ID>",
                value: value.to_string(),
            })?;
        } else if let Some(rest) = line.strip_prefix("//<Prompt>") {
            metadata.prompt = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("/*<Combination>:") {
            let mut block = rest.to_string();
            while !block.contains("*/") {
                match lines.next() {
                    Some(next) => {
                        block.push('\n');
                        block.push_str(next);
                    }
                    None => break,
                }
            }
            let block = block.split("*/").next().unwrap_or_default();
            metadata.combination = parse_combination(block);
        } else if line.starts_with("//<score>") {
            let caps = score_regex()
                .captures(line)
                .ok_or_else(|| ParseError::InvalidHeader {
                    field: "<score>",
                    value: line.to_string(),
                })?;
            metadata.score = caps[1].parse().map_err(|_| ParseError::InvalidHeader {
                field: "<score>",
                value: caps[1].to_string(),
            })?;
            metadata.unique_branch_count =
                caps[2].parse().map_err(|_| ParseError::InvalidHeader {
                    field: "nr_unique_branch",
                    value: caps[2].to_string(),
                })?;
        } else if let Some(rest) = line.strip_prefix("//<Quality>") {
            let quality: Quality = serde_json::from_str(rest.trim())
                .map_err(|e| ParseError::InvalidQuality(e.to_string()))?;
            metadata.quality = Some(quality);
        } else {
            prelude.push(raw);
        }
    }

    Ok((metadata, includes, prelude.join("\n").trim().to_string()))
}

fn parse_combination(block: &str) -> Vec<String> {
    // The closing bracket is sometimes cut off along with the block.
    let trimmed = block.trim();
    let inner = match trimmed.strip_prefix('[') {
        Some(rest) => rest.trim_end().strip_suffix(']').unwrap_or(rest),
        None => trimmed,
    };
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in inner.chars() {
        match c {
            '(' | '[' | '<' => depth += 1,
            ')' | ']' | '>' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                items.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    items.push(current);
    items
        .iter()
        .map(|item| item.trim().trim_matches('"').trim())
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Infers an edge-case tag from a comment, if the comment announces one.
pub fn edge_case_from_comment(comment: &str) -> Option<EdgeCaseTag> {
    let note = strip_comment_delimiters(comment);
    if !edge_case_regex().is_match(&note) {
        return None;
    }
    let lowered = note.to_ascii_lowercase();
    let kind = if lowered.contains("double") || lowered.contains("twice") {
        EdgeCaseKind::DoubleRelease
    } else if lowered.contains("after close")
        || lowered.contains("after free")
        || lowered.contains("after end")
        || lowered.contains("after release")
        || lowered.contains("after delete")
        || lowered.contains("use after")
        || lowered.contains("post-close")
    {
        EdgeCaseKind::UseAfterRelease
    } else if lowered.contains("null") {
        EdgeCaseKind::NullArgument
    } else if lowered.contains("zero")
        || lowered.contains("0 length")
        || lowered.contains("0-length")
        || lowered.contains("length 0")
        || lowered.contains("empty")
    {
        EdgeCaseKind::ZeroLength
    } else {
        EdgeCaseKind::Unclassified
    };
    Some(EdgeCaseTag {
        kind,
        deliberate_ub: deliberate_ub_regex().is_match(&note),
        note,
    })
}

fn strip_comment_delimiters(comment: &str) -> String {
    let trimmed = comment.trim();
    let inner = if let Some(rest) = trimmed.strip_prefix("//") {
        rest
    } else if let Some(rest) = trimmed.strip_prefix("/*") {
        rest.strip_suffix("*/").unwrap_or(rest)
    } else {
        trimmed
    };
    inner.trim().to_string()
}

/// A `(void)var;` statement later in the body downgrades the call bound to
/// `var` from checked to ignored.
pub(crate) fn apply_void_discards(body: &mut [Statement]) {
    let mut discarded = BTreeSet::new();
    crate::seed::walk_statements(body, &mut |stmt| {
        if let Statement::Raw(text) = stmt {
            if let Some(caps) = void_discard_regex().captures(text.trim()) {
                discarded.insert(caps[1].to_string());
            }
        }
    });
    if !discarded.is_empty() {
        downgrade_discarded(body, &discarded);
    }
}

fn downgrade_discarded(body: &mut [Statement], discarded: &BTreeSet<String>) {
    for stmt in body {
        match stmt {
            Statement::Call(call) => {
                if call.assigned_to().is_some_and(|t| discarded.contains(t)) {
                    call.return_handling = ReturnHandling::Ignored;
                }
            }
            Statement::Guard {
                then_body,
                else_body,
                ..
            } => {
                downgrade_discarded(then_body, discarded);
                downgrade_discarded(else_body, discarded);
            }
            Statement::Loop { body, .. } => downgrade_discarded(body, discarded),
            _ => {}
        }
    }
}

struct BodyParser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    last_end_line: usize,
    model: ResourceModel,
}

impl<'a> BodyParser<'a> {
    fn new(src: &'a str, model: ResourceModel) -> Self {
        Self {
            src,
            tokens: tokenize(src),
            pos: 0,
            depth: 0,
            last_end_line: 0,
            model,
        }
    }

    fn text(&self, tok: &Token) -> &'a str {
        self.src.get(tok.start..tok.end).unwrap_or("")
    }

    fn span(&self, first: usize, last: usize) -> &'a str {
        match (self.tokens.get(first), self.tokens.get(last)) {
            (Some(a), Some(b)) if a.start <= b.end => {
                self.src.get(a.start..b.end).unwrap_or("").trim()
            }
            _ => "",
        }
    }

    fn is_punct(&self, idx: usize, punct: &str) -> bool {
        self.tokens
            .get(idx)
            .is_some_and(|t| t.kind == TokenKind::Punct && self.text(t) == punct)
    }

    fn is_ident(&self, idx: usize, ident: &str) -> bool {
        self.tokens
            .get(idx)
            .is_some_and(|t| t.kind == TokenKind::Ident && self.text(t) == ident)
    }

    fn next_code(&self, mut idx: usize) -> usize {
        while self
            .tokens
            .get(idx)
            .is_some_and(|t| t.kind == TokenKind::Comment)
        {
            idx += 1;
        }
        idx
    }

    /// Index of the bracket closing the one at `open`, counting all bracket
    /// kinds together.
    fn matching(&self, open: usize) -> Option<usize> {
        let mut depth = 0usize;
        for idx in open..self.tokens.len() {
            let tok = &self.tokens[idx];
            if tok.kind != TokenKind::Punct {
                continue;
            }
            match self.text(tok) {
                "(" | "[" | "{" => depth += 1,
                ")" | "]" | "}" => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return Some(idx);
                    }
                }
                _ => {}
            }
        }
        None
    }

    /// Parses statements until the closing `}` of the current block. The
    /// opening brace has already been consumed.
    fn parse_block(&mut self) -> Result<Vec<Statement>, ParseError> {
        self.depth += 1;
        if self.depth > MAX_BLOCK_DEPTH {
            return Err(ParseError::TooDeep);
        }
        let mut out = Vec::new();
        let mut pending: Option<EdgeCaseTag> = None;
        loop {
            let Some(tok) = self.tokens.get(self.pos).copied() else {
                return Err(ParseError::UnterminatedBody(0));
            };
            if tok.kind == TokenKind::Comment {
                self.pos += 1;
                let text = self.text(&tok);
                match edge_case_from_comment(text) {
                    Some(tag)
                        if tok.line == self.last_end_line
                            && matches!(out.last(), Some(Statement::Call(_))) =>
                    {
                        if let Some(call) = last_call_mut(&mut out) {
                            call.edge_case = Some(tag);
                        }
                    }
                    Some(tag) => {
                        if let Some(previous) = pending.replace(tag) {
                            out.push(Statement::Comment(format!("// {}", previous.note)));
                        }
                    }
                    None => out.push(Statement::Comment(text.to_string())),
                }
                continue;
            }
            if self.is_punct(self.pos, "}") {
                self.pos += 1;
                self.last_end_line = tok.line;
                if let Some(tag) = pending.take() {
                    out.push(Statement::Comment(format!("// {}", tag.note)));
                }
                self.depth -= 1;
                return Ok(out);
            }
            if self.is_punct(self.pos, "{") {
                self.pos += 1;
                let inner = self.parse_block()?;
                out.extend(inner);
                continue;
            }
            let mut stmt = self.parse_statement()?;
            if let Some(tag) = pending.take() {
                if let Err(tag) = attach_tag(&mut stmt, tag) {
                    out.push(Statement::Comment(format!("// {}", tag.note)));
                }
            }
            out.push(stmt);
        }
    }

    /// Body of an `if`/`else`/loop: a block or a single statement.
    fn parse_body(&mut self) -> Result<Vec<Statement>, ParseError> {
        self.depth += 1;
        if self.depth > MAX_BLOCK_DEPTH {
            return Err(ParseError::TooDeep);
        }
        let body = self.parse_body_inner();
        self.depth -= 1;
        body
    }

    fn parse_body_inner(&mut self) -> Result<Vec<Statement>, ParseError> {
        let mut leading = Vec::new();
        loop {
            match self.tokens.get(self.pos).copied() {
                Some(tok) if tok.kind == TokenKind::Comment => {
                    self.pos += 1;
                    leading.push(Statement::Comment(self.text(&tok).to_string()));
                }
                Some(_) => break,
                None => return Err(ParseError::UnterminatedBody(0)),
            }
        }
        if self.is_punct(self.pos, "{") {
            self.pos += 1;
            leading.extend(self.parse_block()?);
        } else if !self.is_punct(self.pos, "}") {
            leading.push(self.parse_statement()?);
        }
        Ok(leading)
    }

    fn parse_statement(&mut self) -> Result<Statement, ParseError> {
        let Some(first) = self.tokens.get(self.pos).copied() else {
            return Err(ParseError::UnterminatedBody(0));
        };
        if first.kind == TokenKind::Preproc {
            self.pos += 1;
            self.last_end_line = first.line;
            return Ok(Statement::Raw(self.text(&first).to_string()));
        }
        if first.kind == TokenKind::Ident {
            match self.text(&first) {
                "if" => return self.parse_if(),
                "for" | "while" | "switch" => return self.parse_loop(),
                "do" => return self.parse_do(),
                "return" => return Ok(self.parse_return()),
                _ => {}
            }
        }
        if self.is_punct(self.pos, ";") {
            self.pos += 1;
            self.last_end_line = first.line;
            return Ok(Statement::Raw(";".to_string()));
        }

        let start = self.pos;
        let end = self.statement_end(start);
        self.pos = (end + 1).min(self.tokens.len());
        if self.is_punct(end, ";") {
            // Consumed with the statement.
        } else {
            self.pos = end;
        }
        let last = if self.is_punct(end, ";") { end } else { end.saturating_sub(1) };
        if let Some(tok) = self.tokens.get(last) {
            self.last_end_line = tok.line;
        }

        let code: Vec<usize> = (start..end)
            .filter(|&i| self.tokens[i].kind != TokenKind::Comment)
            .collect();
        if let Some(call) = self.recognize_call(&code) {
            return Ok(Statement::Call(call));
        }
        let mut text = self.span(start, last).to_string();
        if !self.is_punct(end, ";") && !text.is_empty() {
            text.push(';');
        }
        Ok(Statement::Raw(text))
    }

    /// Index of the `;` ending the statement at `start`, or of the `}` / end of
    /// input where a missing semicolon cuts it short.
    fn statement_end(&self, start: usize) -> usize {
        let mut depth = 0usize;
        let mut idx = start;
        while let Some(tok) = self.tokens.get(idx) {
            if tok.kind == TokenKind::Punct {
                match self.text(tok) {
                    "(" | "[" | "{" => depth += 1,
                    ")" | "]" => depth = depth.saturating_sub(1),
                    "}" => {
                        if depth == 0 {
                            return idx;
                        }
                        depth -= 1;
                    }
                    ";" if depth == 0 => return idx,
                    _ => {}
                }
            }
            idx += 1;
        }
        idx
    }

    fn parse_if(&mut self) -> Result<Statement, ParseError> {
        let keyword = self.pos;
        let open = self.next_code(keyword + 1);
        if !self.is_punct(open, "(") {
            return self.fallback_raw(keyword);
        }
        let Some(close) = self.matching(open) else {
            return Err(ParseError::UnterminatedBody(0));
        };
        let condition = self.span(open + 1, close.saturating_sub(1)).to_string();
        let condition = if close == open + 1 { String::new() } else { condition };
        let condition_calls = self.condition_calls(open + 1, close);
        self.pos = close + 1;
        self.last_end_line = self.tokens[close].line;
        let then_body = self.parse_body()?;
        let after = self.next_code(self.pos);
        let else_body = if self.is_ident(after, "else") {
            self.pos = after + 1;
            self.parse_body()?
        } else {
            Vec::new()
        };
        Ok(Statement::Guard {
            condition,
            condition_calls,
            then_body,
            else_body,
        })
    }

    fn parse_loop(&mut self) -> Result<Statement, ParseError> {
        let keyword = self.pos;
        let open = self.next_code(keyword + 1);
        if !self.is_punct(open, "(") {
            return self.fallback_raw(keyword);
        }
        let Some(close) = self.matching(open) else {
            return Err(ParseError::UnterminatedBody(0));
        };
        let header = self.span(keyword, close).to_string();
        let condition_calls = self.condition_calls(open + 1, close);
        self.pos = close + 1;
        self.last_end_line = self.tokens[close].line;
        if self.is_punct(self.next_code(self.pos), ";") {
            // `while (f(x));`
            self.pos = self.next_code(self.pos) + 1;
            return Ok(Statement::Loop {
                header,
                trailer: None,
                condition_calls,
                body: Vec::new(),
            });
        }
        let body = self.parse_body()?;
        Ok(Statement::Loop {
            header,
            trailer: None,
            condition_calls,
            body,
        })
    }

    fn parse_do(&mut self) -> Result<Statement, ParseError> {
        self.pos += 1;
        let body = self.parse_body()?;
        let keyword = self.next_code(self.pos);
        if !self.is_ident(keyword, "while") {
            return Ok(Statement::Loop {
                header: "do".to_string(),
                trailer: None,
                condition_calls: Vec::new(),
                body,
            });
        }
        let open = self.next_code(keyword + 1);
        let (condition_calls, close) = match self.matching(open) {
            Some(close) if self.is_punct(open, "(") => {
                (self.condition_calls(open + 1, close), close)
            }
            _ => (Vec::new(), keyword),
        };
        let end = self.statement_end(close);
        let last = if self.is_punct(end, ";") { end } else { end.saturating_sub(1).max(keyword) };
        let trailer = self.span(keyword, last).to_string();
        self.pos = if self.is_punct(end, ";") { end + 1 } else { end };
        if let Some(tok) = self.tokens.get(last) {
            self.last_end_line = tok.line;
        }
        Ok(Statement::Loop {
            header: "do".to_string(),
            trailer: Some(trailer),
            condition_calls,
            body,
        })
    }

    fn parse_return(&mut self) -> Statement {
        let keyword = self.pos;
        let end = self.statement_end(keyword + 1);
        self.pos = if self.is_punct(end, ";") { end + 1 } else { end };
        if let Some(tok) = self.tokens.get(end.min(self.tokens.len().saturating_sub(1))) {
            self.last_end_line = tok.line;
        }
        if end <= keyword + 1 {
            return Statement::Return(ReturnValue::Expr(String::new()));
        }
        let expr = self.span(keyword + 1, end - 1);
        match parse_int_literal(expr) {
            Some(value) => Statement::Return(ReturnValue::Literal(value)),
            None => Statement::Return(ReturnValue::Expr(expr.to_string())),
        }
    }

    /// Keyword without the expected parenthesis: keep the statement verbatim.
    fn fallback_raw(&mut self, start: usize) -> Result<Statement, ParseError> {
        let end = self.statement_end(start);
        let last = if self.is_punct(end, ";") { end } else { end.saturating_sub(1).max(start) };
        self.pos = if self.is_punct(end, ";") { end + 1 } else { end.max(start + 1) };
        Ok(Statement::Raw(self.span(start, last).to_string()))
    }

    /// Outermost calls inside a condition, each marked checked. An assignment
    /// such as `(f = gzopen(...)) == NULL` binds the call to `f`.
    fn condition_calls(&self, from: usize, to: usize) -> Vec<LibraryCall> {
        let mut calls = Vec::new();
        let mut idx = from;
        while idx < to {
            let tok = self.tokens[idx];
            let callable = tok.kind == TokenKind::Ident
                && !NOT_CALLS.contains(&self.text(&tok))
                && self.is_punct(idx + 1, "(");
            if !callable {
                idx += 1;
                continue;
            }
            let Some(close) = self.matching(idx + 1) else {
                break;
            };
            if close > to {
                break;
            }
            let mut call = LibraryCall {
                function_name: self.text(&tok).to_string(),
                arguments: self.split_args(idx + 2, close),
                return_handling: ReturnHandling::Checked,
                binding: Binding::Bare,
                edge_case: None,
            };
            let mut before = idx;
            let mut cast = None;
            if before >= from + 1 && self.is_punct(before - 1, ")") {
                // `(type *)f(...)` inside an assignment
                if let Some(open) = (from..before - 1).rev().find(|&i| self.is_punct(i, "(")) {
                    if self.is_type_tokens(open + 1, before - 1) {
                        cast = Some(self.span(open, before - 1).to_string());
                        before = open;
                    }
                }
            }
            if before >= from + 2
                && self.is_punct(before - 1, "=")
                && self.tokens[before - 2].kind == TokenKind::Ident
            {
                call.binding = Binding::Assigned {
                    declared_type: None,
                    target: self.text(&self.tokens[before - 2]).to_string(),
                    cast,
                };
            }
            calls.push(call);
            idx = close + 1;
        }
        calls
    }

    fn split_args(&self, from: usize, close: usize) -> Vec<String> {
        let mut args = Vec::new();
        if from >= close {
            return args;
        }
        let mut depth = 0usize;
        let mut arg_start = from;
        for idx in from..close {
            let tok = &self.tokens[idx];
            if tok.kind != TokenKind::Punct {
                continue;
            }
            match self.text(tok) {
                "(" | "[" | "{" => depth += 1,
                ")" | "]" | "}" => depth = depth.saturating_sub(1),
                "," if depth == 0 => {
                    args.push(self.arg_text(arg_start, idx));
                    arg_start = idx + 1;
                }
                _ => {}
            }
        }
        args.push(self.arg_text(arg_start, close));
        args
    }

    fn arg_text(&self, from: usize, to: usize) -> String {
        if from >= to {
            return String::new();
        }
        self.span(from, to - 1).to_string()
    }

    fn is_type_tokens(&self, from: usize, to: usize) -> bool {
        from < to
            && (from..to).all(|i| {
                let tok = &self.tokens[i];
                tok.kind == TokenKind::Ident
                    || (tok.kind == TokenKind::Punct && matches!(self.text(tok), "*" | "::" | "&"))
            })
    }

    /// Recognises `[(void)] [type] [lhs =] [(cast)] f(args)` over the code
    /// tokens of one statement.
    fn recognize_call(&self, code: &[usize]) -> Option<LibraryCall> {
        let punct = |k: usize, p: &str| code.get(k).is_some_and(|&i| self.is_punct(i, p));
        let mut k = 0;
        let mut discarded = false;
        if punct(0, "(")
            && code.get(1).is_some_and(|&i| self.is_ident(i, "void"))
            && punct(2, ")")
        {
            discarded = true;
            k = 3;
        }

        let mut depth = 0usize;
        let mut eq = None;
        for (offset, &i) in code[k..].iter().enumerate() {
            let tok = &self.tokens[i];
            if tok.kind != TokenKind::Punct {
                continue;
            }
            match self.text(tok) {
                "(" | "[" | "{" => depth += 1,
                ")" | "]" | "}" => depth = depth.saturating_sub(1),
                "=" if depth == 0 => {
                    eq = Some(k + offset);
                    break;
                }
                _ => {}
            }
        }

        let mut binding = if discarded { Binding::Discarded } else { Binding::Bare };
        let mut rhs = k;
        if let Some(eq) = eq {
            if discarded {
                return None;
            }
            let (declared_type, target) = self.split_lhs(&code[k..eq])?;
            binding = Binding::Assigned {
                declared_type,
                target,
                cast: None,
            };
            rhs = eq + 1;
        }

        let mut cast = None;
        if punct(rhs, "(") {
            let close_pos = code[rhs..].iter().position(|&i| self.is_punct(i, ")"))? + rhs;
            let inner_ok = close_pos > rhs + 1
                && code[rhs + 1..close_pos].iter().all(|&i| {
                    let tok = &self.tokens[i];
                    tok.kind == TokenKind::Ident
                        || (tok.kind == TokenKind::Punct
                            && matches!(self.text(tok), "*" | "::" | "&"))
                });
            if !inner_ok {
                return None;
            }
            cast = Some(self.span(code[rhs], code[close_pos]).to_string());
            rhs = close_pos + 1;
        }

        // Function name, possibly namespace-qualified.
        let name_start = rhs;
        let mut j = rhs;
        loop {
            let &i = code.get(j)?;
            if self.tokens[i].kind != TokenKind::Ident {
                return None;
            }
            if punct(j + 1, "::") {
                j += 2;
                continue;
            }
            break;
        }
        let name_tok = code[j];
        if NOT_CALLS.contains(&self.text(&self.tokens[name_tok])) {
            return None;
        }
        let open = *code.get(j + 1)?;
        if !self.is_punct(open, "(") {
            return None;
        }
        let close = self.matching(open)?;
        if code.last() != Some(&close) {
            return None;
        }

        let function_name = self.span(code[name_start], name_tok).to_string();
        if let Binding::Assigned { cast: slot, .. } = &mut binding {
            *slot = cast;
        } else if cast.is_some() {
            return None;
        }
        let return_handling = match binding {
            Binding::Assigned { .. } => ReturnHandling::Checked,
            Binding::Discarded => ReturnHandling::Ignored,
            Binding::Bare if self.model.returns_void(&function_name) => ReturnHandling::Void,
            Binding::Bare => ReturnHandling::Ignored,
        };
        Some(LibraryCall {
            function_name,
            arguments: self.split_args(open + 1, close),
            return_handling,
            binding,
            edge_case: None,
        })
    }

    /// Splits `type target` (or a bare `target`) on the left of `=`.
    fn split_lhs(&self, lhs: &[usize]) -> Option<(Option<String>, String)> {
        if lhs.is_empty() {
            return None;
        }
        let allowed = lhs.iter().all(|&i| {
            let tok = &self.tokens[i];
            tok.kind == TokenKind::Ident
                || (tok.kind == TokenKind::Punct
                    && matches!(self.text(tok), "*" | "&" | "::" | "." | "->" | "<" | ">"))
        });
        if !allowed {
            return None;
        }
        // The target is the trailing member path: ident (('.' | '->') ident)*
        let mut p = lhs.len() - 1;
        if self.tokens[lhs[p]].kind != TokenKind::Ident {
            return None;
        }
        while p >= 2
            && self.tokens[lhs[p - 2]].kind == TokenKind::Ident
            && (self.is_punct(lhs[p - 1], ".") || self.is_punct(lhs[p - 1], "->"))
        {
            p -= 2;
        }
        let target = self.span(lhs[p], lhs[lhs.len() - 1]).to_string();
        let declared_type = if p == 0 {
            None
        } else {
            Some(self.span(lhs[0], lhs[p - 1]).to_string())
        };
        Some((declared_type, target))
    }
}

fn last_call_mut(out: &mut [Statement]) -> Option<&mut LibraryCall> {
    match out.last_mut()? {
        Statement::Call(call) => Some(call),
        _ => None,
    }
}

/// Attaches `tag` to the first call of `stmt`, handing it back when the
/// statement has none.
fn attach_tag(stmt: &mut Statement, tag: EdgeCaseTag) -> Result<(), EdgeCaseTag> {
    match stmt {
        Statement::Call(call) => {
            call.edge_case = Some(tag);
            Ok(())
        }
        Statement::Guard {
            condition_calls, ..
        }
        | Statement::Loop {
            condition_calls, ..
        } => match condition_calls.first_mut() {
            Some(call) => {
                call.edge_case = Some(tag);
                Ok(())
            }
            None => Err(tag),
        },
        _ => Err(tag),
    }
}

fn parse_int_literal(expr: &str) -> Option<i64> {
    let mut text = expr.trim();
    while text.starts_with('(') && text.ends_with(')') && text.len() >= 2 {
        text = text[1..text.len() - 1].trim();
    }
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest.trim()),
        None => (false, text),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: i64 = digits.parse().ok()?;
    Some(if negative { -value } else { value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ZLIB_SEED: &str = r#"#include <zlib.h>
#include <string.h>

//<ID> 42
//<Prompt> ["deflateInit_","gzopen"]
/*<Combination>: [int deflateInit_(z_streamp, int, const char *, int),
    gzFile gzopen(const char *, const char *)
*/
//<score> 1.5, nr_unique_branch: 3
//<Quality> {"density":3,"unique_branches":{"deflate":[[1,"x",0]]},"library_calls":["deflateInit_","gzopen","gzwrite","gzclose","deflateEnd","remove","memset","strlen"],"critical_calls":["gzwrite"],"visited":2}
int test_zlib_api_sequence() {
    z_stream strm;
    memset(&strm, 0, sizeof(strm));
    const char *path = "seedline_42_gz.gz";
    const char *data = "hello";
    int rc = deflateInit_(&strm, 6, ZLIB_VERSION, (int)sizeof(z_stream));
    if (rc != Z_OK) {
        return -1;
    }
    gzFile gz = gzopen(path, "wb");
    if (gz == NULL) {
        deflateEnd(&strm);
        return -2;
    }
    (void)gzwrite(gz, data, (unsigned)strlen(data)); // edge case: zero length not exercised here
    gzclose(gz);
    deflateEnd(&strm);
    remove(path);
    (void)rc;
    return 66;
}
"#;

    #[test]
    fn parses_header_fields() {
        let seed = parse_seed(ZLIB_SEED).unwrap();
        let meta = seed.metadata();
        assert_eq!(meta.id, 42);
        assert_eq!(meta.prompt, "[\"deflateInit_\",\"gzopen\"]");
        assert_eq!(meta.combination.len(), 2);
        assert_eq!(meta.score, 1.5);
        assert_eq!(meta.unique_branch_count, 3);
        let quality = meta.quality.as_ref().unwrap();
        assert_eq!(quality.visited, 2);
        assert_eq!(quality.critical_calls, vec!["gzwrite".to_string()]);
        assert_eq!(seed.target_library(), TargetLibrary::Zlib);
        assert_eq!(seed.includes(), &["<zlib.h>".to_string(), "<string.h>".to_string()]);
    }

    #[test]
    fn combination_brackets_are_optional() {
        let closed =
            parse_combination(" [gzFile gzopen(const char *, const char *), int f(int a[4])]\n");
        assert_eq!(
            closed,
            vec!["gzFile gzopen(const char *, const char *)", "int f(int a[4])"]
        );
        let unclosed =
            parse_combination(" [uLong crc32(uLong, const Bytef *, uInt),\n    int gzclose(gzFile)\n");
        assert_eq!(
            unclosed,
            vec!["uLong crc32(uLong, const Bytef *, uInt)", "int gzclose(gzFile)"]
        );
        assert_eq!(parse_combination("deflateEnd, inflateEnd"), vec!["deflateEnd", "inflateEnd"]);
    }

    #[test]
    fn recovers_call_sequence_and_return_handling() {
        let seed = parse_seed(ZLIB_SEED).unwrap();
        assert_eq!(
            seed.call_sequence(),
            vec![
                "memset",
                "deflateInit_",
                "gzopen",
                "deflateEnd",
                "gzwrite",
                "gzclose",
                "deflateEnd",
                "remove"
            ]
        );
        let calls = seed.calls();
        let init = calls.iter().find(|c| c.function_name == "deflateInit_").unwrap();
        // `(void)rc;` discards the bound status.
        assert_eq!(init.return_handling, ReturnHandling::Ignored);
        assert_eq!(
            init.binding,
            Binding::Assigned {
                declared_type: Some("int".to_string()),
                target: "rc".to_string(),
                cast: None
            }
        );
        let open = calls.iter().find(|c| c.function_name == "gzopen").unwrap();
        assert_eq!(open.return_handling, ReturnHandling::Checked);
        let write = calls.iter().find(|c| c.function_name == "gzwrite").unwrap();
        assert_eq!(write.binding, Binding::Discarded);
        assert_eq!(write.arguments[2], "(unsigned)strlen(data)");
    }

    #[test]
    fn trailing_edge_case_comment_attaches_to_previous_call() {
        let seed = parse_seed(ZLIB_SEED).unwrap();
        let calls = seed.calls();
        let write = calls.iter().find(|c| c.function_name == "gzwrite").unwrap();
        let tag = write.edge_case.as_ref().unwrap();
        assert_eq!(tag.kind, EdgeCaseKind::ZeroLength);
        assert!(!tag.deliberate_ub);
    }

    #[test]
    fn guards_carry_condition_and_early_return() {
        let seed = parse_seed(ZLIB_SEED).unwrap();
        let guard = seed
            .body()
            .iter()
            .find_map(|s| match s {
                Statement::Guard {
                    condition,
                    then_body,
                    ..
                } if condition == "gz == NULL" => Some(then_body),
                _ => None,
            })
            .unwrap();
        assert_eq!(guard.last(), Some(&Statement::Return(ReturnValue::Literal(-2))));
        assert_eq!(
            seed.body().last(),
            Some(&Statement::Return(ReturnValue::Literal(66)))
        );
    }

    #[test]
    fn condition_assignment_binds_call() {
        let text = "int test_cJSON_api_sequence() {\n  cJSON *root;\n  if ((root = cJSON_Parse(\"{}\")) == NULL) return -1;\n  cJSON_Delete(root);\n  return 66;\n}\n";
        let seed = parse_seed(text).unwrap();
        let Statement::Guard {
            condition_calls, ..
        } = &seed.body()[1]
        else {
            panic!("expected guard, got {:?}", seed.body()[1]);
        };
        assert_eq!(condition_calls[0].function_name, "cJSON_Parse");
        assert_eq!(condition_calls[0].assigned_to(), Some("root"));
        let delete = seed.calls().into_iter().find(|c| c.function_name == "cJSON_Delete").unwrap();
        assert_eq!(delete.return_handling, ReturnHandling::Void);
    }

    #[test]
    fn leading_edge_case_comment_attaches_to_next_call() {
        let text = "int test_sqlite_api_sequence() {\n  // Edge case: NULL handle passed to close (deliberate UB)\n  sqlite3_close(NULL);\n  return 66;\n}\n";
        let seed = parse_seed(text).unwrap();
        let tag = seed.calls()[0].edge_case.clone().unwrap();
        assert_eq!(tag.kind, EdgeCaseKind::NullArgument);
        assert!(tag.deliberate_ub);
        assert_eq!(seed.body().len(), 2);
    }

    #[test]
    fn loops_and_do_while_are_structured() {
        let text = "int test_zlib_api_sequence() {\n  int i;\n  for (i = 0; i < 2; i++) { crc32(0L, Z_NULL, 0); }\n  do { adler32(1L, Z_NULL, 0); } while (0);\n  while (gzgetc(f) != -1);\n  return 66;\n}\n";
        let seed = parse_seed(text).unwrap();
        let loops: Vec<_> = seed
            .body()
            .iter()
            .filter(|s| matches!(s, Statement::Loop { .. }))
            .collect();
        assert_eq!(loops.len(), 3);
        let Statement::Loop { trailer, .. } = loops[1] else { unreachable!() };
        assert_eq!(trailer.as_deref(), Some("while (0);"));
        assert!(seed.call_sequence().contains(&"gzgetc".to_string()));
    }

    #[test]
    fn rejects_missing_or_duplicate_functions() {
        assert_eq!(parse_seed("int main() { return 0; }"), Err(ParseError::MissingFunction));
        let twice = "int test_zlib_api_sequence() { return 66; }\nint test_zlib_api_sequence() { return 66; }\n";
        assert_eq!(parse_seed(twice), Err(ParseError::MultipleFunctions(2)));
        assert_eq!(
            parse_seed("int test_libfoo_api_sequence() { return 66; }"),
            Err(ParseError::UnknownLibrary("libfoo".to_string()))
        );
    }

    #[test]
    fn malformed_quality_is_an_error_and_missing_id_is_zero() {
        let bad = "//<Quality> {not json\nint test_zlib_api_sequence() { return 66; }";
        assert!(matches!(parse_seed(bad), Err(ParseError::InvalidQuality(_))));
        let seed = parse_seed("int test_zlib_api_sequence() { return 66; }").unwrap();
        assert_eq!(seed.id(), 0);
        assert!(seed.metadata().quality.is_none());
    }

    #[test]
    fn unterminated_body_is_reported() {
        let err = parse_seed("int test_zlib_api_sequence() {\n  gzclose(f);\n").unwrap_err();
        assert!(matches!(err, ParseError::UnterminatedBody(_)));
    }

    #[test]
    fn prelude_helpers_are_kept() {
        let text = "#include <zlib.h>\nstatic unsigned in_func(void *d, unsigned char **b) { return 0; }\n//<ID> 3\nint test_zlib_api_sequence() { return 66; }\n";
        let seed = parse_seed(text).unwrap();
        assert!(seed.prelude().contains("in_func"));
        assert!(seed.render().contains("static unsigned in_func"));
    }

    #[test]
    fn rendered_seed_parses_to_same_calls() {
        let seed = parse_seed(ZLIB_SEED).unwrap();
        let reparsed = parse_seed(&seed.render()).unwrap();
        assert_eq!(reparsed.call_sequence(), seed.call_sequence());
        assert_eq!(reparsed.metadata(), seed.metadata());
    }

    #[test]
    fn fragments_parse_without_function_wrapper() {
        let body =
            parse_statements("gzFile f = gzopen(p, \"wb\");\nif (f == NULL) { return -1; }")
                .unwrap();
        assert_eq!(body.len(), 2);
        assert!(matches!(&body[0], Statement::Call(call) if call.assigned_to() == Some("f")));
        assert!(parse_statements("}").is_ok());
    }

    #[test]
    fn scan_skips_keywords() {
        let names = scan_call_identifiers("if (sizeof(x) > f(g(1))) return (int)h();");
        assert_eq!(
            names.into_iter().collect::<Vec<_>>(),
            vec!["f".to_string(), "g".to_string(), "h".to_string()]
        );
    }

    proptest! {
        #[test]
        fn parser_never_panics(body in "[a-z(){};=,*&\"'/ \\n0-9]{0,200}") {
            let text = format!("int test_zlib_api_sequence() {{{body}");
            let _ = parse_seed(&text);
        }

        #[test]
        fn arbitrary_text_never_panics(text in "\\PC{0,300}") {
            let _ = parse_seed(&text);
            let _ = scan_call_identifiers(&text);
        }
    }
}

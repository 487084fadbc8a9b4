use crate::library::{EdgeCaseKind, ResourceModel, TargetLibrary};
use crate::parse;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

/// Descriptive per-seed annotations written by the generator.
///
/// Only `id` and `library_calls` carry meaning inside seedline; the scores,
/// `unique_branches`, `density` and `visited` are kept as opaque values and
/// re-emitted untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SeedMetadata {
    pub id: u64,
    pub prompt: String,
    pub combination: Vec<String>,
    pub score: f64,
    pub unique_branch_count: u64,
    pub quality: Option<Quality>,
}

/// The `//<Quality>` JSON block.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Quality {
    #[serde(default)]
    pub density: f64,
    #[serde(default)]
    pub unique_branches: JsonMap<String, JsonValue>,
    #[serde(default)]
    pub library_calls: Vec<String>,
    #[serde(default)]
    pub critical_calls: Vec<String>,
    #[serde(default)]
    pub visited: u64,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReturnHandling {
    Checked,
    Ignored,
    Void,
}

/// What happens to a call's return value at the call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// `f(x);`
    Bare,
    /// `(void)f(x);`
    Discarded,
    /// `[type] target = [cast] f(x);`
    Assigned {
        declared_type: Option<String>,
        target: String,
        cast: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeCaseTag {
    pub kind: EdgeCaseKind,
    pub deliberate_ub: bool,
    /// Comment text (without delimiters) that introduced the tag, if any.
    pub note: String,
}

impl EdgeCaseTag {
    pub fn new(kind: EdgeCaseKind, deliberate_ub: bool) -> Self {
        Self {
            kind,
            deliberate_ub,
            note: String::new(),
        }
    }

    fn comment_line(&self) -> String {
        if !self.note.is_empty() {
            return format!("// {}", self.note);
        }
        if self.deliberate_ub {
            format!("// edge case (deliberate UB): {}", self.kind.describe())
        } else {
            format!("// edge case: {}", self.kind.describe())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryCall {
    pub function_name: String,
    pub arguments: Vec<String>,
    pub return_handling: ReturnHandling,
    pub binding: Binding,
    pub edge_case: Option<EdgeCaseTag>,
}

impl LibraryCall {
    pub fn new(function_name: impl Into<String>, arguments: &[&str]) -> Self {
        Self {
            function_name: function_name.into(),
            arguments: arguments.iter().map(|a| a.to_string()).collect(),
            return_handling: ReturnHandling::Ignored,
            binding: Binding::Bare,
            edge_case: None,
        }
    }

    pub fn discarded(mut self) -> Self {
        self.binding = Binding::Discarded;
        self.return_handling = ReturnHandling::Ignored;
        self
    }

    pub fn void(mut self) -> Self {
        self.binding = Binding::Bare;
        self.return_handling = ReturnHandling::Void;
        self
    }

    pub fn checked(mut self) -> Self {
        self.return_handling = ReturnHandling::Checked;
        self
    }

    pub fn assigned(mut self, target: impl Into<String>) -> Self {
        self.binding = Binding::Assigned {
            declared_type: None,
            target: target.into(),
            cast: None,
        };
        self.return_handling = ReturnHandling::Checked;
        self
    }

    pub fn with_edge_case(mut self, tag: EdgeCaseTag) -> Self {
        self.edge_case = Some(tag);
        self
    }

    pub fn assigned_to(&self) -> Option<&str> {
        match &self.binding {
            Binding::Assigned { target, .. } => Some(target.as_str()),
            _ => None,
        }
    }

    /// The call expression alone, e.g. `gzwrite(file, buf, 64)`.
    pub fn expression(&self) -> String {
        format!("{}({})", self.function_name, self.arguments.join(", "))
    }

    /// The call as a full statement, without its edge-case comment.
    pub fn statement(&self) -> String {
        match &self.binding {
            Binding::Bare => format!("{};", self.expression()),
            Binding::Discarded => format!("(void){};", self.expression()),
            Binding::Assigned {
                declared_type,
                target,
                cast,
            } => {
                let mut out = String::new();
                if let Some(ty) = declared_type {
                    out.push_str(ty);
                    if !ty.ends_with('*') {
                        out.push(' ');
                    }
                }
                out.push_str(target);
                out.push_str(" = ");
                if let Some(cast) = cast {
                    out.push_str(cast);
                }
                out.push_str(&self.expression());
                out.push(';');
                out
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnValue {
    Literal(i64),
    Expr(String),
}

/// One statement of a seed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Call(LibraryCall),
    /// Declarations and any statement that is not a plain call, verbatim.
    Raw(String),
    /// A comment, delimiters included.
    Comment(String),
    Guard {
        condition: String,
        condition_calls: Vec<LibraryCall>,
        then_body: Vec<Statement>,
        else_body: Vec<Statement>,
    },
    Loop {
        header: String,
        trailer: Option<String>,
        condition_calls: Vec<LibraryCall>,
        body: Vec<Statement>,
    },
    Return(ReturnValue),
}

impl Statement {
    pub fn raw(text: impl Into<String>) -> Self {
        Statement::Raw(text.into())
    }

    pub fn returning(value: i64) -> Self {
        Statement::Return(ReturnValue::Literal(value))
    }
}

/// A resolved or unresolved file path argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TempPath {
    Literal(String),
    Unresolved(String),
}

impl fmt::Display for TempPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TempPath::Literal(path) => write!(f, "\"{path}\""),
            TempPath::Unresolved(expr) => write!(f, "<{expr}>"),
        }
    }
}

/// String variables initialised from literals, e.g. `const char *p = "t.gz";`.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    strings: BTreeMap<String, String>,
}

fn string_binding_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"^\s*(?:static\s+)?(?:const\s+)?(?:char|auto)\s*(?:const\s*)?\*?\s*(?:const\s+)?([A-Za-z_]\w*)\s*(?:\[\s*\d*\s*\])?\s*=\s*"((?:[^"\\]|\\.)*)"\s*;\s*$"#,
        )
        .expect("static regex")
    })
}

impl Bindings {
    pub fn collect(body: &[Statement]) -> Self {
        let mut bindings = Bindings::default();
        walk_statements(body, &mut |stmt| {
            if let Statement::Raw(text) = stmt {
                if let Some(caps) = string_binding_regex().captures(text) {
                    bindings
                        .strings
                        .insert(caps[1].to_string(), caps[2].to_string());
                }
            }
        });
        bindings
    }

    /// Resolves an argument to a string value when it is a literal or a
    /// variable bound to one.
    pub fn resolve_string(&self, arg: &str) -> Option<String> {
        let arg = arg.trim();
        if let Some(literal) = unquote(arg) {
            return Some(literal);
        }
        self.strings.get(arg).cloned()
    }
}

/// Returns the contents of a single C string literal.
pub fn unquote(arg: &str) -> Option<String> {
    let arg = arg.trim();
    if arg.len() >= 2 && arg.starts_with('"') && arg.ends_with('"') {
        let inner = &arg[1..arg.len() - 1];
        if !inner.contains('"') || inner.contains("\\\"") {
            return Some(inner.to_string());
        }
    }
    None
}

const NULL_LITERALS: &[&str] = &["NULL", "Z_NULL", "nullptr", "0", "(void*)0", "(void *)0"];

pub fn is_null_literal(arg: &str) -> bool {
    NULL_LITERALS.contains(&arg.trim())
}

/// Normalises an argument that names a handle: `&strm` -> `strm`,
/// `(u_char *)dumper` -> `dumper`. Returns `None` for anything that is not a
/// plain variable or member path.
pub fn handle_name(arg: &str) -> Option<String> {
    let mut text = arg.trim();
    loop {
        if let Some(rest) = text.strip_prefix('&') {
            text = rest.trim_start();
            continue;
        }
        if text.starts_with('(') {
            let close = text.find(')')?;
            let inner = &text[1..close];
            let rest = text[close + 1..].trim_start();
            if inner.contains('(') {
                return None;
            }
            if rest.is_empty() {
                // Fully parenthesised: `(x)`.
                text = inner.trim();
            } else {
                // A cast: `(type *)x`.
                text = rest;
            }
            continue;
        }
        break;
    }
    if text.is_empty() || is_null_literal(text) {
        return None;
    }
    let valid = text
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' || c == '>');
    if valid { Some(text.to_string()) } else { None }
}

/// Visits every statement in program order, descending into guards and loops.
pub fn walk_statements<'a>(body: &'a [Statement], visit: &mut dyn FnMut(&'a Statement)) {
    for stmt in body {
        visit(stmt);
        match stmt {
            Statement::Guard {
                then_body,
                else_body,
                ..
            } => {
                walk_statements(then_body, visit);
                walk_statements(else_body, visit);
            }
            Statement::Loop { body, .. } => walk_statements(body, visit),
            _ => {}
        }
    }
}

/// Every `LibraryCall` in the body, condition calls included, in program order.
pub fn all_calls(body: &[Statement]) -> Vec<&LibraryCall> {
    let mut calls = Vec::new();
    walk_statements(body, &mut |stmt| match stmt {
        Statement::Call(call) => calls.push(call),
        Statement::Guard {
            condition_calls, ..
        }
        | Statement::Loop {
            condition_calls, ..
        } => calls.extend(condition_calls.iter()),
        _ => {}
    });
    calls
}

/// One generated or parsed seed: the unit of generation and of replay.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedRecord {
    metadata: SeedMetadata,
    target_library: TargetLibrary,
    includes: Vec<String>,
    prelude: String,
    body: Vec<Statement>,
    source: String,
}

impl SeedRecord {
    /// Builds a record and renders its source text.
    pub fn assemble(
        metadata: SeedMetadata,
        target_library: TargetLibrary,
        includes: Vec<String>,
        body: Vec<Statement>,
    ) -> Self {
        let mut record = Self {
            metadata,
            target_library,
            includes,
            prelude: String::new(),
            body,
            source: String::new(),
        };
        record.source = record.render();
        record
    }

    /// Attaches top-level code (helper callbacks, `#define`s) that must precede
    /// the sequence function.
    pub fn with_prelude(mut self, prelude: impl Into<String>) -> Self {
        self.prelude = prelude.into();
        self.source = self.render();
        self
    }

    /// Copies the record with new metadata and body, keeping includes and
    /// prelude.
    pub fn rebuild(&self, metadata: SeedMetadata, body: Vec<Statement>) -> Self {
        SeedRecord::assemble(metadata, self.target_library, self.includes.clone(), body)
            .with_prelude(self.prelude.clone())
    }

    /// Builds a record that keeps the text it was parsed from.
    pub(crate) fn from_parts(
        metadata: SeedMetadata,
        target_library: TargetLibrary,
        includes: Vec<String>,
        prelude: String,
        body: Vec<Statement>,
        source: String,
    ) -> Self {
        Self {
            metadata,
            target_library,
            includes,
            prelude,
            body,
            source,
        }
    }

    pub fn parse(text: &str) -> Result<Self, parse::ParseError> {
        parse::parse_seed(text)
    }

    pub fn id(&self) -> u64 {
        self.metadata.id
    }

    pub fn metadata(&self) -> &SeedMetadata {
        &self.metadata
    }

    pub fn target_library(&self) -> TargetLibrary {
        self.target_library
    }

    pub fn includes(&self) -> &[String] {
        &self.includes
    }

    pub fn prelude(&self) -> &str {
        &self.prelude
    }

    pub fn body(&self) -> &[Statement] {
        &self.body
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.source.as_bytes()
    }

    pub fn function_name(&self) -> String {
        self.target_library.function_name()
    }

    /// File name the seed is stored under in a corpus or build directory.
    pub fn file_stem(&self) -> String {
        format!("{}_{}", self.target_library.token(), self.metadata.id)
    }

    pub fn calls(&self) -> Vec<&LibraryCall> {
        all_calls(&self.body)
    }

    /// The ordered sequence of top-level call names, used for deduplication
    /// and API-triple extraction.
    pub fn call_sequence(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|call| call.function_name.clone())
            .collect()
    }

    /// Every function-call identifier in the body, including calls nested in
    /// arguments, conditions and raw statements.
    pub fn call_identifiers(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        walk_statements(&self.body, &mut |stmt| match stmt {
            Statement::Call(call) => collect_call_names(call, &mut names),
            Statement::Raw(text) => names.extend(parse::scan_call_identifiers(text)),
            Statement::Guard {
                condition,
                condition_calls,
                ..
            } => {
                names.extend(parse::scan_call_identifiers(condition));
                for call in condition_calls {
                    collect_call_names(call, &mut names);
                }
            }
            Statement::Loop {
                header,
                trailer,
                condition_calls,
                ..
            } => {
                names.extend(parse::scan_call_identifiers(header));
                if let Some(trailer) = trailer {
                    names.extend(parse::scan_call_identifiers(trailer));
                }
                for call in condition_calls {
                    collect_call_names(call, &mut names);
                }
            }
            Statement::Return(ReturnValue::Expr(expr)) => {
                names.extend(parse::scan_call_identifiers(expr))
            }
            Statement::Return(ReturnValue::Literal(_)) | Statement::Comment(_) => {}
        });
        names
    }

    pub fn bindings(&self) -> Bindings {
        Bindings::collect(&self.body)
    }

    /// Paths of every file the body creates, in first-creation order.
    pub fn temp_files(&self, model: &ResourceModel) -> Vec<TempPath> {
        let bindings = self.bindings();
        let mut seen = BTreeSet::new();
        let mut paths = Vec::new();
        for call in self.calls() {
            if let Some(path) = created_path(call, model, &bindings) {
                if seen.insert(path.clone()) {
                    paths.push(path);
                }
            }
        }
        paths
    }

    pub fn has_edge_cases(&self) -> bool {
        self.calls().iter().any(|call| call.edge_case.is_some())
    }

    /// Emits the seed source-file format: includes, metadata header, then the
    /// single sequence function.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for include in &self.includes {
            out.push_str(&format!("#include {include}\n"));
        }
        if !self.includes.is_empty() {
            out.push('\n');
        }
        out.push_str(&render_metadata(&self.metadata));
        let prelude = self.prelude.trim();
        if !prelude.is_empty() {
            out.push('\n');
            out.push_str(prelude);
            out.push_str("\n\n");
        }
        out.push_str(&format!("int {}() {{\n", self.function_name()));
        render_block(&self.body, 1, &mut out);
        out.push_str("}\n");
        out
    }
}

impl fmt::Display for SeedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn collect_call_names(call: &LibraryCall, names: &mut BTreeSet<String>) {
    names.insert(call.function_name.clone());
    for arg in &call.arguments {
        names.extend(parse::scan_call_identifiers(arg));
    }
}

/// The file a call creates, if it is a creator and its mode opens for writing.
pub fn created_path(
    call: &LibraryCall,
    model: &ResourceModel,
    bindings: &Bindings,
) -> Option<TempPath> {
    let spec = model.temp_creator(&call.function_name)?;
    let path_arg = call.arguments.get(spec.path_arg)?;
    if let Some(mode_idx) = spec.mode_arg {
        if let Some(mode) = call
            .arguments
            .get(mode_idx)
            .and_then(|m| bindings.resolve_string(m))
        {
            if !mode.contains('w') && !mode.contains('a') {
                return None;
            }
        }
    }
    match bindings.resolve_string(path_arg) {
        Some(path) if path.is_empty() || path.starts_with(":memory:") => None,
        Some(path) => Some(TempPath::Literal(path)),
        None => Some(TempPath::Unresolved(path_arg.trim().to_string())),
    }
}

/// The file a call removes, if it is a remover.
pub fn removed_path(
    call: &LibraryCall,
    model: &ResourceModel,
    bindings: &Bindings,
) -> Option<TempPath> {
    let spec = model.temp_remover(&call.function_name)?;
    let path_arg = call.arguments.get(spec.path_arg)?;
    Some(match bindings.resolve_string(path_arg) {
        Some(path) => TempPath::Literal(path),
        None => TempPath::Unresolved(path_arg.trim().to_string()),
    })
}

fn render_metadata(metadata: &SeedMetadata) -> String {
    let quality = metadata
        .quality
        .as_ref()
        .and_then(|q| serde_json::to_string(q).ok())
        .unwrap_or_else(|| "{}".to_string());
    format!(
        "//<ID> {}\n//<Prompt> {}\n/*<Combination>: [{}]\n*/\n//<score> {}, nr_unique_branch: {}\n//<Quality> {}\n",
        metadata.id,
        metadata.prompt,
        metadata.combination.join(", "),
        metadata.score,
        metadata.unique_branch_count,
        quality
    )
}

fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

fn render_block(body: &[Statement], depth: usize, out: &mut String) {
    let pad = indent(depth);
    for stmt in body {
        match stmt {
            Statement::Call(call) => {
                if let Some(tag) = &call.edge_case {
                    out.push_str(&format!("{pad}{}\n", tag.comment_line()));
                }
                out.push_str(&format!("{pad}{}\n", call.statement()));
            }
            Statement::Raw(text) | Statement::Comment(text) => {
                for line in text.lines() {
                    out.push_str(&format!("{pad}{}\n", line.trim_end()));
                }
            }
            Statement::Guard {
                condition,
                condition_calls,
                then_body,
                else_body,
            } => {
                for call in condition_calls {
                    if let Some(tag) = &call.edge_case {
                        out.push_str(&format!("{pad}{}\n", tag.comment_line()));
                    }
                }
                out.push_str(&format!("{pad}if ({condition}) {{\n"));
                render_block(then_body, depth + 1, out);
                if else_body.is_empty() {
                    out.push_str(&format!("{pad}}}\n"));
                } else {
                    out.push_str(&format!("{pad}}} else {{\n"));
                    render_block(else_body, depth + 1, out);
                    out.push_str(&format!("{pad}}}\n"));
                }
            }
            Statement::Loop {
                header,
                trailer,
                body,
                ..
            } => {
                out.push_str(&format!("{pad}{header} {{\n"));
                render_block(body, depth + 1, out);
                match trailer {
                    Some(trailer) => out.push_str(&format!("{pad}}} {trailer}\n")),
                    None => out.push_str(&format!("{pad}}}\n")),
                }
            }
            Statement::Return(ReturnValue::Literal(value)) => {
                out.push_str(&format!("{pad}return {value};\n"))
            }
            Statement::Return(ReturnValue::Expr(expr)) if expr.is_empty() => {
                out.push_str(&format!("{pad}return;\n"))
            }
            Statement::Return(ReturnValue::Expr(expr)) => {
                out.push_str(&format!("{pad}return {expr};\n"))
            }
        }
    }
}

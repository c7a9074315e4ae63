//! Message template rendering.
//!
//! Two notations are accepted in the same template: the legacy `$(NAME)` form
//! and handlebars `{{name}}`. Legacy placeholders are rewritten to handlebars
//! before anything is compiled, so both render identically.

mod helpers;

use handlebars::Handlebars;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("template syntax error: {0}")]
    Syntax(String),
    #[error("template render error: {0}")]
    Render(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    pub valid: bool,
    pub missing_variables: Vec<String>,
    pub syntax_errors: Vec<String>,
}

const BLOCK_KEYWORDS: &[&str] = &["if", "unless", "each", "with", "else", "lookup", "log"];

fn legacy_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\(([A-Za-z_][A-Za-z0-9_]*)\)").expect("static regex"))
}

fn mustache_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\{?~?([^{}]*?)~?\}?\}\}").expect("static regex"))
}

fn identifier_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*").expect("static regex"))
}

/// Rewrites `$(NAME)` placeholders into `{{NAME}}`.
pub fn normalize(template: &str) -> String {
    legacy_pattern()
        .replace_all(template, "{{$1}}")
        .into_owned()
}

#[derive(Clone)]
pub struct TemplateEngine {
    registry: Handlebars<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        // Bodies are HTML authored by the campaign owner.
        registry.register_escape_fn(handlebars::no_escape);
        registry.set_strict_mode(false);
        helpers::register(&mut registry);
        Self { registry }
    }

    /// Renders `template` against `data`. Variables absent from `data` render
    /// as the empty string.
    pub fn render(&self, template: &str, data: &Map<String, Value>) -> Result<String, TemplateError> {
        let source = normalize(template);
        check_syntax(&source)?;
        self.registry
            .render_template(&source, data)
            .map_err(|e| TemplateError::Render(e.to_string()))
    }

    pub fn render_subject(
        &self,
        subject: &str,
        data: &Map<String, Value>,
    ) -> Result<String, TemplateError> {
        let rendered = self.render(subject, data)?;
        // Header values cannot carry line breaks.
        Ok(rendered.replace(['\r', '\n'], " ").trim().to_string())
    }

    /// Names referenced by `template`, in sorted order. Helper names, block
    /// keywords, literals and `this` are excluded; arguments of blocks and
    /// helpers are included.
    pub fn extract_variables(&self, template: &str) -> BTreeSet<String> {
        let source = normalize(template);
        let mut out = BTreeSet::new();

        for cap in mustache_pattern().captures_iter(&source) {
            let inner = cap[1].trim();
            if inner.is_empty() || inner.starts_with('!') || inner.starts_with('>') {
                continue;
            }

            let is_block = inner.starts_with('#') || inner.starts_with('^');
            if inner.starts_with('/') {
                continue;
            }
            let inner = inner.trim_start_matches(['#', '^']).trim();

            let tokens = split_tokens(inner);
            let Some(head) = tokens.first() else {
                continue;
            };

            let head_is_call = is_block
                || BLOCK_KEYWORDS.contains(&head.as_str())
                || helpers::is_helper(head);

            let args = if head_is_call || tokens.len() > 1 {
                &tokens[1..]
            } else {
                &tokens[..]
            };
            collect_variables(args, &mut out);
        }

        out
    }

    /// Checks `template` for syntax errors and for variables not present in
    /// `columns`.
    pub fn validate(&self, template: &str, columns: &[String]) -> Validation {
        let mut syntax_errors = Vec::new();
        if let Err(e) = check_syntax(&normalize(template)) {
            syntax_errors.push(e.to_string());
        }

        let missing_variables: Vec<String> = self
            .extract_variables(template)
            .into_iter()
            .filter(|v| !columns.iter().any(|c| c == v))
            .collect();

        Validation {
            valid: missing_variables.is_empty() && syntax_errors.is_empty(),
            missing_variables,
            syntax_errors,
        }
    }

    /// Renders `template` with generated sample values, overridden by any
    /// caller-supplied values.
    pub fn preview(
        &self,
        template: &str,
        overrides: Option<&HashMap<String, Value>>,
    ) -> Result<String, TemplateError> {
        let mut data = Map::new();
        for name in self.extract_variables(template) {
            let sample = sample_value(&name);
            data.insert(name, Value::String(sample));
        }
        if let Some(overrides) = overrides {
            for (k, v) in overrides {
                data.insert(k.clone(), v.clone());
            }
        }
        self.render(template, &data)
    }
}

fn check_syntax(source: &str) -> Result<(), TemplateError> {
    handlebars::Template::compile(source)
        .map(|_| ())
        .map_err(|e| TemplateError::Syntax(e.to_string()))
}

/// Splits a mustache body on whitespace, keeping quoted strings and
/// parenthesised sub-expressions intact.
fn split_tokens(inner: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;

    for ch in inner.chars() {
        if let Some(q) = quote {
            current.push(ch);
            if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => {
                quote = Some(ch);
                current.push(ch);
            }
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            c if c.is_whitespace() && depth == 0 => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn collect_variables(args: &[String], out: &mut BTreeSet<String>) {
    for arg in args {
        if arg == "as" {
            // `{{#each items as |item|}}` block parameters
            break;
        }
        let value = arg.split_once('=').map(|(_, v)| v).unwrap_or(arg);
        if let Some(sub) = value.strip_prefix('(').and_then(|v| v.strip_suffix(')')) {
            // Sub-expression: the first token names a helper.
            let tokens = split_tokens(sub);
            if tokens.len() > 1 {
                collect_variables(&tokens[1..], out);
            }
            continue;
        }
        if let Some(name) = variable_name(value) {
            out.insert(name);
        }
    }
}

fn variable_name(token: &str) -> Option<String> {
    let token = token.trim();
    if token.is_empty()
        || token.starts_with('"')
        || token.starts_with('\'')
        || token.starts_with('@')
        || token.starts_with("../")
        || token.starts_with(|c: char| c.is_ascii_digit() || c == '-')
    {
        return None;
    }
    if matches!(token, "true" | "false" | "null" | "undefined" | "else") {
        return None;
    }

    let root = token.split(['.', '/', '[']).next().unwrap_or(token);
    if root == "this" {
        return None;
    }
    let m = identifier_pattern().find(root)?;
    if m.end() != root.len() {
        return None;
    }
    Some(root.to_string())
}

/// Deterministic placeholder for a variable, chosen by its name.
pub fn sample_value(name: &str) -> String {
    let lower = name.to_lowercase();
    if lower.contains("name") {
        "Jane Doe".to_string()
    } else if lower.contains("email") {
        "sample@example.com".to_string()
    } else if lower.contains("company") {
        "Sample Company".to_string()
    } else if lower.contains("date") {
        "2025-01-01".to_string()
    } else if lower.contains("amount") || lower.contains("price") {
        "100,000".to_string()
    } else if lower.contains("phone") || lower.contains("tel") {
        "010-1234-5678".to_string()
    } else {
        format!("[{name}]")
    }
}

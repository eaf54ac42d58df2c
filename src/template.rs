//! Template Engine (C9): resolves `{{var}}`, `{{#if}}/{{else}}/{{/if}}`,
//! `{{#each}}/{{this}}/{{@index}}/{{/each}}`, `{{include-section:...}}` and
//! `{{safe_include(...)}}` placeholders in composed content.
//!
//! Implemented in the same hand-rolled-regex tokenize/parse/render style
//! as `edison_core::section`, rather than pulling in a general templating
//! crate for four small constructs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("unclosed {{{{#if {0}}}}} block")]
    UnclosedIf(String),
    #[error("unclosed {{{{#each {0}}}}} block")]
    UnclosedEach(String),
    #[error("{{{{else}}}} or closing tag with no matching opening block")]
    DanglingCloser,
}

/// Resolves `{{include-section:path#section}}` against whatever
/// cross-entity composition state the caller has on hand.
pub type IncludeProvider = Arc<dyn Fn(&str, &str) -> Option<String> + Send + Sync>;

/// Everything a render pass needs beyond the always-injected context
/// variables: where `safe_include` may read from, and how
/// `include-section` resolves.
pub struct RenderOptions {
    pub strict: bool,
    pub include_root: Option<PathBuf>,
    pub include_provider: Option<IncludeProvider>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            strict: false,
            include_root: None,
            include_provider: None,
        }
    }
}

/// Always-injected context variables, per the documented list.
#[must_use]
pub fn base_context(
    name: &str,
    content_type: &str,
    source_layers: &str,
    version: &str,
    template: &str,
    output_dir: &str,
    output_path: &str,
    project_edison_dir: &str,
) -> Map<String, Value> {
    let mut vars = Map::new();
    vars.insert("name".into(), name.into());
    vars.insert("content_type".into(), content_type.into());
    vars.insert("source_layers".into(), source_layers.into());
    vars.insert("timestamp".into(), chrono::Utc::now().to_rfc3339().into());
    vars.insert("version".into(), version.into());
    vars.insert("template".into(), template.into());
    vars.insert("output_dir".into(), output_dir.into());
    vars.insert("output_path".into(), output_path.into());
    vars.insert("PROJECT_EDISON_DIR".into(), project_edison_dir.into());
    vars
}

#[derive(Clone, Debug)]
enum Token {
    Text(String),
    Var(String),
    If(String),
    Else,
    IfEnd,
    Each(String),
    EachEnd,
    IncludeSection(String, String),
    SafeInclude(String, Option<String>),
}

#[derive(Clone, Debug)]
enum Node {
    Text(String),
    Var(String),
    If {
        expr: String,
        then_nodes: Vec<Node>,
        else_nodes: Vec<Node>,
    },
    Each {
        expr: String,
        body: Vec<Node>,
    },
    IncludeSection(String, String),
    SafeInclude(String, Option<String>),
}

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{(.*?)\}\}").expect("TAG regex is valid"));
static SAFE_INCLUDE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^safe_include\(\s*([^,)]+?)\s*(?:,\s*fallback\s*=\s*"([^"]*)")?\s*\)$"#)
        .expect("SAFE_INCLUDE regex is valid")
});
static INCLUDE_SECTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^include-section:([^#]+)#(.+)$").expect("INCLUDE_SECTION regex is valid")
});

fn tokenize(template: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut last_end = 0usize;
    for caps in TAG.captures_iter(template) {
        let m = caps.get(0).expect("whole match always present");
        if m.start() > last_end {
            tokens.push(Token::Text(template[last_end..m.start()].to_owned()));
        }
        let inner = caps[1].trim();
        tokens.push(classify(inner));
        last_end = m.end();
    }
    if last_end < template.len() {
        tokens.push(Token::Text(template[last_end..].to_owned()));
    }
    tokens
}

fn classify(inner: &str) -> Token {
    if let Some(rest) = inner.strip_prefix("#if ") {
        return Token::If(rest.trim().to_owned());
    }
    if inner == "else" {
        return Token::Else;
    }
    if inner == "/if" {
        return Token::IfEnd;
    }
    if let Some(rest) = inner.strip_prefix("#each ") {
        return Token::Each(rest.trim().to_owned());
    }
    if inner == "/each" {
        return Token::EachEnd;
    }
    if let Some(caps) = INCLUDE_SECTION.captures(inner) {
        return Token::IncludeSection(caps[1].trim().to_owned(), caps[2].trim().to_owned());
    }
    if let Some(caps) = SAFE_INCLUDE.captures(inner) {
        let fallback = caps.get(2).map(|m| m.as_str().to_owned());
        return Token::SafeInclude(caps[1].trim().to_owned(), fallback);
    }
    Token::Var(inner.to_owned())
}

fn parse_nodes(tokens: &[Token], idx: &mut usize) -> Result<Vec<Node>, TemplateError> {
    let mut nodes = Vec::new();
    while *idx < tokens.len() {
        match &tokens[*idx] {
            Token::Text(t) => {
                nodes.push(Node::Text(t.clone()));
                *idx += 1;
            }
            Token::Var(p) => {
                nodes.push(Node::Var(p.clone()));
                *idx += 1;
            }
            Token::IncludeSection(path, section) => {
                nodes.push(Node::IncludeSection(path.clone(), section.clone()));
                *idx += 1;
            }
            Token::SafeInclude(path, fallback) => {
                nodes.push(Node::SafeInclude(path.clone(), fallback.clone()));
                *idx += 1;
            }
            Token::If(expr) => {
                let expr = expr.clone();
                *idx += 1;
                let then_nodes = parse_nodes(tokens, idx)?;
                let mut else_nodes = Vec::new();
                if matches!(tokens.get(*idx), Some(Token::Else)) {
                    *idx += 1;
                    else_nodes = parse_nodes(tokens, idx)?;
                }
                match tokens.get(*idx) {
                    Some(Token::IfEnd) => *idx += 1,
                    _ => return Err(TemplateError::UnclosedIf(expr)),
                }
                nodes.push(Node::If {
                    expr,
                    then_nodes,
                    else_nodes,
                });
            }
            Token::Each(expr) => {
                let expr = expr.clone();
                *idx += 1;
                let body = parse_nodes(tokens, idx)?;
                match tokens.get(*idx) {
                    Some(Token::EachEnd) => *idx += 1,
                    _ => return Err(TemplateError::UnclosedEach(expr)),
                }
                nodes.push(Node::Each { expr, body });
            }
            Token::Else | Token::IfEnd | Token::EachEnd => break,
        }
    }
    Ok(nodes)
}

fn parse(template: &str) -> Result<Vec<Node>, TemplateError> {
    let tokens = tokenize(template);
    let mut idx = 0;
    let nodes = parse_nodes(&tokens, &mut idx)?;
    if idx != tokens.len() {
        return Err(TemplateError::DanglingCloser);
    }
    Ok(nodes)
}

fn resolve(path: &str, vars: &Map<String, Value>) -> Option<Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = vars.get(first)?.clone();
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?.clone(),
            Value::Array(arr) => part.parse::<usize>().ok().and_then(|i| arr.get(i).cloned())?,
            _ => return None,
        };
    }
    Some(current)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn safe_include(root: &Path, rel_path: &str) -> Option<String> {
    let candidate = root.join(rel_path);
    let canonical_root = root.canonicalize().ok()?;
    let canonical = candidate.canonicalize().ok()?;
    if !canonical.starts_with(&canonical_root) {
        return None;
    }
    std::fs::read_to_string(canonical).ok()
}

fn render_nodes(
    nodes: &[Node],
    vars: &Map<String, Value>,
    opts: &RenderOptions,
    diagnostics: &mut Vec<String>,
) -> String {
    let mut out = String::new();
    for node in nodes {
        match node {
            Node::Text(t) => out.push_str(t),
            Node::Var(path) => match resolve(path, vars) {
                Some(v) => out.push_str(&stringify(&v)),
                None => {
                    diagnostics.push(format!("unresolved variable: {{{{{path}}}}}"));
                    if opts.strict {
                        out.push_str(&format!("{{{{{path}}}}}"));
                    }
                }
            },
            Node::If {
                expr,
                then_nodes,
                else_nodes,
            } => {
                let truthy = resolve(expr, vars).as_ref().is_some_and(is_truthy);
                let branch = if truthy { then_nodes } else { else_nodes };
                out.push_str(&render_nodes(branch, vars, opts, diagnostics));
            }
            Node::Each { expr, body } => match resolve(expr, vars).and_then(|v| v.as_array().cloned()) {
                Some(items) if !items.is_empty() => {
                    for (index, item) in items.iter().enumerate() {
                        let mut scope = vars.clone();
                        scope.insert("this".into(), item.clone());
                        scope.insert("@index".into(), Value::from(index));
                        out.push_str(&render_nodes(body, &scope, opts, diagnostics));
                    }
                }
                _ => {}
            },
            Node::IncludeSection(path, section) => {
                let resolved = opts
                    .include_provider
                    .as_ref()
                    .and_then(|provider| provider(path, section));
                match resolved {
                    Some(content) => out.push_str(&content),
                    None => diagnostics.push(format!("missing include-section: {path}#{section}")),
                }
            }
            Node::SafeInclude(rel_path, fallback) => {
                let resolved = opts
                    .include_root
                    .as_deref()
                    .and_then(|root| safe_include(root, rel_path));
                match resolved {
                    Some(content) => out.push_str(&content),
                    None => {
                        if rel_path.contains("..") {
                            diagnostics.push(format!("path traversal blocked: {rel_path}"));
                        }
                        out.push_str(fallback.as_deref().unwrap_or(""));
                    }
                }
            }
        }
    }
    out
}

/// Render `template` against `vars`, returning the rendered text plus any
/// diagnostics (unresolved variables, missing includes, blocked traversal).
pub fn render(
    template: &str,
    vars: &Map<String, Value>,
    opts: &RenderOptions,
) -> Result<(String, Vec<String>), TemplateError> {
    let nodes = parse(template)?;
    let mut diagnostics = Vec::new();
    let rendered = render_nodes(&nodes, vars, opts, &mut diagnostics);
    Ok((rendered, diagnostics))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn vars(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), v.clone())).collect()
    }

    #[test]
    fn substitutes_a_plain_variable() {
        let (out, diags) = render("hello {{name}}", &vars(&[("name", "world".into())]), &RenderOptions::default()).unwrap();
        assert_eq!(out, "hello world");
        assert!(diags.is_empty());
    }

    #[test]
    fn missing_variable_emits_empty_and_a_diagnostic_by_default() {
        let (out, diags) = render("hi {{missing}}!", &vars(&[]), &RenderOptions::default()).unwrap();
        assert_eq!(out, "hi !");
        assert_eq!(diags.len(), 1);
    }

    #[test]
    fn strict_mode_leaves_the_placeholder_intact() {
        let opts = RenderOptions {
            strict: true,
            ..RenderOptions::default()
        };
        let (out, _) = render("hi {{missing}}!", &vars(&[]), &opts).unwrap();
        assert_eq!(out, "hi {{missing}}!");
    }

    #[test]
    fn if_else_picks_the_truthy_branch() {
        let (out, _) = render(
            "{{#if flag}}yes{{else}}no{{/if}}",
            &vars(&[("flag", Value::Bool(true))]),
            &RenderOptions::default(),
        )
        .unwrap();
        assert_eq!(out, "yes");

        let (out, _) = render(
            "{{#if flag}}yes{{else}}no{{/if}}",
            &vars(&[("flag", Value::Bool(false))]),
            &RenderOptions::default(),
        )
        .unwrap();
        assert_eq!(out, "no");
    }

    #[test]
    fn each_iterates_with_this_and_index() {
        let items: Value = serde_json::json!(["a", "b", "c"]);
        let (out, _) = render(
            "{{#each items}}{{@index}}:{{this}} {{/each}}",
            &vars(&[("items", items)]),
            &RenderOptions::default(),
        )
        .unwrap();
        assert_eq!(out, "0:a 1:b 2:c ");
    }

    #[test]
    fn nested_each_is_supported() {
        let items: Value = serde_json::json!([{"tags": ["x", "y"]}, {"tags": ["z"]}]);
        let (out, _) = render(
            "{{#each items}}[{{#each this.tags}}{{this}}{{/each}}]{{/each}}",
            &vars(&[("items", items)]),
            &RenderOptions::default(),
        )
        .unwrap();
        assert_eq!(out, "[xy][z]");
    }

    #[test]
    fn missing_each_list_yields_empty_output() {
        let (out, _) = render("before{{#each missing}}x{{/each}}after", &vars(&[]), &RenderOptions::default()).unwrap();
        assert_eq!(out, "beforeafter");
    }

    #[test]
    fn safe_include_reads_a_relative_file() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("snippet.md"), "included text").unwrap();
        let opts = RenderOptions {
            include_root: Some(tmp.path().to_owned()),
            ..RenderOptions::default()
        };
        let (out, _) = render(
            r#"{{safe_include(snippet.md, fallback="none")}}"#,
            &vars(&[]),
            &opts,
        )
        .unwrap();
        assert_eq!(out, "included text");
    }

    #[test]
    fn safe_include_blocks_path_traversal() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("secret.md"), "should not leak").unwrap();
        let outside = TempDir::new().unwrap();
        let opts = RenderOptions {
            include_root: Some(outside.path().to_owned()),
            ..RenderOptions::default()
        };
        let (out, diags) = render(
            r#"{{safe_include(../secret.md, fallback="blocked")}}"#,
            &vars(&[]),
            &opts,
        )
        .unwrap();
        assert_eq!(out, "blocked");
        assert!(diags.iter().any(|d| d.contains("traversal")));
    }

    #[test]
    fn include_section_uses_the_supplied_provider() {
        let provider: IncludeProvider = Arc::new(|path, section| {
            if path == "agents/foo" && section == "body" {
                Some("provided content".to_owned())
            } else {
                None
            }
        });
        let opts = RenderOptions {
            include_provider: Some(provider),
            ..RenderOptions::default()
        };
        let (out, _) = render("{{include-section:agents/foo#body}}", &vars(&[]), &opts).unwrap();
        assert_eq!(out, "provided content");
    }

    #[test]
    fn unclosed_if_is_a_parse_error() {
        let err = render("{{#if x}}unterminated", &vars(&[]), &RenderOptions::default()).unwrap_err();
        assert!(matches!(err, TemplateError::UnclosedIf(_)));
    }
}

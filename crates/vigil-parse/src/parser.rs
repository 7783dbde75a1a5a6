use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use streaming_iterator::StreamingIterator;
use thiserror::Error;
use tree_sitter::{Node, Parser, QueryCursor};
use vigil_core::{
    CallSite, Language, ParseIssue, SymbolDescriptor, SymbolTable, content_hash, normalize_path,
};

use crate::registry::{LanguageConfig, LanguageRegistry, QueryCaptures, default_registry};

const ISSUE_SNIPPET_CHARS: usize = 40;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported language or file extension: {0}")]
    UnsupportedLanguage(String),
    #[error("failed to load {0} tree-sitter grammar")]
    Grammar(&'static str),
    #[error("tree-sitter parser produced no syntax tree for {0}")]
    NoTree(String),
}

/// A symbol defined twice in the same scope; the later definition wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redefinition {
    pub qualified_name: String,
    pub first_line: usize,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFile {
    pub table: SymbolTable,
    pub redefinitions: Vec<Redefinition>,
}

pub struct SymbolExtractor {
    registry: Arc<LanguageRegistry>,
    parsers: HashMap<&'static str, Parser>,
}

impl SymbolExtractor {
    pub fn new() -> Result<Self, ExtractError> {
        Self::with_registry(Arc::new(default_registry()))
    }

    pub fn with_registry(registry: Arc<LanguageRegistry>) -> Result<Self, ExtractError> {
        let mut parsers = HashMap::new();

        for config in registry.configs() {
            let mut parser = Parser::new();
            parser
                .set_language(&config.ts_language)
                .map_err(|_| ExtractError::Grammar(config.id))?;
            parsers.insert(config.id, parser);
        }

        Ok(Self { registry, parsers })
    }

    pub fn extract(
        &mut self,
        language: Language,
        file_path: &str,
        source: &str,
    ) -> Result<SymbolTable, ExtractError> {
        Ok(self.extract_file(language, file_path, source)?.table)
    }

    pub fn extract_file(
        &mut self,
        language: Language,
        file_path: &str,
        source: &str,
    ) -> Result<ExtractedFile, ExtractError> {
        let normalized_file_path = normalize_path(file_path);
        let config_id = self
            .registry
            .get_by_language(language)
            .map(|config| config.id)
            .ok_or_else(|| ExtractError::UnsupportedLanguage(language.as_str().to_owned()))?;

        extract_with_config(
            &self.registry,
            &mut self.parsers,
            &normalized_file_path,
            source,
            config_id,
        )
    }

    pub fn extract_from_path(
        &mut self,
        path: &Path,
        source: &str,
    ) -> Result<ExtractedFile, ExtractError> {
        let file_path = normalize_path(&path.to_string_lossy());
        let config_id = self
            .registry
            .get_by_path(path)
            .map(|config| config.id)
            .ok_or_else(|| ExtractError::UnsupportedLanguage(path.display().to_string()))?;

        extract_with_config(
            &self.registry,
            &mut self.parsers,
            &file_path,
            source,
            config_id,
        )
    }
}

pub fn language_for_path(path: &Path) -> Option<Language> {
    let ext = path.extension()?.to_string_lossy().to_ascii_lowercase();
    match ext.as_str() {
        "py" | "pyi" => Some(Language::Python),
        _ => None,
    }
}

fn extract_with_config(
    registry: &LanguageRegistry,
    parsers: &mut HashMap<&'static str, Parser>,
    file_path: &str,
    source: &str,
    config_id: &'static str,
) -> Result<ExtractedFile, ExtractError> {
    let config = registry
        .configs()
        .iter()
        .find(|config| config.id == config_id)
        .ok_or_else(|| ExtractError::UnsupportedLanguage(config_id.to_owned()))?;
    let parser = parsers
        .get_mut(config.id)
        .ok_or(ExtractError::Grammar(config.id))?;

    let tree = parser
        .parse(source, None)
        .ok_or_else(|| ExtractError::NoTree(file_path.to_owned()))?;

    let root = tree.root_node();
    let source_bytes = source.as_bytes();

    let mut table = SymbolTable::new(config.language, file_path);
    let mut redefinitions = Vec::new();
    for symbol in extract_symbols(file_path, source_bytes, root, config) {
        let qualified_name = symbol.qualified_name.clone();
        let line = symbol.start_line;
        if let Some(previous) = table.insert(symbol) {
            redefinitions.push(Redefinition {
                qualified_name,
                first_line: previous.start_line,
                line,
            });
        }
    }

    let mut calls = extract_calls(file_path, source_bytes, root, config);
    calls.sort_by(|left, right| {
        left.line
            .cmp(&right.line)
            .then_with(|| left.callee.cmp(&right.callee))
    });
    table.calls = calls;
    table.parse_issues = collect_parse_issues(root, source_bytes);

    Ok(ExtractedFile {
        table,
        redefinitions,
    })
}

fn extract_symbols(
    file_path: &str,
    source: &[u8],
    root: Node<'_>,
    config: &LanguageConfig,
) -> Vec<SymbolDescriptor> {
    let mut cursor = QueryCursor::new();
    let mut symbols = Vec::new();

    let mut query_matches = cursor.matches(&config.symbol_query, root, source);
    while let Some(matched) = query_matches.next() {
        let captures = QueryCaptures::new(&config.symbol_query, matched.captures);
        if let Some(symbol) = config.hooks.map_symbol(&captures, source, file_path) {
            symbols.push(symbol);
        }
    }

    // Matches arrive in document order except for nesting; redefinitions must
    // resolve to the textually last definition.
    symbols.sort_by_key(|symbol| symbol.start_line);
    symbols
}

fn extract_calls(
    file_path: &str,
    source: &[u8],
    root: Node<'_>,
    config: &LanguageConfig,
) -> Vec<CallSite> {
    let mut cursor = QueryCursor::new();
    let mut calls = Vec::new();

    let mut query_matches = cursor.matches(&config.call_query, root, source);
    while let Some(matched) = query_matches.next() {
        let captures = QueryCaptures::new(&config.call_query, matched.captures);
        if let Some(call) = config.hooks.map_call(&captures, source, file_path) {
            calls.push(call);
        }
    }

    calls
}

fn collect_parse_issues(root: Node<'_>, source: &[u8]) -> Vec<ParseIssue> {
    if !root.has_error() {
        return Vec::new();
    }

    let mut issues = Vec::new();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node.is_missing() {
            issues.push(parse_issue(node, format!("missing `{}`", node.kind())));
            continue;
        }
        if node.is_error() {
            let snippet = issue_snippet(&node_text(node, source));
            let message = if snippet.is_empty() {
                "unexpected syntax".to_owned()
            } else {
                format!("unexpected `{snippet}`")
            };
            issues.push(parse_issue(node, message));
            continue;
        }
        if !node.has_error() {
            continue;
        }

        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            stack.push(child);
        }
    }

    issues.sort_by(|left, right| (left.line, left.column).cmp(&(right.line, right.column)));
    issues
}

fn parse_issue(node: Node<'_>, message: String) -> ParseIssue {
    let start = node.start_position();
    ParseIssue {
        line: start.row + 1,
        column: start.column + 1,
        message,
    }
}

fn issue_snippet(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or_default().trim();
    first_line.chars().take(ISSUE_SNIPPET_CHARS).collect()
}

/// Hashes a canonical rendering of `nodes`: node kinds and leaf tokens only, so
/// whitespace and layout never contribute. Nodes for which `skip` returns true
/// are left out together with their subtrees.
pub(crate) fn canonical_hash(
    nodes: &[Node<'_>],
    source: &[u8],
    skip: &dyn Fn(Node<'_>) -> bool,
) -> String {
    let mut rendered = String::new();
    for node in nodes {
        render_canonical(*node, source, skip, &mut rendered);
    }
    content_hash(&rendered)
}

fn render_canonical(
    node: Node<'_>,
    source: &[u8],
    skip: &dyn Fn(Node<'_>) -> bool,
    out: &mut String,
) {
    if skip(node) {
        return;
    }

    if node.child_count() == 0 {
        out.push_str(&node_text(node, source));
        out.push(' ');
        return;
    }

    out.push('(');
    out.push_str(node.kind());
    out.push(' ');
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        render_canonical(child, source, skip, out);
    }
    out.push(')');
}

pub(crate) fn named_child_text(node: Node<'_>, field_name: &str, source: &[u8]) -> Option<String> {
    let child = node.child_by_field_name(field_name)?;
    let text = node_text(child, source);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

pub(crate) fn node_text(node: Node<'_>, source: &[u8]) -> String {
    byte_range_text(source, node.start_byte(), node.end_byte())
}

pub(crate) fn start_line(node: Node<'_>) -> usize {
    node.start_position().row + 1
}

fn byte_range_text(source: &[u8], start: usize, end: usize) -> String {
    if start >= end || end > source.len() {
        return String::new();
    }
    String::from_utf8_lossy(&source[start..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use vigil_core::{ParameterKind, SymbolKind};

    use super::*;

    fn extract(path: &str, source: &str) -> ExtractedFile {
        let mut extractor = SymbolExtractor::new().expect("extractor");
        extractor
            .extract_file(Language::Python, path, source)
            .expect("extract")
    }

    #[test]
    fn extracts_functions_classes_and_methods_with_scoped_names() {
        let source = r#"
def login(username, password):
    return check(username, password)

class Service:
    def login(self, username, password=None, *extra, remember: bool = False, **options):
        def audit():
            pass
        return audit()
"#;

        let extracted = extract("app/auth.py", source);
        let table = &extracted.table;

        let names = table
            .iter()
            .map(|symbol| (symbol.qualified_name.as_str(), symbol.kind))
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                ("app.auth::Service", SymbolKind::Class),
                ("app.auth::Service::login", SymbolKind::Method),
                ("app.auth::Service::login::audit", SymbolKind::Function),
                ("app.auth::login", SymbolKind::Function),
            ]
        );

        let method = table.get("app.auth::Service::login").expect("method");
        let kinds = method
            .signature
            .parameters
            .iter()
            .map(|param| (param.name.as_str(), param.kind, param.has_default))
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                ("self", ParameterKind::Positional, false),
                ("username", ParameterKind::Positional, false),
                ("password", ParameterKind::Positional, true),
                ("extra", ParameterKind::VarPositional, false),
                ("remember", ParameterKind::KeywordOnly, true),
                ("options", ParameterKind::VarKeyword, false),
            ]
        );
        assert_eq!(
            method.signature.parameters[4].annotation.as_deref(),
            Some("bool")
        );
        assert_eq!(method.start_line, 6);
        assert!(!table.is_degraded());
    }

    #[test]
    fn identity_and_body_hash_ignore_whitespace_comments_and_docstrings() {
        let original = "def total(items):\n    return sum(items)\n";
        let reformatted = r#"


def total(items):
    """Sum all items."""
    # running total
    return sum( items )   # trailing comment
"#;

        let left = extract("calc.py", original).table;
        let right = extract("calc.py", reformatted).table;

        let left_symbol = left.get("calc::total").expect("left total");
        let right_symbol = right.get("calc::total").expect("right total");
        assert_eq!(left_symbol.body_hash, right_symbol.body_hash);
        assert_eq!(left_symbol.signature, right_symbol.signature);
        assert_ne!(left_symbol.start_line, right_symbol.start_line);
    }

    #[test]
    fn body_hash_changes_with_executable_content_and_block_structure() {
        let base = "def run(flag):\n    if flag:\n        setup()\n    teardown()\n";
        let edited = "def run(flag):\n    if flag:\n        setup()\n    teardown(1)\n";
        let dedented = "def run(flag):\n    if flag:\n        setup()\n        teardown()\n";

        let base_hash = extract("job.py", base).table.get("job::run").cloned();
        let edited_hash = extract("job.py", edited).table.get("job::run").cloned();
        let dedented_hash = extract("job.py", dedented).table.get("job::run").cloned();

        let base_hash = base_hash.expect("base").body_hash;
        assert_ne!(base_hash, edited_hash.expect("edited").body_hash);
        assert_ne!(base_hash, dedented_hash.expect("dedented").body_hash);
    }

    #[test]
    fn nested_definition_changes_do_not_touch_the_enclosing_hash() {
        let before = "class Box:\n    size = 1\n    def open(self):\n        return 1\n";
        let after = "class Box:\n    size = 1\n    def open(self):\n        return 2\n";

        let before = extract("box.py", before).table;
        let after = extract("box.py", after).table;

        assert_eq!(
            before.get("box::Box").map(|symbol| &symbol.body_hash),
            after.get("box::Box").map(|symbol| &symbol.body_hash)
        );
        assert_ne!(
            before.get("box::Box::open").map(|symbol| &symbol.body_hash),
            after.get("box::Box::open").map(|symbol| &symbol.body_hash)
        );
    }

    #[test]
    fn records_call_sites_with_argument_counts_and_callers() {
        let source = r#"
def handler(request):
    return login(request.user, request.password, remember=True)

setup(*args)
"#;

        let table = extract("views.py", source).table;
        let calls = table
            .calls
            .iter()
            .map(|call| {
                (
                    call.callee.as_str(),
                    call.positional_args,
                    call.keyword_args,
                    call.has_splat,
                    call.caller.as_deref(),
                )
            })
            .collect::<Vec<_>>();

        assert_eq!(
            calls,
            vec![
                ("login", 2, 1, false, Some("views::handler")),
                ("setup", 0, 0, true, None),
            ]
        );
    }

    #[test]
    fn invalid_source_yields_partial_table_with_parse_issues() {
        let source = "def ok(a):\n    return a\n\ndef broken(:\n    pass\n";

        let table = extract("mid_edit.py", source).table;

        assert!(table.is_degraded());
        assert!(table.get("mid_edit::ok").is_some());
        assert!(table.parse_issues.iter().all(|issue| issue.line >= 4));
    }

    #[test]
    fn later_redefinition_replaces_earlier_one() {
        let source = "def helper():\n    return 1\n\ndef helper(x):\n    return x\n";

        let extracted = extract("dup.py", source);

        assert_eq!(extracted.table.len(), 1);
        let helper = extracted.table.get("dup::helper").expect("helper");
        assert_eq!(helper.signature.parameters.len(), 1);
        assert_eq!(
            extracted.redefinitions,
            vec![Redefinition {
                qualified_name: "dup::helper".to_owned(),
                first_line: 1,
                line: 4,
            }]
        );
    }

    #[test]
    fn language_for_path_maps_python_extensions_only() {
        assert_eq!(
            language_for_path(Path::new("src/app.py")),
            Some(Language::Python)
        );
        assert_eq!(
            language_for_path(Path::new("stubs/app.pyi")),
            Some(Language::Python)
        );
        assert_eq!(language_for_path(Path::new("src/lib.rs")), None);
    }
}

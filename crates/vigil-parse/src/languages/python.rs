use std::path::Path;

use tree_sitter::{Node, Query};
use vigil_core::{
    CallSite, Language, Parameter, ParameterKind, Signature, SymbolDescriptor, SymbolKind,
    normalize_path,
};

use crate::parser::{canonical_hash, named_child_text, node_text, start_line};
use crate::registry::{LanguageConfig, LanguageHooks, QueryCaptures};

const DEFINITION_KINDS: &[&str] = &["function_definition", "class_definition"];

pub fn config() -> LanguageConfig {
    let ts_language = tree_sitter_python::LANGUAGE.into();
    let symbol_query = Query::new(&ts_language, include_str!("../queries/python_symbols.scm"))
        .expect("invalid python symbol query");
    let call_query = Query::new(&ts_language, include_str!("../queries/python_calls.scm"))
        .expect("invalid python call query");

    LanguageConfig {
        id: "python",
        language: Language::Python,
        extensions: &["py", "pyi"],
        ts_language,
        symbol_query,
        call_query,
        hooks: Box::new(PythonHooks),
    }
}

struct PythonHooks;

impl LanguageHooks for PythonHooks {
    fn qualify_name(&self, file_path: &str, symbol_name: &str, scope: &[String]) -> String {
        let module = python_module_path(file_path);
        if scope.is_empty() {
            format!("{module}::{symbol_name}")
        } else {
            format!("{module}::{}::{symbol_name}", scope.join("::"))
        }
    }

    fn map_symbol(
        &self,
        captures: &QueryCaptures<'_, '_>,
        source: &[u8],
        file_path: &str,
    ) -> Option<SymbolDescriptor> {
        let capture_name = captures.first_capture_name_with_prefix("symbol.")?;
        let node = captures.node_with_prefix("symbol.")?;
        let name = named_child_text(node, "name", source)?;
        let scope = enclosing_scope(node, source);
        let qualified_name = self.qualify_name(file_path, &name, &scope);

        let (kind, signature, header) = match capture_name {
            "symbol.function" => {
                let kind = if nearest_definition(node).is_some_and(|parent| {
                    parent.kind() == "class_definition"
                }) {
                    SymbolKind::Method
                } else {
                    SymbolKind::Function
                };
                let parameters = node.child_by_field_name("parameters");
                (kind, parse_parameters(parameters, source), parameters)
            }
            "symbol.class" => (
                SymbolKind::Class,
                Signature::default(),
                node.child_by_field_name("superclasses"),
            ),
            _ => return None,
        };

        let mut hashed = decorators(node);
        hashed.extend(header);
        hashed.extend(node.child_by_field_name("body"));
        let body_hash = canonical_hash(&hashed, source, &skip_in_body_hash);

        Some(SymbolDescriptor {
            name,
            qualified_name,
            kind,
            signature,
            start_line: start_line(node),
            body_hash,
        })
    }

    fn map_call(
        &self,
        captures: &QueryCaptures<'_, '_>,
        source: &[u8],
        file_path: &str,
    ) -> Option<CallSite> {
        let site = captures.node("call.site")?;
        let function = captures.node("call.function")?;
        let arguments = captures.node("call.arguments")?;

        let callee = compact(&node_text(function, source));
        if callee.is_empty() {
            return None;
        }

        let (positional_args, keyword_args, has_splat) = count_arguments(arguments);
        let caller = nearest_definition(site).and_then(|definition| {
            let name = named_child_text(definition, "name", source)?;
            let scope = enclosing_scope(definition, source);
            Some(self.qualify_name(file_path, &name, &scope))
        });

        Some(CallSite {
            callee,
            positional_args,
            keyword_args,
            has_splat,
            caller,
            line: start_line(site),
        })
    }
}

fn python_module_path(file_path: &str) -> String {
    let normalized = normalize_path(file_path);
    let path = Path::new(&normalized);
    let stem = path
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or("module");
    let is_init = stem == "__init__";

    let mut segments = path
        .parent()
        .map(|parent| {
            parent
                .iter()
                .filter_map(|part| {
                    let part = part.to_string_lossy().trim().to_owned();
                    (!part.is_empty() && part != "." && part != "/").then_some(part)
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    if !is_init && !stem.trim().is_empty() {
        segments.push(stem.to_owned());
    }

    if segments.is_empty() {
        "module".to_owned()
    } else {
        segments.join(".")
    }
}

fn nearest_definition(node: Node<'_>) -> Option<Node<'_>> {
    let mut current = node.parent();
    while let Some(parent) = current {
        if DEFINITION_KINDS.contains(&parent.kind()) {
            return Some(parent);
        }
        current = parent.parent();
    }
    None
}

/// Names of enclosing classes and functions, outermost first.
fn enclosing_scope(node: Node<'_>, source: &[u8]) -> Vec<String> {
    let mut scope = Vec::new();
    let mut current = nearest_definition(node);
    while let Some(definition) = current {
        if let Some(name) = named_child_text(definition, "name", source) {
            scope.push(name);
        }
        current = nearest_definition(definition);
    }
    scope.reverse();
    scope
}

fn decorators(node: Node<'_>) -> Vec<Node<'_>> {
    let Some(parent) = node.parent().filter(|parent| parent.kind() == "decorated_definition")
    else {
        return Vec::new();
    };

    let mut cursor = parent.walk();
    parent
        .named_children(&mut cursor)
        .filter(|child| child.kind() == "decorator")
        .collect()
}

fn skip_in_body_hash(node: Node<'_>) -> bool {
    matches!(
        node.kind(),
        "comment" | "function_definition" | "class_definition" | "decorated_definition"
    ) || is_docstring(node)
}

fn is_docstring(node: Node<'_>) -> bool {
    if node.kind() != "expression_statement" || node.named_child_count() != 1 {
        return false;
    }
    let Some(block) = node.parent().filter(|parent| parent.kind() == "block") else {
        return false;
    };
    if block.named_child(0) != Some(node) {
        return false;
    }
    let owned_by_definition = block
        .parent()
        .is_some_and(|owner| DEFINITION_KINDS.contains(&owner.kind()));

    owned_by_definition
        && node
            .named_child(0)
            .is_some_and(|expr| matches!(expr.kind(), "string" | "concatenated_string"))
}

fn parse_parameters(parameters: Option<Node<'_>>, source: &[u8]) -> Signature {
    let Some(parameters) = parameters else {
        return Signature::default();
    };

    let mut parsed = Vec::new();
    let mut keyword_only = false;
    let mut cursor = parameters.walk();
    for child in parameters.named_children(&mut cursor) {
        let plain_kind = if keyword_only {
            ParameterKind::KeywordOnly
        } else {
            ParameterKind::Positional
        };

        match child.kind() {
            "identifier" => parsed.push(parameter(node_text(child, source), plain_kind, None, false)),
            "default_parameter" => {
                if let Some(name) = named_child_text(child, "name", source) {
                    parsed.push(parameter(name, plain_kind, None, true));
                }
            }
            "typed_default_parameter" => {
                if let Some(name) = named_child_text(child, "name", source) {
                    let annotation = named_child_text(child, "type", source);
                    parsed.push(parameter(name, plain_kind, annotation, true));
                }
            }
            "typed_parameter" => {
                let annotation = named_child_text(child, "type", source);
                let Some(inner) = child.named_child(0) else {
                    continue;
                };
                match inner.kind() {
                    "list_splat_pattern" => {
                        parsed.push(parameter(
                            splat_name(inner, source),
                            ParameterKind::VarPositional,
                            annotation,
                            false,
                        ));
                        keyword_only = true;
                    }
                    "dictionary_splat_pattern" => parsed.push(parameter(
                        splat_name(inner, source),
                        ParameterKind::VarKeyword,
                        annotation,
                        false,
                    )),
                    _ => parsed.push(parameter(
                        node_text(inner, source),
                        plain_kind,
                        annotation,
                        false,
                    )),
                }
            }
            "list_splat_pattern" => {
                parsed.push(parameter(
                    splat_name(child, source),
                    ParameterKind::VarPositional,
                    None,
                    false,
                ));
                keyword_only = true;
            }
            "dictionary_splat_pattern" => parsed.push(parameter(
                splat_name(child, source),
                ParameterKind::VarKeyword,
                None,
                false,
            )),
            "keyword_separator" => keyword_only = true,
            _ => {}
        }
    }

    Signature::new(parsed)
}

fn parameter(
    name: String,
    kind: ParameterKind,
    annotation: Option<String>,
    has_default: bool,
) -> Parameter {
    Parameter {
        name: name.trim().to_owned(),
        kind,
        annotation,
        has_default,
    }
}

fn splat_name(node: Node<'_>, source: &[u8]) -> String {
    node.named_child(0)
        .map(|inner| node_text(inner, source))
        .unwrap_or_else(|| node_text(node, source).trim_start_matches('*').to_owned())
}

fn count_arguments(arguments: Node<'_>) -> (usize, usize, bool) {
    // `f(x for x in xs)` passes the generator as its single argument.
    if arguments.kind() == "generator_expression" {
        return (1, 0, false);
    }

    let mut positional = 0;
    let mut keyword = 0;
    let mut has_splat = false;
    let mut cursor = arguments.walk();
    for child in arguments.named_children(&mut cursor) {
        match child.kind() {
            "keyword_argument" => keyword += 1,
            "list_splat" | "dictionary_splat" => has_splat = true,
            "comment" => {}
            _ => positional += 1,
        }
    }

    (positional, keyword, has_splat)
}

fn compact(text: &str) -> String {
    text.chars().filter(|ch| !ch.is_whitespace()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_path_follows_package_layout() {
        assert_eq!(python_module_path("src/auth.py"), "src.auth");
        assert_eq!(python_module_path("./pkg/sub/__init__.py"), "pkg.sub");
        assert_eq!(python_module_path("main.py"), "main");
        assert_eq!(python_module_path("__init__.py"), "module");
    }

    #[test]
    fn qualify_name_joins_scope_segments() {
        let hooks = PythonHooks;
        assert_eq!(hooks.qualify_name("app/auth.py", "login", &[]), "app.auth::login");
        assert_eq!(
            hooks.qualify_name(
                "app/auth.py",
                "login",
                &["Service".to_owned(), "Inner".to_owned()]
            ),
            "app.auth::Service::Inner::login"
        );
    }
}

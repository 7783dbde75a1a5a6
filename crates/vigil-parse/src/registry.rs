use std::collections::HashMap;
use std::path::Path;

use tree_sitter::{Node, Query, QueryCapture};
use vigil_core::{CallSite, Language, SymbolDescriptor};

use crate::languages;

pub struct LanguageConfig {
    pub id: &'static str,
    pub language: Language,
    pub extensions: &'static [&'static str],
    pub ts_language: tree_sitter::Language,
    pub symbol_query: Query,
    pub call_query: Query,
    pub hooks: Box<dyn LanguageHooks>,
}

/// Per-language mapping from query captures to the structural model.
pub trait LanguageHooks: Send + Sync {
    fn qualify_name(&self, file_path: &str, symbol_name: &str, scope: &[String]) -> String;

    fn map_symbol(
        &self,
        captures: &QueryCaptures<'_, '_>,
        source: &[u8],
        file_path: &str,
    ) -> Option<SymbolDescriptor>;

    fn map_call(
        &self,
        captures: &QueryCaptures<'_, '_>,
        source: &[u8],
        file_path: &str,
    ) -> Option<CallSite>;
}

pub struct QueryCaptures<'q, 'tree> {
    query: &'q Query,
    captures: &'q [QueryCapture<'tree>],
}

impl<'q, 'tree> QueryCaptures<'q, 'tree> {
    pub fn new(query: &'q Query, captures: &'q [QueryCapture<'tree>]) -> Self {
        Self { query, captures }
    }

    pub fn first_capture_name_with_prefix(&self, prefix: &str) -> Option<&str> {
        for capture in self.captures {
            let name = self.capture_name(capture.index)?;
            if name.starts_with(prefix) {
                return Some(name);
            }
        }
        None
    }

    pub fn node(&self, name: &str) -> Option<Node<'tree>> {
        self.captures.iter().find_map(|capture| {
            let capture_name = self.capture_name(capture.index)?;
            if capture_name == name {
                Some(capture.node)
            } else {
                None
            }
        })
    }

    pub fn node_with_prefix(&self, prefix: &str) -> Option<Node<'tree>> {
        self.captures.iter().find_map(|capture| {
            let capture_name = self.capture_name(capture.index)?;
            if capture_name.starts_with(prefix) {
                Some(capture.node)
            } else {
                None
            }
        })
    }

    fn capture_name(&self, index: u32) -> Option<&str> {
        self.query.capture_names().get(index as usize).copied()
    }
}

pub struct LanguageRegistry {
    configs: Vec<LanguageConfig>,
    extension_index: HashMap<String, usize>,
}

impl LanguageRegistry {
    pub fn new() -> Self {
        Self {
            configs: Vec::new(),
            extension_index: HashMap::new(),
        }
    }

    pub fn register(&mut self, config: LanguageConfig) {
        let index = self.configs.len();
        for ext in config.extensions {
            let normalized = normalize_extension(ext);
            self.extension_index.entry(normalized).or_insert(index);
        }
        self.configs.push(config);
    }

    pub fn get_by_extension(&self, extension: &str) -> Option<&LanguageConfig> {
        let normalized = normalize_extension(extension);
        let index = *self.extension_index.get(&normalized)?;
        self.configs.get(index)
    }

    pub fn get_by_path(&self, path: &Path) -> Option<&LanguageConfig> {
        let ext = path.extension()?.to_string_lossy();
        self.get_by_extension(&ext)
    }

    pub fn get_by_language(&self, language: Language) -> Option<&LanguageConfig> {
        self.configs
            .iter()
            .find(|config| config.language == language)
    }

    pub fn configs(&self) -> &[LanguageConfig] {
        &self.configs
    }
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        default_registry()
    }
}

pub fn default_registry() -> LanguageRegistry {
    let mut registry = LanguageRegistry::new();
    registry.register(languages::python::config());
    registry
}

fn normalize_extension(extension: &str) -> String {
    extension
        .trim_start_matches('.')
        .trim()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    #[test]
    fn default_registry_resolves_python_by_extension_and_language() {
        let registry = default_registry();

        let by_path = registry
            .get_by_path(Path::new("pkg/Auth.PY"))
            .expect("python by path");
        assert_eq!(by_path.id, "python");
        assert!(registry.get_by_extension(".pyi").is_some());
        assert!(registry.get_by_language(Language::Python).is_some());
        assert!(registry.get_by_path(Path::new("README.md")).is_none());
    }
}

mod languages;
mod parser;
mod registry;

pub use parser::{ExtractError, ExtractedFile, Redefinition, SymbolExtractor, language_for_path};
pub use registry::{
    LanguageConfig, LanguageHooks, LanguageRegistry, QueryCaptures, default_registry,
};

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

mod alert;
mod session;

pub use alert::{Alert, AlertKind, AlertSource, Severity};
pub use session::{
    ChangeSummary, Session, SessionId, SessionState, Snapshot, SnapshotId, snapshot_id,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Python,
}

impl Language {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
        }
    }
}

impl std::str::FromStr for Language {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "python" | "py" => Ok(Self::Python),
            other => Err(format!(
                "unsupported language '{other}', expected one of: python"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Function,
    Method,
    Class,
}

impl SymbolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Method => "method",
            Self::Class => "class",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    Positional,
    VarPositional,
    KeywordOnly,
    VarKeyword,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub kind: ParameterKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
    #[serde(default)]
    pub has_default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Signature {
    pub parameters: Vec<Parameter>,
}

impl Signature {
    pub fn new(parameters: Vec<Parameter>) -> Self {
        Self { parameters }
    }

    /// Two signatures have the same shape when their parameter names and kinds
    /// line up one-to-one. Annotations and defaults are not part of the shape.
    pub fn same_shape(&self, other: &Signature) -> bool {
        self.parameters.len() == other.parameters.len()
            && self
                .parameters
                .iter()
                .zip(&other.parameters)
                .all(|(left, right)| left.name == right.name && left.kind == right.kind)
    }

    /// Best-effort arity check for a call with `positional` positional and
    /// `keyword` keyword arguments. A bound receiver (`self`/`cls`) is skipped
    /// when `bound_receiver` is set.
    pub fn accepts(&self, positional: usize, keyword: usize, bound_receiver: bool) -> bool {
        let skip = usize::from(bound_receiver && self.has_receiver());
        let params = self.parameters.iter().skip(skip);

        let mut required = 0usize;
        let mut maximum = 0usize;
        let mut unbounded = false;
        for param in params {
            match param.kind {
                ParameterKind::Positional | ParameterKind::KeywordOnly => {
                    maximum += 1;
                    if !param.has_default {
                        required += 1;
                    }
                }
                ParameterKind::VarPositional | ParameterKind::VarKeyword => unbounded = true,
            }
        }

        let supplied = positional + keyword;
        supplied >= required && (unbounded || supplied <= maximum)
    }

    pub fn has_receiver(&self) -> bool {
        self.parameters.first().is_some_and(|param| {
            param.kind == ParameterKind::Positional && matches!(param.name.as_str(), "self" | "cls")
        })
    }

    pub fn render(&self) -> String {
        let rendered = self
            .parameters
            .iter()
            .map(|param| match param.kind {
                ParameterKind::VarPositional => format!("*{}", param.name),
                ParameterKind::VarKeyword => format!("**{}", param.name),
                _ => param.name.clone(),
            })
            .collect::<Vec<_>>();
        format!("({})", rendered.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolDescriptor {
    pub name: String,
    pub qualified_name: String,
    pub kind: SymbolKind,
    pub signature: Signature,
    pub start_line: usize,
    pub body_hash: String,
}

impl SymbolDescriptor {
    pub fn identity(&self) -> SymbolIdentity<'_> {
        SymbolIdentity {
            qualified_name: &self.qualified_name,
            kind: self.kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolIdentity<'a> {
    pub qualified_name: &'a str,
    pub kind: SymbolKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    pub callee: String,
    pub positional_args: usize,
    pub keyword_args: usize,
    #[serde(default)]
    pub has_splat: bool,
    /// Qualified name of the enclosing function or method, `None` at module scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,
    pub line: usize,
}

impl CallSite {
    pub fn callee_name(&self) -> &str {
        self.callee
            .rsplit('.')
            .next()
            .unwrap_or(self.callee.as_str())
            .trim()
    }

    pub fn is_attribute_call(&self) -> bool {
        self.callee.contains('.')
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseIssue {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

/// Structural summary of one file at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolTable {
    pub language: Language,
    pub file_path: String,
    pub symbols: BTreeMap<String, SymbolDescriptor>,
    #[serde(default)]
    pub calls: Vec<CallSite>,
    #[serde(default)]
    pub parse_issues: Vec<ParseIssue>,
}

impl SymbolTable {
    pub fn new(language: Language, file_path: &str) -> Self {
        Self {
            language,
            file_path: normalize_path(file_path),
            symbols: BTreeMap::new(),
            calls: Vec::new(),
            parse_issues: Vec::new(),
        }
    }

    /// Inserts a symbol, replacing an earlier definition with the same
    /// qualified name. Returns the replaced descriptor.
    pub fn insert(&mut self, symbol: SymbolDescriptor) -> Option<SymbolDescriptor> {
        self.symbols.insert(symbol.qualified_name.clone(), symbol)
    }

    pub fn get(&self, qualified_name: &str) -> Option<&SymbolDescriptor> {
        self.symbols.get(qualified_name)
    }

    /// Looks a symbol up by full identity (qualified name and kind).
    pub fn find(&self, identity: SymbolIdentity<'_>) -> Option<&SymbolDescriptor> {
        self.symbols
            .get(identity.qualified_name)
            .filter(|symbol| symbol.kind == identity.kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SymbolDescriptor> {
        self.symbols.values()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn is_degraded(&self) -> bool {
        !self.parse_issues.is_empty()
    }
}

pub fn content_hash(content: &str) -> String {
    blake3_hex(content.as_bytes())
}

pub fn normalize_path(path: &str) -> String {
    let normalized = path.trim().replace('\\', "/");
    normalized
        .strip_prefix("./")
        .map(ToOwned::to_owned)
        .unwrap_or(normalized)
}

/// Leaf name of a qualified symbol (`pkg.auth::Service::login` -> `login`).
pub fn symbol_leaf_name(qualified_name: &str) -> &str {
    qualified_name
        .rsplit("::")
        .next()
        .unwrap_or(qualified_name)
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or_default()
}

fn blake3_hex(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

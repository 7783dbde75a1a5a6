use std::path::Path;

use vigil_core::{Language, SymbolKind};
use vigil_parse::{ExtractedFile, SymbolExtractor};

const SERVICE_MODULE: &str = r#"
import functools


def retry(times):
    def wrap(fn):
        @functools.wraps(fn)
        def inner(*args, **kwargs):
            return fn(*args, **kwargs)
        return inner
    return wrap


class AuthService:
    """Authenticates users."""

    def __init__(self, store):
        self.store = store

    @retry(3)
    def login(self, username, password):
        user = self.store.find(username)
        return user.check(password)

    @classmethod
    def create(cls):
        return cls(store=None)


def handle(request):
    service = AuthService.create()
    return service.login(request.user, request.password)
"#;

fn extract(path: &str, source: &str) -> ExtractedFile {
    let mut extractor = SymbolExtractor::new().expect("extractor");
    extractor
        .extract_file(Language::Python, path, source)
        .expect("python extraction")
}

#[test]
fn extracts_python_symbols_with_expected_kinds_and_qualified_names() {
    let extracted = extract("app/services/auth.py", SERVICE_MODULE);
    let table = &extracted.table;

    let expected = [
        ("app.services.auth::retry", SymbolKind::Function),
        ("app.services.auth::retry::wrap", SymbolKind::Function),
        ("app.services.auth::retry::wrap::inner", SymbolKind::Function),
        ("app.services.auth::AuthService", SymbolKind::Class),
        ("app.services.auth::AuthService::__init__", SymbolKind::Method),
        ("app.services.auth::AuthService::login", SymbolKind::Method),
        ("app.services.auth::AuthService::create", SymbolKind::Method),
        ("app.services.auth::handle", SymbolKind::Function),
    ];
    for (qualified_name, kind) in expected {
        let symbol = table
            .get(qualified_name)
            .unwrap_or_else(|| panic!("missing {qualified_name}"));
        assert_eq!(symbol.kind, kind, "kind of {qualified_name}");
    }
    assert_eq!(table.len(), expected.len());
    assert!(extracted.redefinitions.is_empty());
    assert!(!table.is_degraded());
}

#[test]
fn symbol_identity_and_hashes_survive_line_shifts() {
    let shifted = format!("\n\n# moved down\n{SERVICE_MODULE}");

    let original = extract("app/services/auth.py", SERVICE_MODULE).table;
    let shifted = extract("app/services/auth.py", &shifted).table;

    let original_hashes = original
        .iter()
        .map(|symbol| (symbol.qualified_name.clone(), symbol.body_hash.clone()))
        .collect::<Vec<_>>();
    let shifted_hashes = shifted
        .iter()
        .map(|symbol| (symbol.qualified_name.clone(), symbol.body_hash.clone()))
        .collect::<Vec<_>>();
    assert_eq!(original_hashes, shifted_hashes);

    let login_before = original
        .get("app.services.auth::AuthService::login")
        .expect("login");
    let login_after = shifted
        .get("app.services.auth::AuthService::login")
        .expect("login");
    assert_eq!(login_after.start_line, login_before.start_line + 3);
}

#[test]
fn decorator_edits_change_the_decorated_symbol_hash() {
    let edited = SERVICE_MODULE.replace("@retry(3)", "@retry(5)");

    let original = extract("auth.py", SERVICE_MODULE).table;
    let edited = extract("auth.py", &edited).table;

    assert_ne!(
        original.get("auth::AuthService::login").map(|s| &s.body_hash),
        edited.get("auth::AuthService::login").map(|s| &s.body_hash)
    );
    assert_eq!(
        original.get("auth::handle").map(|s| &s.body_hash),
        edited.get("auth::handle").map(|s| &s.body_hash)
    );
}

#[test]
fn extracts_call_sites_with_callers_and_arity() {
    let extracted = extract("auth.py", SERVICE_MODULE);

    let login_call = extracted
        .table
        .calls
        .iter()
        .find(|call| call.callee == "service.login")
        .expect("service.login call");
    assert_eq!(login_call.positional_args, 2);
    assert_eq!(login_call.keyword_args, 0);
    assert_eq!(login_call.caller.as_deref(), Some("auth::handle"));
    assert_eq!(login_call.callee_name(), "login");

    let factory_call = extracted
        .table
        .calls
        .iter()
        .find(|call| call.callee == "cls")
        .expect("cls() call");
    assert_eq!(factory_call.keyword_args, 1);
    assert_eq!(factory_call.caller.as_deref(), Some("auth::AuthService::create"));

    let forwarded = extracted
        .table
        .calls
        .iter()
        .find(|call| call.callee == "fn")
        .expect("fn(*args) call");
    assert!(forwarded.has_splat);
}

#[test]
fn extract_from_path_resolves_language_by_extension() {
    let mut extractor = SymbolExtractor::new().expect("extractor");

    let extracted = extractor
        .extract_from_path(Path::new("./pkg/__init__.py"), "def boot():\n    pass\n")
        .expect("extract from path");
    assert_eq!(extracted.table.file_path, "pkg/__init__.py");
    assert!(extracted.table.get("pkg::boot").is_some());

    assert!(
        extractor
            .extract_from_path(Path::new("stubs/types.pyi"), "def stub() -> int: ...\n")
            .is_ok()
    );
    assert!(
        extractor
            .extract_from_path(Path::new("src/main.rs"), "fn main() {}")
            .is_err()
    );
}

#[test]
fn empty_source_produces_empty_table() {
    let extracted = extract("empty.py", "");
    assert!(extracted.table.is_empty());
    assert!(extracted.table.calls.is_empty());
    assert!(!extracted.table.is_degraded());
}

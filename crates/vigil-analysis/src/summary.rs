use std::path::Path;

use vigil_core::{ChangeSummary, SymbolTable};

const MAX_NAMES_PER_GROUP: usize = 8;
const MAX_REQUEST_CHARS: usize = 280;

/// One-line description of a file change for the drift window, built from
/// the names of added, removed and changed symbols. The file stem is kept in
/// `scope` so it never counts as a topic keyword.
pub fn summarize_change(old: Option<&SymbolTable>, new: &SymbolTable) -> ChangeSummary {
    let stem = Path::new(&new.file_path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| new.file_path.clone());

    let Some(old) = old else {
        let names = new.iter().map(|symbol| symbol.name.as_str()).collect::<Vec<_>>();
        let text = if names.is_empty() {
            "created".to_owned()
        } else {
            format!("created with {}", join_names(&names))
        };
        return ChangeSummary::for_file(stem, text);
    };

    let added = new
        .iter()
        .filter(|symbol| old.find(symbol.identity()).is_none())
        .map(|symbol| symbol.name.as_str())
        .collect::<Vec<_>>();
    let removed = old
        .iter()
        .filter(|symbol| new.find(symbol.identity()).is_none())
        .map(|symbol| symbol.name.as_str())
        .collect::<Vec<_>>();
    let changed = new
        .iter()
        .filter(|symbol| {
            old.find(symbol.identity()).is_some_and(|previous| {
                previous.body_hash != symbol.body_hash
                    || !previous.signature.same_shape(&symbol.signature)
            })
        })
        .map(|symbol| symbol.name.as_str())
        .collect::<Vec<_>>();

    let mut groups = Vec::new();
    for (label, names) in [("added", &added), ("removed", &removed), ("changed", &changed)] {
        if !names.is_empty() {
            groups.push(format!("{label} {}", join_names(names)));
        }
    }

    let text = if groups.is_empty() {
        "edited".to_owned()
    } else {
        groups.join("; ")
    };
    ChangeSummary::for_file(stem, text)
}

/// Normalises a prompt before it enters the drift window.
pub fn summarize_request(prompt: &str) -> Option<ChangeSummary> {
    let collapsed = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    Some(ChangeSummary::unscoped(
        collapsed.chars().take(MAX_REQUEST_CHARS).collect::<String>(),
    ))
}

fn join_names(names: &[&str]) -> String {
    let mut shown = names
        .iter()
        .take(MAX_NAMES_PER_GROUP)
        .copied()
        .collect::<Vec<_>>()
        .join(", ");
    if names.len() > MAX_NAMES_PER_GROUP {
        shown.push_str(&format!(" and {} more", names.len() - MAX_NAMES_PER_GROUP));
    }
    shown
}

#[cfg(test)]
mod tests {
    use vigil_core::{Language, Signature, SymbolDescriptor, SymbolKind, content_hash};

    use super::*;

    fn table(symbols: &[(&str, &str)]) -> SymbolTable {
        let mut table = SymbolTable::new(Language::Python, "app/auth.py");
        for (name, body) in symbols {
            table.insert(SymbolDescriptor {
                name: (*name).to_owned(),
                qualified_name: format!("app.auth::{name}"),
                kind: SymbolKind::Function,
                signature: Signature::default(),
                start_line: 1,
                body_hash: content_hash(body),
            });
        }
        table
    }

    #[test]
    fn summary_lists_added_removed_and_changed_names() {
        let old = table(&[("login", "a"), ("logout", "b"), ("audit", "c")]);
        let new = table(&[("login", "a2"), ("audit", "c"), ("verify_password", "d")]);

        let summary = summarize_change(Some(&old), &new);
        assert_eq!(summary.scope.as_deref(), Some("auth"));
        assert_eq!(
            summary.text,
            "added verify_password; removed logout; changed login"
        );
        assert_eq!(
            summary.render(),
            "auth: added verify_password; removed logout; changed login"
        );
        assert_eq!(summarize_change(Some(&old), &old).text, "edited");
        assert_eq!(
            summarize_change(None, &new).text,
            "created with audit, login, verify_password"
        );
    }

    #[test]
    fn request_summary_collapses_whitespace_and_skips_blank_prompts() {
        assert_eq!(
            summarize_request("  add\n\tlogin   flow "),
            Some(ChangeSummary::unscoped("add login flow"))
        );
        assert_eq!(summarize_request(" \n "), None);
        assert_eq!(
            summarize_request(&"x".repeat(1000)).map(|summary| summary.text.len()),
            Some(MAX_REQUEST_CHARS)
        );
    }
}

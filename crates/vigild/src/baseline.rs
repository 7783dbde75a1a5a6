use std::fs;
use std::path::{Path, PathBuf};

use vigil_core::{Language, normalize_path};
use vigil_parse::language_for_path;
use walkdir::WalkDir;

const MAX_BASELINE_FILE_BYTES: u64 = 1024 * 1024;

const IGNORED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".vigil",
    "target",
    "__pycache__",
    ".venv",
    "venv",
    ".tox",
    ".mypy_cache",
    ".pytest_cache",
    "node_modules",
    "site-packages",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaselineFile {
    pub file_path: String,
    pub content: String,
}

/// Source files of `language` under `project_root`, with paths relative to the
/// root, sorted by path.
pub fn discover_sources(project_root: &Path, language: Language) -> Vec<BaselineFile> {
    let mut files = Vec::new();

    let walker = WalkDir::new(project_root)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_ignored_path(entry.path()));
    for entry in walker.filter_map(std::result::Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }

        let full_path = entry.path();
        if language_for_path(full_path) != Some(language) {
            continue;
        }
        if entry
            .metadata()
            .map(|metadata| metadata.len() > MAX_BASELINE_FILE_BYTES)
            .unwrap_or(true)
        {
            tracing::debug!(path = %full_path.display(), "skipping oversized or unreadable file");
            continue;
        }

        let content = match fs::read_to_string(full_path) {
            Ok(content) => content,
            Err(err) => {
                tracing::debug!(path = %full_path.display(), error = %err, "skipping unreadable file");
                continue;
            }
        };

        let relative = relative_project_path(project_root, full_path);
        files.push(BaselineFile {
            file_path: normalize_path(&relative.to_string_lossy()),
            content,
        });
    }

    files.sort_by(|left, right| left.file_path.cmp(&right.file_path));
    files
}

pub fn is_ignored_path(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy())
        .is_some_and(|name| IGNORED_DIRS.contains(&name.as_ref()))
}

/// `file_path` relative to `project_root` when it lies under the root, so an
/// absolute path and its baseline entry name the same tracked file.
pub fn project_relative_path(project_root: &str, file_path: &str) -> String {
    let file_path = normalize_path(file_path);
    let root = normalize_path(project_root);
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        return file_path;
    }

    match file_path.strip_prefix(root) {
        Some(rest) if rest.starts_with('/') => rest.trim_start_matches('/').to_owned(),
        _ => file_path,
    }
}

fn relative_project_path(project_root: &Path, path: &Path) -> PathBuf {
    path.strip_prefix(project_root)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn discovers_python_sources_and_skips_ignored_directories() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        for (path, content) in [
            ("app/auth.py", "def login():\n    pass\n"),
            ("app/__init__.py", ""),
            ("main.py", "print('hi')\n"),
            ("README.md", "# readme\n"),
            (".git/hooks/pre-commit.py", "x = 1\n"),
            ("app/__pycache__/auth.cpython-312.py", "x = 1\n"),
            (".venv/lib/site.py", "x = 1\n"),
            (".vigil/stray.py", "x = 1\n"),
        ] {
            let full = root.join(path);
            fs::create_dir_all(full.parent().expect("parent")).expect("create dirs");
            fs::write(full, content).expect("write file");
        }

        let files = discover_sources(root, Language::Python);
        let paths = files
            .iter()
            .map(|file| file.file_path.as_str())
            .collect::<Vec<_>>();

        assert_eq!(paths, vec!["app/__init__.py", "app/auth.py", "main.py"]);
        assert_eq!(files[1].content, "def login():\n    pass\n");
    }

    #[test]
    fn paths_under_the_project_root_become_relative() {
        assert_eq!(
            project_relative_path("/work/project", "/work/project/app/auth.py"),
            "app/auth.py"
        );
        assert_eq!(
            project_relative_path("/work/project/", "/work/project/auth.py"),
            "auth.py"
        );
        assert_eq!(
            project_relative_path("C:\\work\\project", "C:\\work\\project\\auth.py"),
            "auth.py"
        );
        assert_eq!(project_relative_path("/work/project", "./auth.py"), "auth.py");
        assert_eq!(
            project_relative_path("/work/project", "/work/project-old/auth.py"),
            "/work/project-old/auth.py"
        );
        assert_eq!(
            project_relative_path("/work/project", "/elsewhere/auth.py"),
            "/elsewhere/auth.py"
        );
    }

    #[test]
    fn ignored_path_matches_directory_names_only() {
        assert!(is_ignored_path(Path::new("project/.git")));
        assert!(is_ignored_path(Path::new("project/__pycache__")));
        assert!(!is_ignored_path(Path::new("project/gitops.py")));
    }
}

use serde::{Deserialize, Serialize};
use vigil_core::{CallSite, Language, SymbolDescriptor, SymbolKind, SymbolTable};
use vigil_parse::{ExtractError, SymbolExtractor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    SyntaxError,
    DuplicateDefinition,
    CallArityMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeIssue {
    #[serde(rename = "type")]
    pub kind: IssueKind,
    pub message: String,
    pub line: usize,
}

/// Stateless checks on a single source file: syntax errors, definitions that
/// shadow an earlier one in the same scope, and calls to functions of the
/// same file whose argument count the callee cannot accept.
pub fn validate_code(
    extractor: &mut SymbolExtractor,
    language: Language,
    file_path: &str,
    content: &str,
) -> Result<Vec<CodeIssue>, ExtractError> {
    let extracted = extractor.extract_file(language, file_path, content)?;
    let table = &extracted.table;

    let mut issues = table
        .parse_issues
        .iter()
        .map(|issue| CodeIssue {
            kind: IssueKind::SyntaxError,
            message: format!("column {}: {}", issue.column, issue.message),
            line: issue.line,
        })
        .collect::<Vec<_>>();

    issues.extend(extracted.redefinitions.iter().map(|redefinition| CodeIssue {
        kind: IssueKind::DuplicateDefinition,
        message: format!(
            "`{}` redefines the definition from line {}",
            redefinition.qualified_name, redefinition.first_line
        ),
        line: redefinition.line,
    }));

    for call in table.calls.iter().filter(|call| !call.has_splat) {
        let Some((target, bound_receiver)) = resolve_local_call(table, call) else {
            continue;
        };
        if !target
            .signature
            .accepts(call.positional_args, call.keyword_args, bound_receiver)
        {
            issues.push(CodeIssue {
                kind: IssueKind::CallArityMismatch,
                message: format!(
                    "`{}` passes {} argument(s) but `{}` takes {}",
                    call.callee,
                    call.positional_args + call.keyword_args,
                    target.qualified_name,
                    target.signature.render()
                ),
                line: call.line,
            });
        }
    }

    issues.sort_by(|left, right| left.line.cmp(&right.line));
    Ok(issues)
}

/// Resolves calls that can be tied to one definition in the same file: bare
/// calls to a unique function name, class instantiation through `__init__`,
/// and `self.method(...)` inside the defining class.
fn resolve_local_call<'t>(
    table: &'t SymbolTable,
    call: &CallSite,
) -> Option<(&'t SymbolDescriptor, bool)> {
    if let Some(method) = call.callee.strip_prefix("self.") {
        if method.contains('.') {
            return None;
        }
        let caller = call.caller.as_deref()?;
        let (class_scope, _) = caller.rsplit_once("::")?;
        let target = table.get(&format!("{class_scope}::{method}"))?;
        return (target.kind == SymbolKind::Method).then_some((target, true));
    }

    if call.is_attribute_call() {
        return None;
    }

    let mut candidates = table
        .iter()
        .filter(|symbol| symbol.name == call.callee && symbol.kind != SymbolKind::Method);
    let target = candidates.next()?;
    if candidates.next().is_some() {
        return None;
    }

    match target.kind {
        SymbolKind::Class => {
            let init = table.get(&format!("{}::__init__", target.qualified_name))?;
            Some((init, true))
        }
        _ => Some((target, false)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(source: &str) -> Vec<CodeIssue> {
        let mut extractor = SymbolExtractor::new().expect("extractor");
        validate_code(&mut extractor, Language::Python, "snippet.py", source).expect("validate")
    }

    #[test]
    fn clean_code_has_no_issues() {
        let source = r#"
def add(a, b=0):
    return a + b

class Counter:
    def __init__(self, start):
        self.value = start

    def bump(self, by):
        self.value = add(self.value, by)

counter = Counter(1)
counter.bump(2)
"#;
        assert!(validate(source).is_empty());
    }

    #[test]
    fn reports_arity_mismatches_for_functions_methods_and_constructors() {
        let source = r#"
def add(a, b):
    return a + b

class Counter:
    def __init__(self, start):
        self.value = start

    def bump(self, by):
        self.reset(by)
        return add(by)

    def reset(self):
        self.value = 0

Counter()
"#;
        let issues = validate(source);
        let lines = issues
            .iter()
            .map(|issue| (issue.kind, issue.line))
            .collect::<Vec<_>>();
        assert_eq!(
            lines,
            vec![
                (IssueKind::CallArityMismatch, 10),
                (IssueKind::CallArityMismatch, 11),
                (IssueKind::CallArityMismatch, 16),
            ]
        );
        assert!(issues[1].message.contains("`snippet::add` takes (a, b)"));
    }

    #[test]
    fn reports_duplicates_and_syntax_errors() {
        let source = "def run():\n    pass\n\ndef run():\n    pass\n\ndef broken(:\n    pass\n";
        let issues = validate(source);

        assert!(issues.iter().any(|issue| {
            issue.kind == IssueKind::DuplicateDefinition && issue.line == 4
        }));
        assert!(
            issues
                .iter()
                .any(|issue| issue.kind == IssueKind::SyntaxError)
        );
    }

    #[test]
    fn issue_serializes_kind_as_type() {
        let issue = CodeIssue {
            kind: IssueKind::CallArityMismatch,
            message: "m".to_owned(),
            line: 3,
        };
        let value = serde_json::to_value(&issue).expect("serialize");
        assert_eq!(value["type"], "call_arity_mismatch");
    }
}

use std::collections::BTreeSet;

use vigil_core::{
    Alert, AlertKind, AlertSource, CallSite, Severity, SymbolDescriptor, SymbolKind, SymbolTable,
};

/// Structural regressions between two versions of one file.
///
/// Pure and deterministic apart from alert timestamps; the result is sorted by
/// subject. Alerts carry [`AlertSource::Tables`] until a caller rebinds them.
pub fn compare(old: &SymbolTable, new: &SymbolTable) -> Vec<Alert> {
    compare_with_callers(old, new, &[])
}

/// Like [`compare`], with extra call sites from other files of the session
/// counted as retained callers.
pub fn compare_with_callers(
    old: &SymbolTable,
    new: &SymbolTable,
    external_calls: &[CallSite],
) -> Vec<Alert> {
    let source = AlertSource::Tables {
        file_path: new.file_path.clone(),
    };

    let removed = old
        .iter()
        .filter(|symbol| new.find(symbol.identity()).is_none())
        .map(|symbol| symbol.qualified_name.as_str())
        .collect::<BTreeSet<_>>();

    let retained_calls = new
        .calls
        .iter()
        .chain(external_calls)
        .filter(|call| {
            call.caller
                .as_deref()
                .is_none_or(|caller| !removed.contains(caller))
        })
        .collect::<Vec<_>>();

    let mut alerts = Vec::new();
    for previous in old.iter() {
        let Some(current) = new.find(previous.identity()) else {
            alerts.push(removed_alert(previous, &retained_calls, source.clone()));
            continue;
        };

        if !previous.signature.same_shape(&current.signature) {
            alerts.push(signature_alert(
                previous,
                current,
                &retained_calls,
                source.clone(),
            ));
        } else if previous.body_hash != current.body_hash {
            alerts.push(Alert::new(
                AlertKind::BodyChanged,
                Severity::Informational,
                current.qualified_name.clone(),
                format!(
                    "body of {} `{}` changed",
                    current.kind.as_str(),
                    current.qualified_name
                ),
                source.clone(),
            ));
        }
    }

    alerts.sort_by(|left, right| {
        left.subject
            .cmp(&right.subject)
            .then_with(|| left.kind.cmp(&right.kind))
    });
    alerts
}

/// Advisory for a table built from source with syntax errors.
pub fn parse_degraded_alert(table: &SymbolTable, source: AlertSource) -> Option<Alert> {
    let first = table.parse_issues.first()?;
    Some(Alert::new(
        AlertKind::ParseDegraded,
        Severity::Informational,
        table.file_path.clone(),
        format!(
            "{} parsed with {} syntax error(s), first at line {}: {}",
            table.file_path,
            table.parse_issues.len(),
            first.line,
            first.message
        ),
        source,
    ))
}

fn removed_alert(symbol: &SymbolDescriptor, calls: &[&CallSite], source: AlertSource) -> Alert {
    let still_called = calls
        .iter()
        .find(|call| resolves_to(call, symbol));

    match still_called {
        Some(call) => Alert::new(
            AlertKind::RegressionRemoved,
            Severity::Critical,
            symbol.qualified_name.clone(),
            format!(
                "{} `{}` was removed but is still called from {} (line {})",
                symbol.kind.as_str(),
                symbol.qualified_name,
                describe_caller(call),
                call.line
            ),
            source,
        ),
        None => Alert::new(
            AlertKind::RegressionRemoved,
            Severity::Warning,
            symbol.qualified_name.clone(),
            format!("{} `{}` was removed", symbol.kind.as_str(), symbol.qualified_name),
            source,
        ),
    }
}

fn signature_alert(
    previous: &SymbolDescriptor,
    current: &SymbolDescriptor,
    calls: &[&CallSite],
    source: AlertSource,
) -> Alert {
    let mut message = format!(
        "signature of {} `{}` changed from {} to {}",
        current.kind.as_str(),
        current.qualified_name,
        previous.signature.render(),
        current.signature.render()
    );

    let incompatible = calls.iter().find(|call| {
        resolves_to(call, current)
            && !call.has_splat
            && !current.signature.accepts(
                call.positional_args,
                call.keyword_args,
                binds_receiver(call, current),
            )
    });

    let severity = match incompatible {
        Some(call) => {
            message.push_str(&format!(
                "; call from {} at line {} passes {} argument(s)",
                describe_caller(call),
                call.line,
                call.positional_args + call.keyword_args
            ));
            Severity::Critical
        }
        None => Severity::Warning,
    };

    Alert::new(
        AlertKind::RegressionSignature,
        severity,
        current.qualified_name.clone(),
        message,
        source,
    )
}

fn resolves_to(call: &CallSite, symbol: &SymbolDescriptor) -> bool {
    call.callee_name() == symbol.name
}

fn binds_receiver(call: &CallSite, symbol: &SymbolDescriptor) -> bool {
    symbol.kind == SymbolKind::Method && call.is_attribute_call()
}

fn describe_caller(call: &CallSite) -> String {
    match call.caller.as_deref() {
        Some(caller) => format!("`{caller}`"),
        None => "module scope".to_owned(),
    }
}

use std::collections::VecDeque;

use vigil_core::Snapshot;

use crate::{SqliteStore, StoreError};

const HISTORY_PAGE_SIZE: usize = 32;

/// Snapshots of one file in sequence order, fetched page by page.
///
/// Cloning yields an independent cursor at the same position; `restart`
/// rewinds to the first snapshot.
#[derive(Clone)]
pub struct SnapshotHistory<'a> {
    store: &'a SqliteStore,
    session_id: String,
    file_path: String,
    last_sequence: u64,
    buffered: VecDeque<Snapshot>,
    exhausted: bool,
}

impl<'a> SnapshotHistory<'a> {
    pub(crate) fn new(store: &'a SqliteStore, session_id: &str, file_path: &str) -> Self {
        Self {
            store,
            session_id: session_id.to_owned(),
            file_path: file_path.to_owned(),
            last_sequence: 0,
            buffered: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn restart(&mut self) {
        self.last_sequence = 0;
        self.buffered.clear();
        self.exhausted = false;
    }

    fn fill(&mut self) -> Result<(), StoreError> {
        let after = self
            .buffered
            .back()
            .map(|snapshot| snapshot.sequence)
            .unwrap_or(self.last_sequence);
        let page =
            self.store
                .snapshot_page(&self.session_id, &self.file_path, after, HISTORY_PAGE_SIZE)?;
        if page.len() < HISTORY_PAGE_SIZE {
            self.exhausted = true;
        }
        self.buffered.extend(page);
        Ok(())
    }
}

impl Iterator for SnapshotHistory<'_> {
    type Item = Result<Snapshot, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffered.is_empty() && !self.exhausted {
            if let Err(err) = self.fill() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }

        let snapshot = self.buffered.pop_front()?;
        self.last_sequence = snapshot.sequence;
        Some(Ok(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;
    use vigil_core::{Language, Session, SymbolTable};

    use super::*;

    #[test]
    fn history_pages_lazily_and_restarts() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(temp.path()).expect("open store");
        let session = Session::new("/work", Language::Python, "bulk edits", 1);
        store.create_session(&session).expect("create session");

        let total = HISTORY_PAGE_SIZE * 2 + 3;
        for index in 1..=total {
            store
                .record(
                    &session.id,
                    "big.py",
                    &format!("# {index}"),
                    &SymbolTable::new(Language::Python, "big.py"),
                )
                .expect("record");
        }

        let mut history = store.history(&session.id, "big.py");
        let first_two = history
            .by_ref()
            .take(2)
            .map(|snapshot| snapshot.expect("snapshot").sequence)
            .collect::<Vec<_>>();
        assert_eq!(first_two, vec![1, 2]);

        let forked = history.clone();
        let rest = history
            .by_ref()
            .map(|snapshot| snapshot.expect("snapshot").sequence)
            .collect::<Vec<_>>();
        assert_eq!(rest, (3..=total as u64).collect::<Vec<_>>());
        assert_eq!(forked.count(), total - 2);

        history.restart();
        assert_eq!(
            history.next().map(|snapshot| snapshot.expect("snapshot").content),
            Some("# 1".to_owned())
        );
    }

    #[test]
    fn history_of_untracked_file_is_empty() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(temp.path()).expect("open store");

        assert_eq!(store.history("sess_none", "ghost.py").count(), 0);
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_skiplist::SkipSet;
use parking_lot::Mutex;

/// In-memory record of spatial maintenance triggers known to exist.
///
/// The engine catalog is the authority. This set is only a fast-path hint: it
/// may lag behind the catalog (for example right after a restart, when it is
/// empty) but it never claims a trigger the catalog does not have:
///
/// - names built inside a transaction are staged in [`IndexChanges`] and
///   published only once the transaction commits;
/// - a table whose index is being dropped carries a tombstone from before its
///   names are evicted until the dropping transaction ends, and names are
///   never published for a tombstoned table.
#[derive(Default)]
pub struct IndexStateCache {
    triggers: SkipSet<String>,
    dropping: Mutex<HashMap<String, usize>>,
    dropping_all: AtomicUsize,
}

/// Index-state changes staged by one transaction.
///
/// Hand it back to [`IndexStateCache::complete`] once the transaction has
/// committed or rolled back.
#[derive(Debug, Default)]
pub struct IndexChanges {
    built: Vec<(String, Vec<String>)>,
    dropped: Vec<(String, Vec<String>)>,
    dropped_all: usize,
}

impl IndexChanges {
    pub fn is_empty(&self) -> bool {
        self.built.is_empty() && self.dropped.is_empty() && self.dropped_all == 0
    }

    pub(crate) fn built(&mut self, table: &str, names: Vec<String>) {
        self.built.push((table.to_string(), names));
    }

    pub(crate) fn dropped(&mut self, table: &str, names: Vec<String>) {
        self.dropped.push((table.to_string(), names));
    }

    pub(crate) fn dropped_all(&mut self) {
        self.dropped_all += 1;
    }
}

impl IndexStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.triggers.contains(name)
    }

    /// True only if every name is present.
    pub fn contains_all<S: AsRef<str>>(&self, names: &[S]) -> bool {
        names.iter().all(|name| self.triggers.contains(name.as_ref()))
    }

    pub fn insert_all<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            self.triggers.insert(name.into());
        }
    }

    pub fn remove_all<S: AsRef<str>>(&self, names: &[S]) {
        for name in names {
            self.triggers.remove(name.as_ref());
        }
    }

    pub fn clear(&self) {
        self.triggers.clear();
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    /// Sorted copy of the known trigger names
    pub fn snapshot(&self) -> Vec<String> {
        self.triggers.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Whether an index drop on `table`, or on every table, is in flight.
    pub fn is_dropping(&self, table: &str) -> bool {
        self.dropping_all.load(Ordering::SeqCst) > 0 || self.dropping.lock().contains_key(table)
    }

    /// Records `names` for `table` unless a drop on it is in flight. Returns
    /// whether the names were kept.
    pub fn publish<S: AsRef<str>>(&self, table: &str, names: &[S]) -> bool {
        if self.is_dropping(table) {
            return false;
        }
        self.insert_all(names.iter().map(|name| name.as_ref().to_string()));
        // The tombstone is set before a drop evicts, so checking after the
        // insert catches a drop that started in between.
        if self.is_dropping(table) {
            self.remove_all(names);
            return false;
        }
        true
    }

    /// Tombstones `table` and evicts its names. Pair with [`end_drop`](Self::end_drop).
    pub fn begin_drop<S: AsRef<str>>(&self, table: &str, names: &[S]) {
        *self.dropping.lock().entry(table.to_string()).or_insert(0) += 1;
        self.remove_all(names);
    }

    pub fn end_drop<S: AsRef<str>>(&self, table: &str, names: &[S]) {
        self.remove_all(names);
        let mut dropping = self.dropping.lock();
        if let Some(count) = dropping.get_mut(table) {
            *count -= 1;
            if *count == 0 {
                dropping.remove(table);
            }
        }
    }

    /// Tombstones every table and empties the cache. Pair with
    /// [`end_drop_all`](Self::end_drop_all).
    pub fn begin_drop_all(&self) {
        self.dropping_all.fetch_add(1, Ordering::SeqCst);
        self.clear();
    }

    pub fn end_drop_all(&self) {
        self.clear();
        // Saturating: an unpaired end leaves the counter at zero.
        self.dropping_all
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok();
    }

    /// Settles the changes staged by a finished transaction. Builds are
    /// published only on commit; tombstones are lifted either way.
    pub fn complete(&self, changes: IndexChanges, committed: bool) {
        if committed && changes.dropped_all == 0 {
            for (table, names) in &changes.built {
                if changes.dropped.iter().any(|(dropped, _)| dropped == table) {
                    continue;
                }
                if !self.publish(table, names) {
                    tracing::debug!(table = %table, "Index build superseded by a drop");
                }
            }
        } else if !changes.built.is_empty() {
            tracing::debug!(
                tables = changes.built.len(),
                "Discarded index builds of a rolled back transaction"
            );
        }
        for (table, names) in &changes.dropped {
            self.end_drop(table, names);
        }
        for _ in 0..changes.dropped_all {
            self.end_drop_all();
        }
    }
}

//! SQLite hooks feeding the observers.
//!
//! The writer connection carries four hooks, all sharing one [`HookShared`]:
//!
//! - the update hook turns every changed row into a [`ChangeEvent`];
//! - the commit and rollback hooks record how a transaction ended, for
//!   transactions the caller ends itself;
//! - the authorizer records the tables and columns written by each
//!   statement, reports dropped tables, collects the tables and columns read
//!   by a statement being analysed, and disables SQLite's truncate
//!   optimization so that `DELETE FROM t` still reports each deleted row.
//!
//! The table writes let the writer report, at commit, the changes the
//! update hook never sees (see [`schema`](super::schema)).
//!
//! Hook callbacks never run SQL, and the hook state lock is never held while
//! SQL runs.

use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::hooks::{Action, AuthAction, AuthContext, Authorization};
use rusqlite::Connection;

use super::registry::ObserverEntry;
use super::schema::{merge_write, TableShape, TableWrite};
use crate::event::{ChangeEvent, OwnedChangeEvent};
use crate::observer::TransactionObserver;
use crate::region::{Region, Selector};

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Committed,
    RolledBack,
}

pub(crate) struct HookShared {
    state: Mutex<HookState>,
}

#[derive(Default)]
struct HookState {
    entries: Vec<Arc<ObserverEntry>>,
    next_id: u64,
    transaction: TransactionState,
    /// Set while a statement is prepared for region analysis.
    selection: Option<Region>,
    /// Shapes of written tables, by lowercased name. Cleared by any schema
    /// change.
    shapes: HashMap<String, Arc<TableShape>>,
}

/// A transaction that just ended.
pub(crate) struct FinishedTransaction {
    /// The observers to notify of its outcome.
    pub(crate) entries: Vec<Arc<ObserverEntry>>,
    /// Tables written outside of rolled back savepoints.
    pub(crate) writes: Vec<TableWrite>,
}

#[derive(Default)]
struct TransactionState {
    /// Observers were told that a transaction started.
    active: bool,
    committed: bool,
    rolled_back: bool,
    /// Columns assigned by UPDATE statements, per lowercased table.
    updated_columns: Vec<(String, Arc<BTreeSet<String>>)>,
    /// Lowercased tables and views being dropped.
    dropping: Vec<String>,
    writes: Vec<TableWrite>,
    /// Open savepoints, innermost last.
    savepoints: Vec<Savepoint>,
}

/// Changes held back while a savepoint is open.
#[derive(Default)]
struct Savepoint {
    events: Vec<OwnedChangeEvent>,
    writes: Vec<TableWrite>,
}

impl TransactionState {
    fn record_updated_column(&mut self, table: &str, column: &str) {
        let column = column.to_ascii_lowercase();
        match self
            .updated_columns
            .iter_mut()
            .find(|(name, _)| name.eq_ignore_ascii_case(table))
        {
            Some((_, columns)) => {
                if !columns.contains(&column) {
                    Arc::make_mut(columns).insert(column);
                }
            }
            None => self
                .updated_columns
                .push((table.to_ascii_lowercase(), Arc::new(BTreeSet::from([column])))),
        }
    }

    fn updated_columns(&self, table: &str) -> Option<Arc<BTreeSet<String>>> {
        self.updated_columns
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(table))
            .map(|(_, columns)| Arc::clone(columns))
    }

    fn is_dropping(&self, table: &str) -> bool {
        self.dropping.iter().any(|name| name.eq_ignore_ascii_case(table))
    }

    /// Record a table write in the innermost open savepoint.
    fn record_write(&mut self, table: &str, f: impl FnOnce(&mut TableWrite)) {
        let mut write = TableWrite::new(table);
        f(&mut write);
        let writes = match self.savepoints.last_mut() {
            Some(savepoint) => &mut savepoint.writes,
            None => &mut self.writes,
        };
        merge_write(writes, write);
    }
}

impl HookState {
    fn start(&mut self) {
        self.transaction.active = true;
        for entry in &self.entries {
            entry.with_observer(|observer| observer.transaction_did_start());
        }
    }

    fn deliver(&mut self, event: ChangeEvent<'_>) {
        if !self.transaction.active {
            self.start();
        }
        if let Some(savepoint) = self.transaction.savepoints.last_mut() {
            savepoint.events.push(event.into_owned());
            return;
        }
        notify_change(&self.entries, &event);
    }
}

pub(crate) fn notify_change(entries: &[Arc<ObserverEntry>], event: &ChangeEvent<'_>) {
    for entry in entries {
        entry.with_observer(|observer| observer.database_did_change(event));
    }
}

fn is_internal(table: &str) -> bool {
    table
        .get(..7)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("sqlite_"))
}

impl HookShared {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(HookState {
                next_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Install the hooks on the writer connection.
    pub(crate) fn install(self: &Arc<Self>, conn: &Connection) {
        let hooks = AssertUnwindSafe(Arc::clone(self));
        conn.update_hook(Some(
            move |action: Action, _database: &str, table: &str, rowid: i64| {
                hooks.on_row_change(action, table, rowid);
            },
        ));

        let hooks = AssertUnwindSafe(Arc::clone(self));
        conn.commit_hook(Some(move || {
            hooks.on_commit();
            false
        }));

        let hooks = AssertUnwindSafe(Arc::clone(self));
        conn.rollback_hook(Some(move || hooks.on_rollback()));

        let hooks = AssertUnwindSafe(Arc::clone(self));
        conn.authorizer(Some(move |context: AuthContext<'_>| {
            authorize(&hooks, context)
        }));
    }

    // Registry

    pub(crate) fn register(&self, observer: Box<dyn TransactionObserver>) -> u64 {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.entries.push(Arc::new(ObserverEntry::new(id, observer)));
        id
    }

    /// Unregister an observer. The entry is returned so that the observer
    /// is dropped after the lock is released.
    pub(crate) fn unregister(&self, id: u64) -> Option<Arc<ObserverEntry>> {
        let mut state = self.state.lock();
        let index = state.entries.iter().position(|entry| entry.id() == id)?;
        let entry = state.entries.remove(index);
        entry.deactivate();
        Some(entry)
    }

    pub(crate) fn observer_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Unregister every observer. The entries stay active until the caller
    /// deactivates them.
    pub(crate) fn drain(&self) -> Vec<Arc<ObserverEntry>> {
        std::mem::take(&mut self.state.lock().entries)
    }

    // Transactions

    /// Forget the current transaction without notifying observers.
    pub(crate) fn reset_transaction(&self) {
        self.state.lock().transaction = TransactionState::default();
    }

    /// A transaction was opened by the writer.
    pub(crate) fn begin_transaction(&self) {
        let mut state = self.state.lock();
        state.transaction = TransactionState::default();
        state.start();
    }

    /// How the current transaction ended, if observers were told it started
    /// or SQLite reported its end.
    ///
    /// Several autocommit statements are folded into one outcome, which is
    /// `Committed` if any of them committed.
    pub(crate) fn recorded_outcome(&self) -> Option<Outcome> {
        let state = self.state.lock();
        let transaction = &state.transaction;
        if transaction.committed {
            Some(Outcome::Committed)
        } else if transaction.rolled_back || transaction.active {
            Some(Outcome::RolledBack)
        } else {
            None
        }
    }

    /// Reset the transaction state and return what its outcome must be
    /// reported with.
    pub(crate) fn end_transaction(&self) -> FinishedTransaction {
        let mut state = self.state.lock();
        let transaction = std::mem::take(&mut state.transaction);
        FinishedTransaction {
            entries: state.entries.clone(),
            writes: transaction.writes,
        }
    }

    pub(crate) fn savepoint_depth(&self) -> usize {
        self.state.lock().transaction.savepoints.len()
    }

    pub(crate) fn push_savepoint(&self) {
        self.state.lock().transaction.savepoints.push(Savepoint::default());
    }

    /// The innermost savepoint was released: its events now belong to the
    /// enclosing savepoint, or reach the observers.
    pub(crate) fn release_savepoint(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(savepoint) = state.transaction.savepoints.pop() else {
            return;
        };
        match state.transaction.savepoints.last_mut() {
            Some(parent) => {
                parent.events.extend(savepoint.events);
                for write in savepoint.writes {
                    merge_write(&mut parent.writes, write);
                }
            }
            None => {
                for event in &savepoint.events {
                    notify_change(&state.entries, &event.as_event());
                }
                for write in savepoint.writes {
                    merge_write(&mut state.transaction.writes, write);
                }
            }
        }
    }

    /// The innermost savepoint was rolled back: its events and writes are
    /// discarded.
    pub(crate) fn rollback_savepoint(&self) {
        self.state.lock().transaction.savepoints.pop();
    }

    // Region analysis

    pub(crate) fn begin_selection(&self) {
        self.state.lock().selection = Some(Region::empty());
    }

    pub(crate) fn end_selection(&self) -> Region {
        self.state.lock().selection.take().unwrap_or_default()
    }

    // Table shapes

    pub(crate) fn cached_shape(&self, table: &str) -> Option<Arc<TableShape>> {
        self.state.lock().shapes.get(table).cloned()
    }

    pub(crate) fn cache_shape(&self, table: &str, shape: Arc<TableShape>) {
        self.state.lock().shapes.insert(table.to_string(), shape);
    }

    // Hook callbacks

    fn on_row_change(&self, action: Action, table: &str, rowid: i64) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match action {
            Action::SQLITE_INSERT => {
                tracing::trace!(table, rowid, "row inserted");
                state.deliver(ChangeEvent::Inserted { table, rowid });
            }
            Action::SQLITE_DELETE => {
                tracing::trace!(table, rowid, "row deleted");
                state.deliver(ChangeEvent::Deleted { table, rowid });
            }
            Action::SQLITE_UPDATE => {
                tracing::trace!(table, rowid, "row updated");
                let columns = state.transaction.updated_columns(table);
                state.deliver(ChangeEvent::Updated {
                    table,
                    rowid,
                    columns: columns.as_deref(),
                });
            }
            _ => {}
        }
    }

    fn on_commit(&self) {
        self.state.lock().transaction.committed = true;
    }

    fn on_rollback(&self) {
        self.state.lock().transaction.rolled_back = true;
    }
}

fn authorize(hooks: &HookShared, context: AuthContext<'_>) -> Authorization {
    let mut guard = hooks.state.lock();
    let state = &mut *guard;

    match context.action {
        AuthAction::Read {
            table_name,
            column_name,
        } => {
            if let Some(selection) = state.selection.as_mut() {
                let selector = if column_name.is_empty() {
                    Selector::AllColumns
                } else {
                    Selector::Columns(BTreeSet::from([column_name.to_ascii_lowercase()]))
                };
                selection.insert(table_name, selector);
            }
            Authorization::Allow
        }
        AuthAction::Insert { table_name } => {
            if state.selection.is_none() && !is_internal(table_name) {
                state
                    .transaction
                    .record_write(table_name, |write| write.inserted = true);
            }
            Authorization::Allow
        }
        AuthAction::Update {
            table_name,
            column_name,
        } => {
            if state.selection.is_none() && !is_internal(table_name) {
                let transaction = &mut state.transaction;
                transaction.record_updated_column(table_name, column_name);
                transaction.record_write(table_name, |write| {
                    write.updated.insert(column_name.to_ascii_lowercase());
                });
            }
            Authorization::Allow
        }
        AuthAction::Delete { table_name } => {
            if is_internal(table_name) || state.transaction.is_dropping(table_name) {
                return Authorization::Allow;
            }
            if state.selection.is_none() {
                state
                    .transaction
                    .record_write(table_name, |write| write.deleted = true);
            }
            // Ignore turns off the truncate optimization without denying the
            // statement, so every deleted row reaches the update hook.
            Authorization::Ignore
        }
        AuthAction::DropTable { table_name } | AuthAction::DropTempTable { table_name } => {
            state.shapes.clear();
            state.transaction.dropping.push(table_name.to_ascii_lowercase());
            if state.selection.is_none() {
                tracing::trace!(table = table_name, "table dropped");
                state.deliver(ChangeEvent::Truncated { table: table_name });
            }
            Authorization::Allow
        }
        AuthAction::DropView { view_name } | AuthAction::DropTempView { view_name } => {
            state.transaction.dropping.push(view_name.to_ascii_lowercase());
            Authorization::Allow
        }
        AuthAction::CreateTable { .. }
        | AuthAction::CreateTempTable { .. }
        | AuthAction::CreateIndex { .. }
        | AuthAction::CreateTempIndex { .. }
        | AuthAction::DropIndex { .. }
        | AuthAction::DropTempIndex { .. }
        | AuthAction::AlterTable { .. } => {
            state.shapes.clear();
            Authorization::Allow
        }
        _ => Authorization::Allow,
    }
}

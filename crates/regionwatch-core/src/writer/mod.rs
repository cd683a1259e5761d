//! The serialized database writer.
//!
//! A [`Writer`] owns the only connection allowed to modify the database.
//! Every write runs in a transaction, one at a time, and every registered
//! [`TransactionObserver`] is driven by the hooks installed on that
//! connection:
//!
//! ```text
//!  write(f) ──► BEGIN ──► f(db) ──► COMMIT ──► database_did_commit(db)
//!                            │                        │
//!                   update hook events        observers may read, or
//!                                             write via reentrant_write
//! ```
//!
//! Observers are called on the thread performing the write, while the
//! writer is still locked: no other write can slip in between a commit and
//! its notification.

mod config;
mod hooks;
mod registry;
mod schema;

use std::cell::{Cell, RefCell};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use rusqlite::Connection;

use self::hooks::{notify_change, FinishedTransaction, HookShared, Outcome};
use self::registry::ObserverEntry;
use self::schema::{TableShape, TableWrite, Unreported};
use crate::error::{Error, Result};
use crate::event::ChangeEvent;
use crate::observer::TransactionObserver;
use crate::region::Region;

pub use self::config::{Location, TransactionKind, WriterConfig, DEFAULT_BUSY_TIMEOUT};
pub use self::registry::RegistrationHandle;

/// Serialized access to a SQLite database with transaction observation.
///
/// Cloning a writer yields another handle to the same connection.
#[derive(Clone)]
pub struct Writer {
    shared: Arc<WriterShared>,
}

pub(crate) struct WriterShared {
    core: ReentrantMutex<WriterCore>,
    hooks: Arc<HookShared>,
    config: WriterConfig,
    closed: AtomicBool,
}

struct WriterCore {
    conn: RefCell<Option<Connection>>,
    /// Set while the lock owner runs a write or serialized closure.
    in_write: Cell<bool>,
}

impl WriterShared {
    pub(crate) fn remove_observer(&self, id: u64) {
        // Waits for a write in flight on another thread.
        let core = self.core.lock();
        let entry = self.hooks.unregister(id);
        drop(core);

        if entry.is_some() {
            tracing::debug!(
                writer = %self.config.label,
                observer_id = id,
                "transaction observer removed"
            );
        }
    }
}

/// Clears the write flag when a write scope ends, including by panic.
struct WriteScope<'a> {
    flag: &'a Cell<bool>,
}

impl<'a> WriteScope<'a> {
    fn enter(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self { flag }
    }
}

impl Drop for WriteScope<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

impl Writer {
    /// Open a writer.
    pub fn open(config: WriterConfig) -> Result<Self> {
        let conn = match &config.location {
            Location::Memory => Connection::open_in_memory()?,
            Location::File(path) => Connection::open(path)?,
        };

        conn.busy_timeout(config.busy_timeout)?;
        if config.foreign_keys {
            conn.execute_batch("PRAGMA foreign_keys = ON")?;
        }
        if config.wal && !config.is_in_memory() {
            let mode: String =
                conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
            tracing::debug!(writer = %config.label, journal_mode = %mode, "journal mode set");
        }

        // Statements must be prepared again on every use so that the
        // authorizer sees each of them.
        conn.set_prepared_statement_cache_capacity(0);

        let hooks = Arc::new(HookShared::new());
        hooks.install(&conn);

        tracing::info!(
            writer = %config.label,
            location = ?config.location,
            "writer opened"
        );

        Ok(Self {
            shared: Arc::new(WriterShared {
                core: ReentrantMutex::new(WriterCore {
                    conn: RefCell::new(Some(conn)),
                    in_write: Cell::new(false),
                }),
                hooks,
                config,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Open a writer on a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(WriterConfig::in_memory())
    }

    /// The writer configuration.
    pub fn config(&self) -> &WriterConfig {
        &self.shared.config
    }

    /// Run `f` in a transaction.
    ///
    /// The transaction commits if `f` returns `Ok`, and rolls back
    /// otherwise. Observers are notified of the outcome before this returns.
    ///
    /// Fails with [`Error::ReentrantWrite`] when called from inside another
    /// write or an observer callback on the same thread.
    pub fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Db<'_>) -> Result<T>,
    {
        let core = self.shared.core.lock();
        if core.in_write.get() {
            tracing::warn!(
                writer = %self.shared.config.label,
                "write attempted from inside the writer"
            );
            return Err(Error::ReentrantWrite);
        }
        let _scope = WriteScope::enter(&core.in_write);

        let conn = core.conn.borrow();
        let conn = conn.as_ref().ok_or(Error::Closed)?;
        self.recover(conn);
        let result = self.run_transaction(conn, f);

        // Autocommit statements run by commit callbacks.
        self.dispatch_pending(&Db { conn, writer: self });
        result
    }

    /// Run `f` in a transaction, or in a savepoint of the current one.
    ///
    /// Outside of a write this behaves like [`write`](Writer::write). Inside
    /// a transaction, `f` runs in a savepoint: the savepoint is released if
    /// `f` returns `Ok` and rolled back otherwise, and the enclosing
    /// transaction decides what is committed. Inside a commit notification,
    /// `f` runs in a new transaction.
    pub fn reentrant_write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Db<'_>) -> Result<T>,
    {
        let core = self.shared.core.lock();
        if !core.in_write.get() {
            drop(core);
            return self.write(f);
        }

        let conn = core.conn.borrow();
        let conn = conn.as_ref().ok_or(Error::Closed)?;
        if conn.is_autocommit() {
            self.run_transaction(conn, f)
        } else {
            self.run_savepoint(conn, f)
        }
    }

    /// Run `f` with exclusive access to the connection, outside of any
    /// transaction.
    ///
    /// No write can start while `f` runs. Statements executed by `f` run in
    /// autocommit mode; once `f` returns, observers are notified once for all
    /// of them.
    pub fn serialized<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Db<'_>) -> Result<T>,
    {
        let core = self.shared.core.lock();
        if core.in_write.get() {
            return Err(Error::ReentrantWrite);
        }
        let _scope = WriteScope::enter(&core.in_write);

        let conn = core.conn.borrow();
        let conn = conn.as_ref().ok_or(Error::Closed)?;
        self.recover(conn);
        self.shared.hooks.reset_transaction();

        let db = Db { conn, writer: self };
        let result = f(&db);

        if !conn.is_autocommit() {
            tracing::warn!(
                writer = %self.shared.config.label,
                "serialized closure left a transaction open, rolling back"
            );
            rollback_quietly(conn);
        }
        self.dispatch_pending(&db);

        result
    }

    /// Register an observer.
    ///
    /// The observer is driven by every transaction that starts after this
    /// returns, until the returned handle is removed or dropped.
    pub fn add_observer<O>(&self, observer: O) -> Result<RegistrationHandle>
    where
        O: TransactionObserver + 'static,
    {
        let core = self.shared.core.lock();
        if core.conn.borrow().is_none() {
            return Err(Error::Closed);
        }

        let id = self.shared.hooks.register(Box::new(observer));
        drop(core);

        tracing::debug!(
            writer = %self.shared.config.label,
            observer_id = id,
            "transaction observer registered"
        );
        Ok(RegistrationHandle::new(id, Arc::downgrade(&self.shared)))
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.shared.hooks.observer_count()
    }

    /// Close the connection.
    ///
    /// Every registered observer is told with `writer_did_close` and
    /// unregistered. Later writes fail with [`Error::Closed`]. Closing a
    /// closed writer does nothing.
    pub fn close(&self) -> Result<()> {
        let core = self.shared.core.lock();
        if core.in_write.get() {
            return Err(Error::ReentrantWrite);
        }
        let Some(conn) = core.conn.borrow_mut().take() else {
            return Ok(());
        };
        self.shared.closed.store(true, Ordering::SeqCst);

        let entries = self.shared.hooks.drain();
        for entry in &entries {
            entry.with_observer(|observer| observer.writer_did_close());
            entry.deactivate();
        }
        drop(core);
        drop(entries);

        conn.close().map_err(|(_, err)| Error::Sqlite(err))?;
        tracing::info!(writer = %self.shared.config.label, "writer closed");
        Ok(())
    }

    /// Returns `true` once [`close`](Writer::close) was called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Roll back a transaction left open by a closure that panicked.
    fn recover(&self, conn: &Connection) {
        if !conn.is_autocommit() {
            tracing::warn!(
                writer = %self.shared.config.label,
                "rolling back transaction left open by a previous write"
            );
            rollback_quietly(conn);
            self.shared.hooks.reset_transaction();
        }
    }

    fn run_transaction<T, F>(&self, conn: &Connection, f: F) -> Result<T>
    where
        F: FnOnce(&Db<'_>) -> Result<T>,
    {
        let db = Db { conn, writer: self };

        // Autocommit statements run earlier in a serialized closure.
        self.dispatch_pending(&db);

        conn.execute_batch(self.shared.config.transaction_kind.begin_sql())?;
        self.shared.hooks.begin_transaction();

        let (result, outcome) = match f(&db) {
            Ok(value) if conn.is_autocommit() => {
                // `f` ended the transaction itself.
                let outcome = self
                    .shared
                    .hooks
                    .recorded_outcome()
                    .unwrap_or(Outcome::RolledBack);
                (Ok(value), outcome)
            }
            Ok(value) => match conn.execute_batch("COMMIT") {
                Ok(()) => (Ok(value), Outcome::Committed),
                Err(err) => {
                    rollback_quietly(conn);
                    (Err(err.into()), Outcome::RolledBack)
                }
            },
            Err(err) => {
                rollback_quietly(conn);
                (Err(err), Outcome::RolledBack)
            }
        };

        self.dispatch(&db, outcome);
        result
    }

    fn run_savepoint<T, F>(&self, conn: &Connection, f: F) -> Result<T>
    where
        F: FnOnce(&Db<'_>) -> Result<T>,
    {
        let hooks = &self.shared.hooks;
        let name = format!("regionwatch_{}", hooks.savepoint_depth());

        conn.execute_batch(&format!("SAVEPOINT {name}"))?;
        hooks.push_savepoint();

        let db = Db { conn, writer: self };
        match f(&db) {
            Ok(value) => match conn.execute_batch(&format!("RELEASE SAVEPOINT {name}")) {
                Ok(()) => {
                    hooks.release_savepoint();
                    Ok(value)
                }
                Err(err) => {
                    self.rollback_savepoint(conn, &name);
                    Err(err.into())
                }
            },
            Err(err) => {
                self.rollback_savepoint(conn, &name);
                Err(err)
            }
        }
    }

    fn rollback_savepoint(&self, conn: &Connection, name: &str) {
        let sql = format!("ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}");
        if let Err(err) = conn.execute_batch(&sql) {
            tracing::warn!(
                writer = %self.shared.config.label,
                savepoint = name,
                error = %err,
                "savepoint rollback failed"
            );
        }
        self.shared.hooks.rollback_savepoint();
    }

    /// Notify observers of a transaction that ended outside of
    /// `run_transaction`.
    fn dispatch_pending(&self, db: &Db<'_>) {
        match self.shared.hooks.recorded_outcome() {
            Some(outcome) => self.dispatch(db, outcome),
            None => self.shared.hooks.reset_transaction(),
        }
    }

    fn dispatch(&self, db: &Db<'_>, outcome: Outcome) {
        // Reset first: observers may start new transactions.
        let FinishedTransaction { entries, writes } = self.shared.hooks.end_transaction();

        match outcome {
            Outcome::Committed => {
                tracing::debug!(
                    writer = %self.shared.config.label,
                    observers = entries.len(),
                    "transaction committed"
                );
                if !entries.is_empty() {
                    self.report_unseen_changes(db.conn, &entries, &writes);
                }
                let notified: Vec<_> = entries
                    .iter()
                    .filter(|entry| {
                        entry
                            .with_observer(|observer| observer.transaction_did_commit())
                            .unwrap_or(false)
                    })
                    .collect();
                for entry in notified {
                    entry.with_observer(|observer| observer.database_did_commit(db));
                    if db.is_in_transaction() {
                        tracing::warn!(
                            writer = %self.shared.config.label,
                            observer_id = entry.id(),
                            "commit callback left a transaction open, rolling back"
                        );
                        rollback_quietly(db.conn);
                    }
                }
            }
            Outcome::RolledBack => {
                tracing::debug!(
                    writer = %self.shared.config.label,
                    observers = entries.len(),
                    "transaction rolled back"
                );
                for entry in &entries {
                    entry.with_observer(|observer| observer.database_did_rollback());
                }
            }
        }
    }
}

impl Writer {
    /// Report the committed changes the update hook did not see.
    fn report_unseen_changes(
        &self,
        conn: &Connection,
        entries: &[Arc<ObserverEntry>],
        writes: &[TableWrite],
    ) {
        for write in writes {
            let unreported = match self.table_shape(conn, &write.table) {
                Some(shape) => shape.unreported(write),
                None => None,
            };
            let columns = match unreported {
                Some(Unreported::Columns(columns)) => Some(columns),
                Some(Unreported::Rows) => None,
                None => continue,
            };
            tracing::trace!(table = %write.table, "rows modified unseen");
            notify_change(
                entries,
                &ChangeEvent::Modified {
                    table: &write.table,
                    columns,
                },
            );
        }
    }

    /// The shape of a written table, or `None` if it no longer exists as a
    /// table. A shape that cannot be read counts as a WITHOUT ROWID table
    /// with unique keys, so that every write is reported.
    fn table_shape(&self, conn: &Connection, table: &str) -> Option<Arc<TableShape>> {
        let hooks = &self.shared.hooks;
        if let Some(shape) = hooks.cached_shape(table) {
            return Some(shape);
        }
        match TableShape::load(conn, table) {
            Ok(Some(shape)) => {
                let shape = Arc::new(shape);
                hooks.cache_shape(table, Arc::clone(&shape));
                Some(shape)
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(
                    writer = %self.shared.config.label,
                    table,
                    error = %err,
                    "failed to read table shape"
                );
                Some(Arc::new(TableShape::opaque()))
            }
        }
    }
}

impl fmt::Debug for Writer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer")
            .field("label", &self.shared.config.label)
            .field("location", &self.shared.config.location)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn rollback_quietly(conn: &Connection) {
    if conn.is_autocommit() {
        return;
    }
    if let Err(err) = conn.execute_batch("ROLLBACK") {
        tracing::warn!(error = %err, "rollback failed");
    }
}

/// Access to the writer connection from inside the writer.
///
/// Handed to write closures and observer callbacks. Dereferences to the
/// underlying [`rusqlite::Connection`].
///
/// Transactions should be opened with [`Db::reentrant_write`]. A commit
/// callback that runs `BEGIN` itself and leaves the transaction open has it
/// rolled back, with a warning, as soon as the callback returns.
pub struct Db<'a> {
    conn: &'a Connection,
    writer: &'a Writer,
}

impl<'a> Db<'a> {
    /// The underlying connection.
    pub fn connection(&self) -> &'a Connection {
        self.conn
    }

    /// The writer this access belongs to.
    pub fn writer(&self) -> &'a Writer {
        self.writer
    }

    /// Returns `true` if a transaction is open.
    pub fn is_in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    /// The tables and columns a read-only statement reads.
    ///
    /// The statement is prepared but not run. A table accessed without
    /// reading any column, as in `SELECT COUNT(*) FROM t`, is selected
    /// whole.
    pub fn region_of(&self, sql: &str) -> Result<Region> {
        let hooks = &self.writer.shared.hooks;
        hooks.begin_selection();
        let prepared = self.conn.prepare(sql);
        let region = hooks.end_selection();

        let statement = prepared?;
        if !statement.readonly() {
            return Err(Error::NotReadOnly(sql.to_string()));
        }
        Ok(region)
    }

    /// See [`Writer::reentrant_write`].
    pub fn reentrant_write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Db<'_>) -> Result<T>,
    {
        self.writer.reentrant_write(f)
    }
}

impl Deref for Db<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
    }
}

impl fmt::Debug for Db<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Db")
            .field("writer", self.writer)
            .field("in_transaction", &self.is_in_transaction())
            .finish()
    }
}

//! Changes the update hook does not report.
//!
//! SQLite's update hook is silent for WITHOUT ROWID tables, and for rows
//! deleted by REPLACE conflict resolution. The authorizer still sees every
//! table a statement writes, so each transaction keeps a [`TableWrite`] per
//! written table. At commit the writer looks up the [`TableShape`] of each
//! and reports a [`ChangeEvent::Modified`] where rows may have changed
//! unseen.
//!
//! [`ChangeEvent::Modified`]: crate::event::ChangeEvent::Modified

use std::collections::BTreeSet;

use rusqlite::Connection;

/// The columns SQLite accepts as rowid aliases.
const ROWID_NAMES: [&str; 3] = ["rowid", "oid", "_rowid_"];

/// What the statements of a transaction did to one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct TableWrite {
    /// Lowercased table name.
    pub(crate) table: String,
    pub(crate) inserted: bool,
    pub(crate) deleted: bool,
    /// Lowercased columns assigned by UPDATE statements.
    pub(crate) updated: BTreeSet<String>,
}

impl TableWrite {
    pub(crate) fn new(table: &str) -> Self {
        Self {
            table: table.to_ascii_lowercase(),
            ..Default::default()
        }
    }

    /// Fold the writes of a released savepoint into this one.
    pub(crate) fn merge(&mut self, other: TableWrite) {
        self.inserted |= other.inserted;
        self.deleted |= other.deleted;
        self.updated.extend(other.updated);
    }
}

/// Add `write` to `writes`, merging with the entry for the same table.
pub(crate) fn merge_write(writes: &mut Vec<TableWrite>, write: TableWrite) {
    match writes.iter_mut().find(|w| w.table == write.table) {
        Some(existing) => existing.merge(write),
        None => writes.push(write),
    }
}

/// Changes a table write may have made without the update hook seeing them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Unreported<'a> {
    /// Unknown rows had these columns assigned.
    Columns(&'a BTreeSet<String>),
    /// Unknown rows were inserted or deleted.
    Rows,
}

/// The parts of a table definition that decide what the update hook misses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct TableShape {
    without_rowid: bool,
    unique_index: bool,
    /// Lowercased primary key columns, unique index columns, and rowid
    /// aliases.
    key_columns: BTreeSet<String>,
    /// A unique index is built on an expression.
    expression_key: bool,
}

impl TableShape {
    /// Read the shape of a table. Returns `None` for views, virtual tables,
    /// and tables that no longer exist.
    pub(crate) fn load(conn: &Connection, table: &str) -> rusqlite::Result<Option<Self>> {
        let without_rowid: Option<i64> = conn.query_row(
            "SELECT max(wr) FROM pragma_table_list WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
            [table],
            |row| row.get(0),
        )?;
        let Some(without_rowid) = without_rowid else {
            return Ok(None);
        };

        let mut shape = TableShape {
            without_rowid: without_rowid != 0,
            ..Default::default()
        };
        if !shape.without_rowid {
            shape
                .key_columns
                .extend(ROWID_NAMES.iter().map(|name| name.to_string()));
        }

        let mut stmt = conn.prepare("SELECT lower(name) FROM pragma_table_info(?1) WHERE pk > 0")?;
        for name in stmt.query_map([table], |row| row.get::<_, String>(0))? {
            shape.key_columns.insert(name?);
        }

        let mut stmt = conn.prepare("SELECT name FROM pragma_index_list(?1) WHERE \"unique\" = 1")?;
        let indexes = stmt
            .query_map([table], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare("SELECT lower(name) FROM pragma_index_info(?1)")?;
        for index in &indexes {
            shape.unique_index = true;
            for name in stmt.query_map([index], |row| row.get::<_, Option<String>>(0))? {
                match name? {
                    Some(name) => {
                        shape.key_columns.insert(name);
                    }
                    None => shape.expression_key = true,
                }
            }
        }

        Ok(Some(shape))
    }

    /// A shape for which every write is reported.
    pub(crate) fn opaque() -> Self {
        Self {
            without_rowid: true,
            unique_index: true,
            expression_key: true,
            ..Default::default()
        }
    }

    /// What `write` may have changed that the update hook did not report.
    pub(crate) fn unreported<'a>(&self, write: &'a TableWrite) -> Option<Unreported<'a>> {
        if self.may_replace(write) {
            return Some(Unreported::Rows);
        }
        if !self.without_rowid {
            return None;
        }
        if write.inserted || write.deleted {
            Some(Unreported::Rows)
        } else if !write.updated.is_empty() {
            Some(Unreported::Columns(&write.updated))
        } else {
            None
        }
    }

    /// REPLACE conflict resolution may have deleted rows, or an update
    /// moved a row to another key.
    fn may_replace(&self, write: &TableWrite) -> bool {
        let updates_key = !write.updated.is_empty()
            && (self.expression_key || !self.key_columns.is_disjoint(&write.updated));
        (write.inserted && self.unique_index) || updates_key
    }
}

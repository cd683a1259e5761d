//! Row-level change events produced by the writer.

use std::collections::BTreeSet;
use std::sync::Arc;

/// A change performed by one statement on one row (or a whole table).
///
/// Events borrow from the writer's hook state and live only for the duration
/// of a single observer call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent<'a> {
    /// A row was inserted.
    Inserted {
        /// Table name, as declared in the schema.
        table: &'a str,
        /// Rowid of the new row.
        rowid: i64,
    },
    /// A row was updated.
    Updated {
        /// Table name, as declared in the schema.
        table: &'a str,
        /// Rowid of the updated row.
        rowid: i64,
        /// Lowercased names of the assigned columns. `None` when unknown,
        /// which matches every column.
        columns: Option<&'a BTreeSet<String>>,
    },
    /// A row was deleted.
    Deleted {
        /// Table name, as declared in the schema.
        table: &'a str,
        /// Rowid of the deleted row.
        rowid: i64,
    },
    /// Rows of a table changed, but which rows is unknown.
    ///
    /// Reported at commit for WITHOUT ROWID tables, and for rows that
    /// REPLACE conflict resolution may have deleted.
    Modified {
        /// Table name, as declared in the schema.
        table: &'a str,
        /// Lowercased names of the changed columns. `None` when whole rows
        /// were inserted or deleted.
        columns: Option<&'a BTreeSet<String>>,
    },
    /// Every row of a table went away at once.
    Truncated {
        /// Table name, as declared in the schema.
        table: &'a str,
    },
}

impl<'a> ChangeEvent<'a> {
    /// The table this event applies to.
    pub fn table(&self) -> &'a str {
        match *self {
            ChangeEvent::Inserted { table, .. }
            | ChangeEvent::Updated { table, .. }
            | ChangeEvent::Deleted { table, .. }
            | ChangeEvent::Modified { table, .. }
            | ChangeEvent::Truncated { table } => table,
        }
    }

    /// The rowid this event applies to, if it targets a single row.
    pub fn rowid(&self) -> Option<i64> {
        match *self {
            ChangeEvent::Inserted { rowid, .. }
            | ChangeEvent::Updated { rowid, .. }
            | ChangeEvent::Deleted { rowid, .. } => Some(rowid),
            ChangeEvent::Modified { .. } | ChangeEvent::Truncated { .. } => None,
        }
    }

    pub(crate) fn into_owned(self) -> OwnedChangeEvent {
        match self {
            ChangeEvent::Inserted { table, rowid } => OwnedChangeEvent::Inserted {
                table: table.to_string(),
                rowid,
            },
            ChangeEvent::Updated {
                table,
                rowid,
                columns,
            } => OwnedChangeEvent::Updated {
                table: table.to_string(),
                rowid,
                columns: columns.map(|c| Arc::new(c.clone())),
            },
            ChangeEvent::Deleted { table, rowid } => OwnedChangeEvent::Deleted {
                table: table.to_string(),
                rowid,
            },
            ChangeEvent::Modified { table, columns } => OwnedChangeEvent::Modified {
                table: table.to_string(),
                columns: columns.map(|c| Arc::new(c.clone())),
            },
            ChangeEvent::Truncated { table } => OwnedChangeEvent::Truncated {
                table: table.to_string(),
            },
        }
    }
}

/// An event held back while a savepoint is open.
#[derive(Debug, Clone)]
pub(crate) enum OwnedChangeEvent {
    Inserted {
        table: String,
        rowid: i64,
    },
    Updated {
        table: String,
        rowid: i64,
        columns: Option<Arc<BTreeSet<String>>>,
    },
    Deleted {
        table: String,
        rowid: i64,
    },
    Modified {
        table: String,
        columns: Option<Arc<BTreeSet<String>>>,
    },
    Truncated {
        table: String,
    },
}

impl OwnedChangeEvent {
    pub(crate) fn as_event(&self) -> ChangeEvent<'_> {
        match self {
            OwnedChangeEvent::Inserted { table, rowid } => ChangeEvent::Inserted {
                table: table.as_str(),
                rowid: *rowid,
            },
            OwnedChangeEvent::Updated {
                table,
                rowid,
                columns,
            } => ChangeEvent::Updated {
                table: table.as_str(),
                rowid: *rowid,
                columns: columns.as_deref(),
            },
            OwnedChangeEvent::Deleted { table, rowid } => ChangeEvent::Deleted {
                table: table.as_str(),
                rowid: *rowid,
            },
            OwnedChangeEvent::Modified { table, columns } => ChangeEvent::Modified {
                table: table.as_str(),
                columns: columns.as_deref(),
            },
            OwnedChangeEvent::Truncated { table } => ChangeEvent::Truncated {
                table: table.as_str(),
            },
        }
    }
}

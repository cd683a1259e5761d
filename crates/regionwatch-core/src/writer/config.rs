//! Writer configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default busy timeout (5 seconds).
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// A private in-memory database, dropped with the writer.
    Memory,
    /// A database file.
    File(PathBuf),
}

/// How `write` opens its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionKind {
    /// `BEGIN DEFERRED`: locks are taken on first access.
    Deferred,
    /// `BEGIN IMMEDIATE`: the write lock is taken up front.
    #[default]
    Immediate,
    /// `BEGIN EXCLUSIVE`: readers on other connections are locked out too.
    Exclusive,
}

impl TransactionKind {
    pub(crate) fn begin_sql(self) -> &'static str {
        match self {
            TransactionKind::Deferred => "BEGIN DEFERRED",
            TransactionKind::Immediate => "BEGIN IMMEDIATE",
            TransactionKind::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

/// Configuration for a [`Writer`](super::Writer).
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Database location.
    pub location: Location,

    /// How long a statement waits for locks held by other connections.
    pub busy_timeout: Duration,

    /// Transaction kind used by `write`.
    pub transaction_kind: TransactionKind,

    /// Switch file databases to WAL journal mode.
    pub wal: bool,

    /// Enforce foreign key constraints.
    pub foreign_keys: bool,

    /// Name used in log events.
    pub label: String,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            location: Location::Memory,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            transaction_kind: TransactionKind::default(),
            wal: true,
            foreign_keys: true,
            label: "writer".to_string(),
        }
    }
}

impl WriterConfig {
    /// Create a configuration for a database file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            location: Location::File(path.into()),
            ..Default::default()
        }
    }

    /// Create a configuration for a private in-memory database.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Set the busy timeout.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Set the transaction kind used by `write`.
    pub fn with_transaction_kind(mut self, kind: TransactionKind) -> Self {
        self.transaction_kind = kind;
        self
    }

    /// Keep the default rollback journal instead of WAL.
    pub fn without_wal(mut self) -> Self {
        self.wal = false;
        self
    }

    /// Set whether foreign keys are enforced.
    pub fn with_foreign_keys(mut self, enabled: bool) -> Self {
        self.foreign_keys = enabled;
        self
    }

    /// Set the label used in log events.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Check if the database lives in memory.
    pub fn is_in_memory(&self) -> bool {
        self.location == Location::Memory
    }
}

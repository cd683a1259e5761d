//! Regionwatch: observe committed SQLite transactions that touch a declared
//! region of the database.
//!
//! All writes go through a [`Writer`]. A [`RegionObservation`] declares the
//! tables, columns, or rows a consumer depends on, and is started on the
//! writer either with a plain callback ([`RegionObservation::start`]), with
//! a [`Sink`] ([`observe`]), or as a stream of fetched values ([`values`]).
//! The consumer is notified once per committed transaction that touched
//! the region, never for rolled back transactions.
//!
//! ```no_run
//! use futures::StreamExt;
//! use regionwatch::{ObserveOptions, RegionObservation, Writer};
//!
//! # async fn run() -> regionwatch::Result<()> {
//! let writer = Writer::open_in_memory()?;
//! writer.write(|db| {
//!     db.execute_batch("CREATE TABLE player (id INTEGER PRIMARY KEY, name TEXT)")?;
//!     Ok(())
//! })?;
//!
//! let mut counts = RegionObservation::new()
//!     .tracking_sql("SELECT * FROM player")
//!     .values(&writer, ObserveOptions::default(), |db| {
//!         Ok(db.query_row("SELECT COUNT(*) FROM player", [], |row| row.get::<_, i64>(0))?)
//!     });
//!
//! while let Some(count) = counts.next().await {
//!     println!("{} players", count?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod observation;
pub mod reactive;

pub use observation::{RegionObservation, RegionSource, SqlRegion};
pub use reactive::{
    observe, values, CallbackSink, ObserveOptions, Sink, Subscription, ValueStream,
};
pub use regionwatch_core::{
    ChangeEvent, Db, Error, Location, ObserverState, Region, RegionObserver, RegionTracker,
    RegistrationHandle, Result, Selector, TableRegion, TransactionKind, TransactionObserver,
    Writer, WriterConfig, DEFAULT_BUSY_TIMEOUT,
};

pub use rusqlite;

//! Regionwatch core: regions, transaction observers, and the serialized
//! SQLite writer that drives them.

pub mod error;
pub mod event;
pub mod observer;
pub mod region;
pub mod tracker;
pub mod writer;

pub use error::{Error, Result};
pub use event::ChangeEvent;
pub use observer::{ObserverState, RegionObserver, TransactionObserver};
pub use region::{Region, Selector, TableRegion};
pub use tracker::RegionTracker;
pub use writer::{
    Db, Location, RegistrationHandle, TransactionKind, Writer, WriterConfig,
    DEFAULT_BUSY_TIMEOUT,
};

//! Region observations.
//!
//! A [`RegionObservation`] declares what to watch, as one or more region
//! sources, and starts observers for it on a [`Writer`].

use std::fmt;
use std::sync::Arc;

use regionwatch_core::{Db, Region, RegionObserver, RegistrationHandle, Result, Writer};

use crate::reactive::{self, ObserveOptions, Sink, Subscription, ValueStream};

/// Something that yields a region.
///
/// Sources are resolved inside the writer's serialized context, so they may
/// read the schema or the data.
pub trait RegionSource: Send + Sync {
    /// Compute the region.
    fn region(&self, db: &Db<'_>) -> Result<Region>;
}

impl RegionSource for Region {
    fn region(&self, _db: &Db<'_>) -> Result<Region> {
        Ok(self.clone())
    }
}

/// The tables and columns read by a read-only SQL statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlRegion {
    sql: String,
}

impl SqlRegion {
    /// Create a source for a statement.
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }

    /// The statement text.
    pub fn sql(&self) -> &str {
        &self.sql
    }
}

impl RegionSource for SqlRegion {
    fn region(&self, db: &Db<'_>) -> Result<Region> {
        db.region_of(&self.sql)
    }
}

struct FnRegion<F>(F);

impl<F> RegionSource for FnRegion<F>
where
    F: Fn(&Db<'_>) -> Result<Region> + Send + Sync,
{
    fn region(&self, db: &Db<'_>) -> Result<Region> {
        (self.0)(db)
    }
}

/// A declaration of the database region to watch.
///
/// The observed region is the union of every source: touching any of them
/// notifies the observer.
///
/// ```no_run
/// use regionwatch::{Region, RegionObservation, Writer};
///
/// # fn main() -> regionwatch::Result<()> {
/// let writer = Writer::open_in_memory()?;
/// let observation = RegionObservation::new()
///     .tracking(Region::table("settings"))
///     .tracking_sql("SELECT name, score FROM player");
///
/// let _handle = observation.start(&writer, |db| {
///     let players: i64 = db
///         .query_row("SELECT COUNT(*) FROM player", [], |row| row.get(0))
///         .unwrap_or_default();
///     println!("{players} players");
/// })?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct RegionObservation {
    sources: Vec<Arc<dyn RegionSource>>,
}

impl RegionObservation {
    /// An observation with no sources. It is never notified until sources
    /// are added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source.
    pub fn tracking(mut self, source: impl RegionSource + 'static) -> Self {
        self.sources.push(Arc::new(source));
        self
    }

    /// Add the footprint of a read-only SQL statement.
    pub fn tracking_sql(self, sql: impl Into<String>) -> Self {
        self.tracking(SqlRegion::new(sql))
    }

    /// Add a region computed by a closure.
    pub fn tracking_with<F>(self, f: F) -> Self
    where
        F: Fn(&Db<'_>) -> Result<Region> + Send + Sync + 'static,
    {
        self.tracking(FnRegion(f))
    }

    /// Combine the sources of two observations.
    pub fn and(mut self, other: RegionObservation) -> Self {
        self.sources.extend(other.sources);
        self
    }

    /// Number of sources.
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Resolve every source and merge the results.
    pub fn resolve(&self, db: &Db<'_>) -> Result<Region> {
        let mut region = Region::empty();
        for source in &self.sources {
            region.extend(source.region(db)?);
        }
        Ok(region)
    }

    /// Build an observer for the resolved region.
    pub fn observer<F>(&self, db: &Db<'_>, on_change: F) -> Result<RegionObserver<F>>
    where
        F: FnMut(&Db<'_>) + Send,
    {
        let region = self.resolve(db)?;
        if region.is_empty() {
            tracing::debug!("observation resolved to an empty region");
        }
        Ok(RegionObserver::new(region, on_change))
    }

    /// Start observing.
    ///
    /// `on_change` is called once after each committed transaction that
    /// touched the region, until the returned handle is removed or dropped.
    /// Sources are resolved and the observer registered while the writer is
    /// locked, so every transaction is either fully seen or not at all.
    ///
    /// Fails with `Error::ReentrantWrite` when called from inside the
    /// writer.
    pub fn start<F>(&self, writer: &Writer, on_change: F) -> Result<RegistrationHandle>
    where
        F: FnMut(&Db<'_>) + Send + 'static,
    {
        writer.serialized(|db| {
            let observer = self.observer(db, on_change)?;
            tracing::debug!(region = %observer.region(), "starting region observation");
            db.writer().add_observer(observer)
        })
    }

    /// Observe with a [`Sink`]. See [`reactive::observe`].
    pub fn observe<S: Sink>(&self, writer: &Writer, options: ObserveOptions, sink: S) -> Subscription {
        reactive::observe(self, writer, options, sink)
    }

    /// Stream a value fetched on each notification. See [`reactive::values`].
    pub fn values<T, F>(&self, writer: &Writer, options: ObserveOptions, fetch: F) -> ValueStream<T>
    where
        T: Send + 'static,
        F: FnMut(&Db<'_>) -> Result<T> + Send + 'static,
    {
        reactive::values(self, writer, options, fetch)
    }
}

impl From<Region> for RegionObservation {
    fn from(region: Region) -> Self {
        Self::new().tracking(region)
    }
}

impl fmt::Debug for RegionObservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionObservation")
            .field("sources", &self.sources.len())
            .finish()
    }
}

//! Matching change events against a region.

use crate::event::ChangeEvent;
use crate::region::{Region, Selector};

/// Decides whether change events intersect a region.
///
/// `touches` runs inside SQLite's update hook, so it never allocates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionTracker {
    region: Region,
}

impl RegionTracker {
    /// Create a tracker for a region.
    pub fn new(region: Region) -> Self {
        Self { region }
    }

    /// The tracked region.
    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Returns `true` if the event changes part of the tracked region.
    pub fn touches(&self, event: &ChangeEvent<'_>) -> bool {
        if self.region.is_full_database() {
            return true;
        }

        let Some(selectors) = self.region.selectors(event.table()) else {
            return false;
        };

        match *event {
            ChangeEvent::Truncated { .. } => true,
            ChangeEvent::Inserted { rowid, .. } | ChangeEvent::Deleted { rowid, .. } => {
                selectors.iter().any(|selector| match selector {
                    Selector::AllColumns | Selector::Columns(_) => true,
                    Selector::Rows(rows) => rows.contains(&rowid),
                })
            }
            ChangeEvent::Modified { columns, .. } => {
                selectors.iter().any(|selector| match (selector, columns) {
                    (Selector::Columns(tracked), Some(changed)) => !tracked.is_disjoint(changed),
                    _ => true,
                })
            }
            ChangeEvent::Updated { rowid, columns, .. } => {
                selectors.iter().any(|selector| match selector {
                    Selector::AllColumns => true,
                    Selector::Columns(tracked) => match columns {
                        Some(changed) => !tracked.is_disjoint(changed),
                        None => true,
                    },
                    Selector::Rows(rows) => rows.contains(&rowid),
                })
            }
        }
    }
}

impl From<Region> for RegionTracker {
    fn from(region: Region) -> Self {
        Self::new(region)
    }
}

//! Declarative database regions.
//!
//! A [`Region`] names the part of the database a consumer cares about: whole
//! tables, column subsets of tables, or specific rows identified by rowid.
//! Regions are plain values. They are built once, merged with
//! [`Region::union`], and then handed to a [`RegionTracker`] which matches
//! change events against them.
//!
//! Table and column names follow SQLite identifier rules and compare ASCII
//! case-insensitively. They are stored lowercased.
//!
//! [`RegionTracker`]: crate::tracker::RegionTracker

use std::collections::BTreeSet;
use std::fmt;

/// A selector restricting which part of a table belongs to a region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Every column of every row.
    AllColumns,
    /// Only these columns (lowercased), for every row.
    Columns(BTreeSet<String>),
    /// Only the rows with these rowids, all columns.
    Rows(BTreeSet<i64>),
}

impl Selector {
    fn overlaps(&self, other: &Selector) -> bool {
        match (self, other) {
            (Selector::Rows(a), Selector::Rows(b)) => !a.is_disjoint(b),
            (Selector::Columns(a), Selector::Columns(b)) => !a.is_disjoint(b),
            (Selector::Rows(rows), _) | (_, Selector::Rows(rows)) => !rows.is_empty(),
            _ => true,
        }
    }
}

/// The selectors declared for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRegion {
    name: String,
    selectors: Vec<Selector>,
}

impl TableRegion {
    /// The lowercased table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The selectors for this table.
    ///
    /// There is at most one selector of each kind, and `AllColumns` is never
    /// combined with another selector.
    pub fn selectors(&self) -> &[Selector] {
        &self.selectors
    }

    fn add(&mut self, selector: Selector) {
        if self.selectors.contains(&Selector::AllColumns) {
            return;
        }

        match selector {
            Selector::AllColumns => {
                self.selectors.clear();
                self.selectors.push(Selector::AllColumns);
            }
            Selector::Columns(columns) => {
                let existing = self.selectors.iter_mut().find_map(|s| match s {
                    Selector::Columns(existing) => Some(existing),
                    _ => None,
                });
                match existing {
                    Some(existing) => existing.extend(columns),
                    None => self.selectors.push(Selector::Columns(columns)),
                }
            }
            Selector::Rows(rows) => {
                let existing = self.selectors.iter_mut().find_map(|s| match s {
                    Selector::Rows(existing) => Some(existing),
                    _ => None,
                });
                match existing {
                    Some(existing) => existing.extend(rows),
                    None => self.selectors.push(Selector::Rows(rows)),
                }
            }
        }
    }
}

/// A set of table-scoped selectors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region {
    full_database: bool,
    /// Sorted by table name.
    tables: Vec<TableRegion>,
}

impl Region {
    /// The empty region. It is touched by nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A region covering every table of the database.
    pub fn full_database() -> Self {
        Self {
            full_database: true,
            tables: Vec::new(),
        }
    }

    /// All columns and rows of a table.
    pub fn table(table: &str) -> Self {
        let mut region = Self::empty();
        region.insert(table, Selector::AllColumns);
        region
    }

    /// Some columns of a table, for every row.
    ///
    /// An empty column list selects the whole table.
    pub fn columns<I, S>(table: &str, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let columns: BTreeSet<String> = columns
            .into_iter()
            .map(|c| c.as_ref().to_ascii_lowercase())
            .collect();
        let mut region = Self::empty();
        region.insert(table, Selector::Columns(columns));
        region
    }

    /// Some rows of a table, identified by rowid.
    pub fn rows<I>(table: &str, rowids: I) -> Self
    where
        I: IntoIterator<Item = i64>,
    {
        let mut region = Self::empty();
        region.insert(table, Selector::Rows(rowids.into_iter().collect()));
        region
    }

    /// Add a selector for a table.
    pub fn insert(&mut self, table: &str, selector: Selector) {
        if self.full_database {
            return;
        }

        let selector = match selector {
            Selector::Columns(columns) if columns.is_empty() => Selector::AllColumns,
            other => other,
        };

        let name = table.to_ascii_lowercase();
        match self.tables.binary_search_by(|t| t.name.as_str().cmp(name.as_str())) {
            Ok(index) => self.tables[index].add(selector),
            Err(index) => self.tables.insert(
                index,
                TableRegion {
                    name,
                    selectors: vec![selector],
                },
            ),
        }
    }

    /// Merge another region into this one.
    ///
    /// Touching any part of either region touches the result.
    pub fn extend(&mut self, other: Region) {
        if other.full_database {
            self.full_database = true;
            self.tables.clear();
            return;
        }
        for table in other.tables {
            for selector in table.selectors {
                self.insert(&table.name, selector);
            }
        }
    }

    /// The union of two regions.
    pub fn union(mut self, other: Region) -> Self {
        self.extend(other);
        self
    }

    /// Returns `true` if nothing can touch this region.
    pub fn is_empty(&self) -> bool {
        !self.full_database && self.tables.is_empty()
    }

    /// Returns `true` if this region covers the whole database.
    pub fn is_full_database(&self) -> bool {
        self.full_database
    }

    /// The tables of this region, sorted by name.
    pub fn tables(&self) -> &[TableRegion] {
        &self.tables
    }

    /// The selectors declared for a table, matched case-insensitively.
    pub fn selectors(&self, table: &str) -> Option<&[Selector]> {
        self.tables
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(table))
            .map(|t| t.selectors.as_slice())
    }

    /// Returns `true` if some table, column, or row belongs to both regions.
    pub fn intersects(&self, other: &Region) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        if self.full_database || other.full_database {
            return true;
        }

        self.tables.iter().any(|table| {
            other.selectors(&table.name).is_some_and(|theirs| {
                table
                    .selectors
                    .iter()
                    .any(|mine| theirs.iter().any(|their| mine.overlaps(their)))
            })
        })
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.full_database {
            return f.write_str("full database");
        }
        if self.tables.is_empty() {
            return f.write_str("empty");
        }

        let mut first = true;
        for table in &self.tables {
            for selector in &table.selectors {
                if !first {
                    f.write_str(",")?;
                }
                first = false;

                match selector {
                    Selector::AllColumns => write!(f, "{}(*)", table.name)?,
                    Selector::Columns(columns) => {
                        let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
                        write!(f, "{}({})", table.name, columns.join(","))?;
                    }
                    Selector::Rows(rows) => {
                        let rows: Vec<String> = rows.iter().map(i64::to_string).collect();
                        write!(f, "{}(*)[{}]", table.name, rows.join(","))?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names_are_case_insensitive() {
        let region = Region::table("Player");
        assert_eq!(region.tables()[0].name(), "player");
        assert!(region.selectors("PLAYER").is_some());
        assert!(region.selectors("team").is_none());
    }

    #[test]
    fn test_union_merges_selectors_per_table() {
        let region = Region::columns("player", ["name"])
            .union(Region::columns("player", ["Score"]))
            .union(Region::rows("player", [3, 1]))
            .union(Region::rows("player", [2]));

        let selectors = region.selectors("player").unwrap();
        assert_eq!(selectors.len(), 2);
        assert_eq!(
            selectors[0],
            Selector::Columns(["name".to_string(), "score".to_string()].into())
        );
        assert_eq!(selectors[1], Selector::Rows([1, 2, 3].into()));
    }

    #[test]
    fn test_all_columns_absorbs_other_selectors() {
        let region = Region::columns("player", ["name"])
            .union(Region::table("player"))
            .union(Region::rows("player", [1]));

        assert_eq!(region.selectors("player").unwrap(), &[Selector::AllColumns]);
    }

    #[test]
    fn test_empty_column_list_selects_whole_table() {
        let region = Region::columns("player", Vec::<String>::new());
        assert_eq!(region.selectors("player").unwrap(), &[Selector::AllColumns]);
    }

    #[test]
    fn test_full_database_absorbs_tables() {
        let region = Region::table("player").union(Region::full_database());
        assert!(region.is_full_database());
        assert!(region.tables().is_empty());
        assert!(!region.is_empty());

        let mut region = Region::full_database();
        region.insert("team", Selector::AllColumns);
        assert!(region.tables().is_empty());
    }

    #[test]
    fn test_tables_are_sorted() {
        let region = Region::table("team")
            .union(Region::table("award"))
            .union(Region::table("player"));
        let names: Vec<&str> = region.tables().iter().map(TableRegion::name).collect();
        assert_eq!(names, vec!["award", "player", "team"]);
    }

    #[test]
    fn test_intersects() {
        let names = Region::columns("player", ["name"]);
        let scores = Region::columns("player", ["score"]);
        let whole = Region::table("player");
        let team = Region::table("team");

        assert!(!names.intersects(&scores));
        assert!(names.intersects(&whole));
        assert!(whole.intersects(&names));
        assert!(!whole.intersects(&team));
        assert!(Region::full_database().intersects(&team));
        assert!(!Region::full_database().intersects(&Region::empty()));

        let row_1 = Region::rows("player", [1]);
        let row_2 = Region::rows("player", [2]);
        assert!(!row_1.intersects(&row_2));
        assert!(row_1.intersects(&names));
        assert!(!Region::rows("player", []).intersects(&whole));
    }

    #[test]
    fn test_display() {
        assert_eq!(Region::empty().to_string(), "empty");
        assert_eq!(Region::full_database().to_string(), "full database");

        let region = Region::table("team")
            .union(Region::columns("player", ["score", "name"]))
            .union(Region::rows("player", [7, 3]));
        assert_eq!(region.to_string(), "player(name,score),player(*)[3,7],team(*)");
    }
}

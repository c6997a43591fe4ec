//! Closed intervals of entry indices processed together as one batch.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A closed interval `[start, end]` over entry indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRange")]
pub struct IndexRange {
    start: u64,
    end: u64,
}

#[derive(Deserialize)]
struct RawRange {
    start: u64,
    end: u64,
}

impl TryFrom<RawRange> for IndexRange {
    type Error = Error;

    fn try_from(raw: RawRange) -> Result<Self> {
        Self::new(raw.start, raw.end)
    }
}

impl IndexRange {
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(Error::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// The default first batch: `[0, limit - 1]`.
    pub fn first(limit: u64) -> Result<Self> {
        if limit == 0 {
            return Err(Error::InvalidRange { start: 0, end: 0 });
        }
        Ok(Self {
            start: 0,
            end: limit - 1,
        })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// Number of indices covered, saturating for `[0, u64::MAX]`.
    pub fn len(&self) -> u64 {
        (self.end - self.start).saturating_add(1)
    }

    pub fn contains(&self, index: u64) -> bool {
        self.start <= index && index <= self.end
    }

    /// Intersect with `[0, entry_count - 1]`.
    ///
    /// Returns `None` when the archive has no entries at or after `start`.
    pub fn clamp_to(&self, entry_count: u64) -> Option<Self> {
        if entry_count == 0 || self.start >= entry_count {
            return None;
        }
        Some(Self {
            start: self.start,
            end: self.end.min(entry_count - 1),
        })
    }

    /// The remainder after this range, at most `limit` entries long.
    pub fn next(&self, limit: u64, entry_count: u64) -> Option<Self> {
        if limit == 0 || entry_count == 0 || self.end >= entry_count - 1 {
            return None;
        }
        Some(Self {
            start: self.end + 1,
            end: self.end.saturating_add(limit).min(entry_count - 1),
        })
    }
}

impl fmt::Display for IndexRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

impl FromStr for IndexRange {
    type Err = Error;

    /// Parses `start-end`, e.g. `100-199`.
    fn from_str(s: &str) -> Result<Self> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| Error::permanent(format!("range '{s}' must look like START-END")))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u64>()
                .map_err(|e| Error::permanent(format!("range '{s}': {e}")))
        };
        Self::new(parse(start)?, parse(end)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(start: u64, end: u64) -> IndexRange {
        IndexRange::new(start, end).unwrap()
    }

    #[test]
    fn rejects_inverted_ranges() {
        assert!(IndexRange::new(5, 4).is_err());
        assert!(IndexRange::first(0).is_err());
        assert_eq!(IndexRange::first(100).unwrap(), r(0, 99));
    }

    #[test]
    fn clamps_to_entry_count() {
        assert_eq!(r(0, 9).clamp_to(3), Some(r(0, 2)));
        assert_eq!(r(200, 299).clamp_to(250), Some(r(200, 249)));
        assert_eq!(r(0, 99).clamp_to(250), Some(r(0, 99)));
        assert_eq!(r(10, 20).clamp_to(10), None);
        assert_eq!(r(0, 0).clamp_to(0), None);
    }

    #[test]
    fn next_range_walks_to_the_last_entry() {
        assert_eq!(r(0, 99).next(100, 250), Some(r(100, 199)));
        assert_eq!(r(100, 199).next(100, 250), Some(r(200, 249)));
        assert_eq!(r(200, 249).next(100, 250), None);
        assert_eq!(r(0, 2).next(10, 3), None);
    }

    #[test]
    fn chained_ranges_cover_every_index_once() {
        for entry_count in [1u64, 2, 7, 99, 100, 101, 250] {
            for limit in [1u64, 3, 10, 100, 1000] {
                let mut visited = Vec::new();
                let mut current = IndexRange::first(limit).unwrap().clamp_to(entry_count);
                while let Some(range) = current {
                    visited.extend(range.start()..=range.end());
                    current = range.next(limit, entry_count);
                }
                let expected: Vec<u64> = (0..entry_count).collect();
                assert_eq!(visited, expected, "count={entry_count} limit={limit}");
            }
        }
    }

    #[test]
    fn len_counts_both_ends() {
        assert_eq!(r(3, 3).len(), 1);
        assert_eq!(r(100, 199).len(), 100);
        assert_eq!(r(0, u64::MAX).len(), u64::MAX);
    }

    #[test]
    fn deserializing_checks_the_bounds() {
        let range: IndexRange = serde_json::from_str(r#"{"start":100,"end":199}"#).unwrap();
        assert_eq!(range, r(100, 199));
        assert_eq!(serde_json::to_string(&range).unwrap(), r#"{"start":100,"end":199}"#);
        assert!(serde_json::from_str::<IndexRange>(r#"{"start":9,"end":1}"#).is_err());
    }

    #[test]
    fn parses_cli_form() {
        assert_eq!("100-199".parse::<IndexRange>().unwrap(), r(100, 199));
        assert!("199-100".parse::<IndexRange>().is_err());
        assert!("abc".parse::<IndexRange>().is_err());
        assert_eq!(r(3, 4).to_string(), "[3, 4]");
    }
}

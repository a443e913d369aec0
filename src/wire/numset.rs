//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Tidemap.
//
// Tidemap is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Tidemap is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Tidemap. If not, see <http://www.gnu.org/licenses/>.

//! Sequence sets.
//!
//! `NumSet` is the wire form as the client sent it, which may contain `*`
//! and so cannot be interpreted until it is known what `*` means for the
//! observer at hand. `SeqRange` is the resolved, normalised form.

use std::collections::BTreeMap;
use std::fmt;
use std::iter::FromIterator;
use std::ops::Bound::{Excluded, Included, Unbounded};

/// A "sequence set range" of sequence numbers or UIDs.
///
/// Internally, this is maintained as a minimal sorted set of inclusive ranges.
/// It does not maintain information on the original fragmentation, ordering,
/// or duplication.
///
/// There is no support for removal.
///
/// The `Display` format puts this into minimal IMAP wire format. Note that
/// IMAP does not have a way to represent an empty sequence set. `Display`
/// produces an empty string in that case, which is invalid.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SeqRange {
    parts: BTreeMap<u32, u32>,
}

impl SeqRange {
    /// Create a new, empty range.
    pub fn new() -> Self {
        SeqRange::default()
    }

    /// Create a range containing just the given item.
    pub fn just(item: u32) -> Self {
        let mut this = SeqRange::new();
        this.append(item);
        this
    }

    /// Create a range containing just a single, simple range.
    pub fn range(start: u32, end: u32) -> Self {
        let mut this = SeqRange::new();
        this.insert(start, end);
        this
    }

    /// Append a single item to this range.
    ///
    /// The item must be strictly greater than all other items already
    /// inserted.
    pub fn append(&mut self, item: u32) {
        if let Some(end) = self.parts.values_mut().next_back() {
            assert!(item > *end);

            if item == *end + 1 {
                *end = item;
                return;
            }
        }

        self.parts.insert(item, item);
    }

    /// Insert the given inclusive range (which must be in the correct order)
    /// into this sequence set.
    pub fn insert(&mut self, start_incl: u32, mut end_incl: u32) {
        assert!(end_incl >= start_incl);

        // If this range overlaps any later ranges, fuse them.
        loop {
            let following = self
                .parts
                .range((Excluded(start_incl), Unbounded))
                .next()
                .map(|(&start, &end)| (start, end));

            if let Some((following_start, following_end)) = following {
                if following_start - 1 <= end_incl {
                    end_incl = end_incl.max(following_end);
                    self.parts.remove(&following_start);
                    continue;
                }
            }

            break;
        }

        let preceding = self
            .parts
            .range((Unbounded, Included(end_incl)))
            .next_back()
            .map(|(&start, &end)| (start, end));
        if let Some((preceding_start, preceding_end)) = preceding {
            if preceding_end.saturating_add(1) >= start_incl {
                if start_incl < preceding_start {
                    self.parts.remove(&preceding_start);
                    self.parts.insert(start_incl, end_incl.max(preceding_end));
                } else {
                    self.parts
                        .insert(preceding_start, end_incl.max(preceding_end));
                }
                return;
            }
        }

        self.parts.insert(start_incl, end_incl);
    }

    /// Return whether the given item is present in this set.
    pub fn contains(&self, v: u32) -> bool {
        self.parts
            .range(..=v)
            .next_back()
            .filter(|&(_, &end)| end >= v)
            .is_some()
    }

    /// Return an iterator to the items in this set, in strictly ascending
    /// order.
    pub fn items(&self) -> impl Iterator<Item = u32> + '_ {
        self.parts
            .iter()
            .flat_map(|(&start, &end)| (start..=end).into_iter())
    }

    /// Return the total size of the sequence set.
    pub fn len(&self) -> usize {
        self.parts
            .iter()
            .map(|(&start, &end)| (end - start) as usize + 1)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn min(&self) -> Option<u32> {
        self.parts.keys().next().copied()
    }

    pub fn max(&self) -> Option<u32> {
        self.parts.values().next_back().copied()
    }

    /// Parse a sequence set without `*`.
    pub fn parse(raw: &str) -> Option<Self> {
        let numset = NumSet::parse(raw)?;
        if numset.is_dynamic() {
            return None;
        }
        Some(numset.resolve(u32::MAX))
    }
}

impl FromIterator<u32> for SeqRange {
    fn from_iter<I: IntoIterator<Item = u32>>(it: I) -> Self {
        let mut this = SeqRange::new();
        for item in it {
            this.insert(item, item);
        }
        this
    }
}

impl fmt::Display for SeqRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (ix, (&start, &end)) in self.parts.iter().enumerate() {
            let delim = if 0 == ix { "" } else { "," };

            if start == end {
                write!(f, "{}{}", delim, start)?;
            } else {
                write!(f, "{}{}:{}", delim, start, end)?;
            }
        }

        Ok(())
    }
}

impl fmt::Debug for SeqRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}]", self)
    }
}

/// A sequence set as it appears on the wire.
///
/// Each element is an inclusive range whose endpoints may be `*`, represented
/// as 0 (which is never a valid sequence number or UID).
#[derive(Clone, PartialEq, Eq)]
pub struct NumSet {
    ranges: Vec<(u32, u32)>,
}

impl NumSet {
    pub fn parse(raw: &str) -> Option<Self> {
        fn endpoint(r: &str) -> Option<u32> {
            if "*" == r {
                Some(0)
            } else if r.is_empty() || !r.bytes().all(|b| b.is_ascii_digit()) {
                None
            } else {
                r.parse().ok().filter(|&n| n > 0)
            }
        }

        let mut ranges = Vec::new();
        for part in raw.split(',') {
            let mut subs = part.split(':');
            match (subs.next(), subs.next(), subs.next()) {
                (Some(only), None, None) => {
                    let only = endpoint(only)?;
                    ranges.push((only, only));
                }
                (Some(start), Some(end), None) => {
                    ranges.push((endpoint(start)?, endpoint(end)?));
                }
                _ => return None,
            }
        }

        Some(NumSet { ranges })
    }

    /// Whether this set contains `*` anywhere.
    pub fn is_dynamic(&self) -> bool {
        self.ranges.iter().any(|&(start, end)| 0 == start || 0 == end)
    }

    /// Resolve this set into a `SeqRange`, substituting `max` for `*`.
    ///
    /// RFC 3501 allows range endpoints in either order. If `max` is 0 (i.e.
    /// the mailbox is empty), `*` refers to nothing.
    pub fn resolve(&self, max: u32) -> SeqRange {
        let mut result = SeqRange::new();
        for &(start, end) in &self.ranges {
            let start = if 0 == start { max } else { start };
            let end = if 0 == end { max } else { end };
            let (low, high) = (start.min(end), start.max(end));
            if 0 == high {
                continue;
            }
            result.insert(low.max(1), high);
        }
        result
    }
}

impl From<&SeqRange> for NumSet {
    fn from(range: &SeqRange) -> Self {
        NumSet {
            ranges: range.parts.iter().map(|(&s, &e)| (s, e)).collect(),
        }
    }
}

impl fmt::Display for NumSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fn endpoint(f: &mut fmt::Formatter, v: u32) -> fmt::Result {
            if 0 == v {
                write!(f, "*")
            } else {
                write!(f, "{}", v)
            }
        }

        for (ix, &(start, end)) in self.ranges.iter().enumerate() {
            if ix > 0 {
                write!(f, ",")?;
            }
            endpoint(f, start)?;
            if start != end {
                write!(f, ":")?;
                endpoint(f, end)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for NumSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "NumSet({})", self)
    }
}

//! # Extent Map
//!
//! Ordered, non-overlapping interval map keyed by half-open sector ranges
//! `[base, limit)`. This is the in-memory index behind all three address
//! translations in the engine:
//!
//! - object map: LBA → (object, offset-in-object)
//! - write-cache forward map: LBA → SSD sector
//! - write-cache reverse map: SSD sector → LBA
//!
//! `update` inserts a range and reports every extent it displaced, with the
//! displaced portion's original value, so callers can keep secondary
//! accounting honest (live-sector counters, reverse-map trims). Values are
//! *positional*: when an extent is split or clipped, the value of the
//! surviving piece advances by the clip distance. The [`ExtentValue::shift`]
//! impl for each flavor encodes what "advances" means.
//!
//! There is no persistent form. Maps are rebuilt from checkpoints and
//! journal replay on startup.

use std::collections::BTreeMap;
use std::fmt;

/// A value that can ride along when its extent is clipped.
pub trait ExtentValue: Copy + Eq + fmt::Debug {
    /// Value for the same mapping `delta` sectors further in.
    fn shift(self, delta: u64) -> Self;
}

/// Object-map value: a location inside a numbered backend object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjOffset {
    /// Object sequence number.
    pub obj: u32,
    /// Sector offset within the object.
    pub offset: u64,
}

impl ExtentValue for ObjOffset {
    fn shift(self, delta: u64) -> Self {
        Self {
            obj: self.obj,
            offset: self.offset + delta,
        }
    }
}

/// Forward-map value: an SSD sector in the write-cache journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SectorPtr(pub u64);

impl ExtentValue for SectorPtr {
    fn shift(self, delta: u64) -> Self {
        SectorPtr(self.0 + delta)
    }
}

/// Reverse-map value: the LBA backed by a journal sector range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LbaPtr(pub u64);

impl ExtentValue for LbaPtr {
    fn shift(self, delta: u64) -> Self {
        LbaPtr(self.0 + delta)
    }
}

/// One mapped interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent<V> {
    pub base: u64,
    pub limit: u64,
    pub value: V,
}

impl<V: ExtentValue> Extent<V> {
    pub fn len(&self) -> u64 {
        self.limit - self.base
    }

    /// The portion of this extent inside `[lo, hi)`, value shifted to match.
    /// Caller guarantees the window overlaps.
    pub fn clipped(&self, lo: u64, hi: u64) -> Extent<V> {
        let base = self.base.max(lo);
        let limit = self.limit.min(hi);
        debug_assert!(base < limit, "clip window does not overlap extent");
        Extent {
            base,
            limit,
            value: self.value.shift(base - self.base),
        }
    }
}

/// Ordered interval map with displacement-reporting updates.
#[derive(Debug, Clone)]
pub struct ExtentMap<V> {
    // base -> (limit, value); invariant: intervals are disjoint and non-empty.
    map: BTreeMap<u64, (u64, V)>,
}

impl<V: ExtentValue> Default for ExtentMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: ExtentValue> ExtentMap<V> {
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// Number of intervals.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn reset(&mut self) {
        self.map.clear();
    }

    /// Map `[base, limit)` to `value`, splitting or trimming anything in the
    /// way. Displaced sub-ranges, with their prior values, are appended to
    /// `displaced` if provided.
    pub fn update(
        &mut self,
        base: u64,
        limit: u64,
        value: V,
        mut displaced: Option<&mut Vec<Extent<V>>>,
    ) {
        assert!(base < limit, "empty extent update [{base}, {limit})");

        // Collect keys of every interval overlapping [base, limit). Only
        // intervals with key < limit can overlap; walk them back-to-front
        // until one ends at or before base.
        let mut overlapping = Vec::new();
        for (&b, &(l, _)) in self.map.range(..limit).rev() {
            if l <= base {
                break;
            }
            overlapping.push(b);
        }

        for b in overlapping {
            let (l, v) = self.map.remove(&b).unwrap();
            let ext = Extent {
                base: b,
                limit: l,
                value: v,
            };
            if let Some(out) = displaced.as_deref_mut() {
                out.push(ext.clipped(base, limit));
            }
            if b < base {
                self.map.insert(b, (base, v));
            }
            if l > limit {
                self.map.insert(limit, (l, v.shift(limit - b)));
            }
        }

        self.map.insert(base, (limit, value));
    }

    /// Remove everything inside `[base, limit)`, trimming intervals that
    /// straddle the boundary.
    pub fn trim(&mut self, base: u64, limit: u64) {
        if base >= limit {
            return;
        }
        let mut overlapping = Vec::new();
        for (&b, &(l, _)) in self.map.range(..limit).rev() {
            if l <= base {
                break;
            }
            overlapping.push(b);
        }
        for b in overlapping {
            let (l, v) = self.map.remove(&b).unwrap();
            if b < base {
                self.map.insert(b, (base, v));
            }
            if l > limit {
                self.map.insert(limit, (l, v.shift(limit - b)));
            }
        }
    }

    /// Iterate from the first interval whose limit is past `base`.
    pub fn lookup(&self, base: u64) -> impl Iterator<Item = Extent<V>> + '_ {
        // A predecessor interval (key <= base) still counts if it extends
        // past base.
        let start = match self.map.range(..=base).next_back() {
            Some((&b, &(l, _))) if l > base => b,
            _ => base,
        };
        self.map.range(start..).map(|(&b, &(l, v))| Extent {
            base: b,
            limit: l,
            value: v,
        })
    }

    /// Iterate the intervals overlapping `[base, limit)`, clipped to the
    /// window with values shifted to match.
    pub fn overlapping(&self, base: u64, limit: u64) -> impl Iterator<Item = Extent<V>> + '_ {
        self.lookup(base)
            .take_while(move |e| e.base < limit)
            .map(move |e| e.clipped(base, limit))
    }

    /// Iterate every interval in address order.
    pub fn iter(&self) -> impl Iterator<Item = Extent<V>> + '_ {
        self.map.range(..).map(|(&b, &(l, v))| Extent {
            base: b,
            limit: l,
            value: v,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(m: &ExtentMap<ObjOffset>) -> Vec<(u64, u64, u32, u64)> {
        m.iter()
            .map(|e| (e.base, e.limit, e.value.obj, e.value.offset))
            .collect()
    }

    fn oo(obj: u32, offset: u64) -> ObjOffset {
        ObjOffset { obj, offset }
    }

    #[test]
    fn test_disjoint_inserts() {
        let mut m = ExtentMap::new();
        m.update(0, 8, oo(1, 0), None);
        m.update(16, 24, oo(2, 0), None);
        assert_eq!(collect(&m), vec![(0, 8, 1, 0), (16, 24, 2, 0)]);
    }

    #[test]
    fn test_overwrite_reports_displaced() {
        let mut m = ExtentMap::new();
        m.update(0, 16, oo(1, 8), None);

        let mut displaced = Vec::new();
        m.update(4, 12, oo(2, 0), Some(&mut displaced));

        // Middle of object 1 displaced, with shifted offset.
        assert_eq!(
            displaced,
            vec![Extent {
                base: 4,
                limit: 12,
                value: oo(1, 12),
            }]
        );
        // Split into left remnant, new extent, right remnant.
        assert_eq!(
            collect(&m),
            vec![(0, 4, 1, 8), (4, 12, 2, 0), (12, 16, 1, 20)]
        );
    }

    #[test]
    fn test_overwrite_spanning_several() {
        let mut m = ExtentMap::new();
        m.update(0, 8, oo(1, 0), None);
        m.update(8, 16, oo(2, 0), None);
        m.update(16, 24, oo(3, 0), None);

        let mut displaced = Vec::new();
        m.update(4, 20, oo(9, 0), Some(&mut displaced));

        displaced.sort_by_key(|e| e.base);
        assert_eq!(
            displaced,
            vec![
                Extent {
                    base: 4,
                    limit: 8,
                    value: oo(1, 4)
                },
                Extent {
                    base: 8,
                    limit: 16,
                    value: oo(2, 0)
                },
                Extent {
                    base: 16,
                    limit: 20,
                    value: oo(3, 0)
                },
            ]
        );
        assert_eq!(
            collect(&m),
            vec![(0, 4, 1, 0), (4, 20, 9, 0), (20, 24, 3, 4)]
        );
    }

    #[test]
    fn test_exact_replacement() {
        let mut m = ExtentMap::new();
        m.update(8, 16, oo(1, 0), None);
        let mut displaced = Vec::new();
        m.update(8, 16, oo(2, 0), Some(&mut displaced));
        assert_eq!(displaced.len(), 1);
        assert_eq!(collect(&m), vec![(8, 16, 2, 0)]);
    }

    #[test]
    fn test_no_overlap_never_returned() {
        let mut m = ExtentMap::new();
        for i in 0..32u64 {
            m.update(i * 8, i * 8 + 8, oo(i as u32, i), None);
        }
        m.update(60, 100, oo(99, 0), None);

        // Disjointness: every interval's base >= previous limit.
        let mut prev_limit = 0;
        for e in m.iter() {
            assert!(e.base >= prev_limit, "overlap at {}", e.base);
            assert!(e.base < e.limit);
            prev_limit = e.limit;
        }
    }

    #[test]
    fn test_trim_splits_and_removes() {
        let mut m = ExtentMap::new();
        m.update(0, 32, oo(1, 0), None);
        m.trim(8, 16);
        assert_eq!(collect(&m), vec![(0, 8, 1, 0), (16, 32, 1, 16)]);
        m.trim(0, 64);
        assert!(m.is_empty());
    }

    #[test]
    fn test_lookup_starts_at_covering_interval() {
        let mut m = ExtentMap::new();
        m.update(0, 16, oo(1, 0), None);
        m.update(32, 48, oo(2, 0), None);

        // Base inside the first interval.
        let first = m.lookup(8).next().unwrap();
        assert_eq!((first.base, first.limit), (0, 16));

        // Base in a hole: next interval.
        let first = m.lookup(20).next().unwrap();
        assert_eq!((first.base, first.limit), (32, 48));

        // Base past everything.
        assert!(m.lookup(48).next().is_none());
    }

    #[test]
    fn test_overlapping_clips_values() {
        let mut m = ExtentMap::new();
        m.update(0, 100, oo(7, 1000), None);
        let exts: Vec<_> = m.overlapping(10, 20).collect();
        assert_eq!(
            exts,
            vec![Extent {
                base: 10,
                limit: 20,
                value: oo(7, 1010),
            }]
        );
    }

    #[test]
    fn test_forward_reverse_flavors_shift() {
        let mut fwd: ExtentMap<SectorPtr> = ExtentMap::new();
        fwd.update(100, 200, SectorPtr(8), None);
        let e: Vec<_> = fwd.overlapping(150, 160).collect();
        assert_eq!(e[0].value, SectorPtr(58));

        let mut rev: ExtentMap<LbaPtr> = ExtentMap::new();
        rev.update(8, 108, LbaPtr(100), None);
        let e: Vec<_> = rev.overlapping(58, 68).collect();
        assert_eq!(e[0].value, LbaPtr(150));
    }

    #[test]
    fn test_union_matches_writes_minus_trims() {
        // Random-ish interleaving of updates and trims; verify the mapped
        // set against a naive per-sector model.
        let mut m: ExtentMap<SectorPtr> = ExtentMap::new();
        let mut model: Vec<Option<u64>> = vec![None; 512];

        let ops: &[(bool, u64, u64, u64)] = &[
            (true, 0, 64, 1000),
            (true, 32, 96, 2000),
            (false, 40, 48, 0),
            (true, 90, 200, 3000),
            (false, 0, 10, 0),
            (true, 300, 400, 4000),
            (true, 350, 360, 5000),
            (false, 395, 512, 0),
        ];
        for &(is_update, base, limit, ptr) in ops {
            if is_update {
                m.update(base, limit, SectorPtr(ptr), None);
                for s in base..limit {
                    model[s as usize] = Some(ptr + (s - base));
                }
            } else {
                m.trim(base, limit);
                for s in base..limit {
                    model[s as usize] = None;
                }
            }
        }

        let mut flat: Vec<Option<u64>> = vec![None; 512];
        for e in m.iter() {
            for s in e.base..e.limit {
                assert!(flat[s as usize].is_none(), "overlap at sector {s}");
                flat[s as usize] = Some(e.value.shift(s - e.base).0);
            }
        }
        assert_eq!(flat, model);
    }
}

//! Ordered sets of disjoint, non-adjacent inclusive ranges.
//!
//! A [`RangeSet`] keeps a sorted map from range start to range end and
//! coalesces overlapping or touching ranges on insertion, so iteration always
//! yields the minimal sequence of ranges covering the set. `add` and
//! `subtract` run in time logarithmic in the number of stored ranges (plus
//! the number of ranges they displace).
//!
//! The element type only needs a total order and a notion of the closest
//! predecessor/successor value, so the same structure covers integers and IP
//! addresses. IPv4 and IPv6 addresses sort as separate universes (all v4
//! below all v6), which is exactly what the address-range computations want.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::net::IpAddr;

/// A totally-ordered domain with discrete predecessor/successor steps.
pub trait Key: Ord + Copy {
    /// Returns the value immediately before (`before == true`) or after this
    /// one. Wraps at the ends of the domain; callers never step past a range
    /// bound that would make the wrap observable.
    fn closest(self, before: bool) -> Self;
}

/// An inclusive range over `T`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Range<T> {
    pub start: T,
    pub end: T,
}

/// A set of disjoint, non-adjacent inclusive ranges.
#[derive(Clone, Debug, Default)]
pub struct RangeSet<T> {
    map: BTreeMap<T, T>,
}

// === impl RangeSet ===

impl<T: Key> RangeSet<T> {
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    fn assert_valid(&self, a: &Range<T>) {
        // A reversed range is a programming error, not an input error.
        if a.end < a.start {
            panic!("bad range: end precedes start");
        }
    }

    /// Adds a range, coalescing with any overlapping or touching ranges.
    pub fn add(&mut self, a: Range<T>) {
        self.assert_valid(&a);
        let mut a = a;
        if self.map.is_empty() {
            self.map.insert(a.start, a.end);
            return;
        }

        let mut stale = Vec::new();

        // An existing range starting before `a` may cover or touch it.
        if let Some((&start, &end)) = self.map.range(..a.start).next_back() {
            if end >= a.end {
                // Already fully covered, the new range adds nothing.
                return;
            }
            if end.closest(false) >= a.start {
                // Overlapping or exactly adjacent; grow `a` to replace it.
                a.start = start;
                stale.push(start);
            }
        }

        for (&start, &end) in self.map.range(a.start..) {
            if a.end < start && a.end.closest(false) < start {
                // Beyond the new range and not touching it; done.
                break;
            }
            if a.end < end {
                a.end = end;
            }
            stale.push(start);
        }

        for start in stale {
            self.map.remove(&start);
        }
        self.map.insert(a.start, a.end);
    }

    /// Removes a range, splitting a covering range in two if needed.
    pub fn subtract(&mut self, a: Range<T>) {
        self.assert_valid(&a);
        if self.map.is_empty() {
            return;
        }

        // An existing range starting before `a` may reach into it.
        if let Some((&start, &end)) = self.map.range(..a.start).next_back() {
            if end >= a.start {
                self.map.insert(start, a.start.closest(true));
                if a.end < end {
                    // The subtracted range is strictly interior; split.
                    self.map.insert(a.end.closest(false), end);
                    return;
                }
            }
        }

        let mut stale = Vec::new();
        let mut split = None;
        for (&start, &end) in self.map.range(a.start..) {
            if a.end < start {
                // The next range starts past the subtracted one; done.
                break;
            }
            if a.end < end {
                split = Some((a.end.closest(false), end));
            }
            stale.push(start);
        }

        for start in stale {
            self.map.remove(&start);
        }
        if let Some((start, end)) = split {
            self.map.insert(start, end);
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterates the stored ranges in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Range<T>> + '_ {
        self.map.iter().map(|(&start, &end)| Range { start, end })
    }
}

// === impl Key ===

macro_rules! impl_key_for_int {
    ($($t:ty),*) => {$(
        impl Key for $t {
            fn closest(self, before: bool) -> Self {
                if before {
                    self.wrapping_sub(1)
                } else {
                    self.wrapping_add(1)
                }
            }
        }
    )*};
}

impl_key_for_int!(u8, u16, u32, u64, u128, usize);

impl Key for IpAddr {
    fn closest(self, before: bool) -> Self {
        match self {
            IpAddr::V4(addr) => {
                let mut octets = addr.octets();
                step_bytes(&mut octets, before);
                IpAddr::V4(octets.into())
            }
            IpAddr::V6(addr) => {
                let mut octets = addr.octets();
                step_bytes(&mut octets, before);
                IpAddr::V6(octets.into())
            }
        }
    }
}

/// Byte-level ±1 with carry/borrow across octets.
fn step_bytes(bytes: &mut [u8], before: bool) {
    for b in bytes.iter_mut().rev() {
        if before {
            *b = b.wrapping_sub(1);
            if *b != 0xff {
                break;
            }
        } else {
            *b = b.wrapping_add(1);
            if *b != 0 {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Mirror of the set over a small boolean bitmap, used as an oracle.
    struct Bitmap {
        covered: Vec<bool>,
    }

    impl Bitmap {
        fn new(n: usize) -> Self {
            Self {
                covered: vec![false; n],
            }
        }

        fn add(&mut self, a: Range<usize>) {
            for i in a.start..=a.end {
                self.covered[i] = true;
            }
        }

        fn subtract(&mut self, a: Range<usize>) {
            for i in a.start..=a.end {
                self.covered[i] = false;
            }
        }
    }

    fn check_against(set: &RangeSet<usize>, oracle: &Bitmap) {
        let mut got = Bitmap::new(oracle.covered.len());
        let mut last_end: Option<usize> = None;
        for r in set.iter() {
            assert!(r.start <= r.end, "range [{}, {}] is invalid", r.start, r.end);
            if let Some(last) = last_end {
                assert!(
                    last + 1 < r.start,
                    "ranges touch: last end {}, next start {}",
                    last,
                    r.start
                );
            }
            last_end = Some(r.end);
            got.add(r);
        }
        assert_eq!(got.covered, oracle.covered);
    }

    #[test]
    fn oracle() {
        const N: usize = 24;
        let mut set = RangeSet::new();
        let mut oracle = Bitmap::new(N);

        // xorshift64 keeps the sequence deterministic without a fuzz corpus.
        let mut state: u64 = 0x9e3779b97f4a7c15;
        let mut rand = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        for i in 0..4096 {
            let r = rand();
            let start = (r % N as u64) as usize;
            let end = (start + (r >> 8) as usize % 8).min(N - 1);
            let range = Range { start, end };
            if i % 2 == 0 {
                set.add(range);
                oracle.add(range);
            } else {
                set.subtract(range);
                oracle.subtract(range);
            }
            check_against(&set, &oracle);
        }
    }

    #[test]
    fn coalesces_touching() {
        let mut set = RangeSet::new();
        set.add(Range { start: 0u32, end: 3 });
        set.add(Range { start: 4u32, end: 7 });
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![Range { start: 0, end: 7 }]);

        set.add(Range { start: 10u32, end: 12 });
        set.add(Range { start: 8u32, end: 9 });
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![Range { start: 0, end: 12 }]);
    }

    #[test]
    fn subtract_splits() {
        let mut set = RangeSet::new();
        set.add(Range { start: 0u32, end: 10 });
        set.subtract(Range { start: 4, end: 6 });
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec![Range { start: 0, end: 3 }, Range { start: 7, end: 10 }]
        );
    }

    #[test]
    #[should_panic(expected = "bad range")]
    fn reversed_range_panics() {
        let mut set = RangeSet::new();
        set.add(Range { start: 2u32, end: 1 });
    }

    #[test]
    fn ip_stepping_carries() {
        let ip: IpAddr = "10.0.0.255".parse().unwrap();
        assert_eq!(ip.closest(false), "10.0.1.0".parse::<IpAddr>().unwrap());
        let ip: IpAddr = "10.1.0.0".parse().unwrap();
        assert_eq!(ip.closest(true), "10.0.255.255".parse::<IpAddr>().unwrap());
        let ip: IpAddr = "fd00::1:0".parse().unwrap();
        assert_eq!(ip.closest(true), "fd00::ffff".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn families_stay_separate() {
        let mut set = RangeSet::new();
        let v6 = Range {
            start: "fd00::".parse::<IpAddr>().unwrap(),
            end: "fd00::ff".parse().unwrap(),
        };
        let v4 = Range {
            start: "10.0.0.0".parse::<IpAddr>().unwrap(),
            end: "10.0.0.255".parse().unwrap(),
        };
        set.add(v6);
        set.add(v4);
        let ranges: Vec<_> = set.iter().collect();
        assert_eq!(ranges, vec![v4, v6]);
    }

    #[test]
    fn ipblock_except() {
        // 10.0.0.0/24 minus 10.0.0.5/32.
        let mut set = RangeSet::new();
        set.add(Range {
            start: "10.0.0.0".parse::<IpAddr>().unwrap(),
            end: "10.0.0.255".parse().unwrap(),
        });
        set.subtract(Range {
            start: "10.0.0.5".parse::<IpAddr>().unwrap(),
            end: "10.0.0.5".parse().unwrap(),
        });
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec![
                Range {
                    start: "10.0.0.0".parse::<IpAddr>().unwrap(),
                    end: "10.0.0.4".parse().unwrap(),
                },
                Range {
                    start: "10.0.0.6".parse::<IpAddr>().unwrap(),
                    end: "10.0.0.255".parse().unwrap(),
                },
            ]
        );
    }
}

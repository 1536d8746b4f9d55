//! Gap-aware byte accumulator shared by the IPv4 and TCP engines.
//!
//! The buffer holds an ordered set of byte ranges keyed by their stream offset. After every
//! insertion the ranges are pairwise disjoint and never adjacent: touching ranges are coalesced,
//! so a single range starting at [base](ReassemblyBuffer::base) means the stream is contiguous up
//! to its end. Bytes before `base` have been consumed and are treated as immutable.

use crate::config::OverlapPolicy;
use crate::error::FlowError;

use std::collections::BTreeMap;
use std::ops::Range;

/// Outcome of inserting data into a [ReassemblyBuffer].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Insertion {
    /// Data was merged, adding `n` previously missing bytes (possibly zero).
    Merged(usize),
    /// Data lies entirely before `base` and was dropped.
    Stale,
    /// Data overlapped existing bytes under [OverlapPolicy::Reject] and was discarded.
    /// Carries the conflicting byte range.
    Rejected(Range<u64>),
}

#[derive(Debug, Default)]
pub(crate) struct ReassemblyBuffer {
    /// Offset of the first unconsumed byte.
    base: u64,
    /// Disjoint, non-adjacent ranges keyed by start offset.
    ranges: BTreeMap<u64, Vec<u8>>,
    /// Number of bytes held across all ranges.
    len: usize,
}

impl ReassemblyBuffer {
    pub(crate) fn new() -> Self {
        ReassemblyBuffer::default()
    }

    /// Offset of the first byte not yet consumed.
    #[inline]
    pub(crate) fn base(&self) -> u64 {
        self.base
    }

    /// Number of buffered bytes.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of disjoint buffered ranges.
    #[inline]
    pub(crate) fn nb_ranges(&self) -> usize {
        self.ranges.len()
    }

    /// End offset (exclusive) of the highest buffered byte, or `base` if empty.
    pub(crate) fn end(&self) -> u64 {
        self.ranges
            .iter()
            .next_back()
            .map_or(self.base, |(start, data)| start + data.len() as u64)
    }

    /// Number of bytes available contiguously from `base`.
    pub(crate) fn contiguous_len(&self) -> usize {
        match self.ranges.iter().next() {
            Some((start, data)) if *start == self.base => data.len(),
            _ => 0,
        }
    }

    /// Returns `true` if `[base, base + total)` is fully buffered.
    pub(crate) fn covers(&self, total: u64) -> bool {
        self.contiguous_len() as u64 >= total
    }

    /// Missing ranges between `base` and `limit`. Without a limit, only holes before the
    /// highest buffered byte are reported.
    pub(crate) fn gaps(&self, limit: Option<u64>) -> Vec<Range<u64>> {
        let mut gaps = vec![];
        let mut cursor = self.base;
        for (start, data) in self.ranges.iter() {
            if *start > cursor {
                gaps.push(cursor..*start);
            }
            cursor = start + data.len() as u64;
        }
        if let Some(limit) = limit {
            if limit > cursor {
                gaps.push(cursor..limit);
            }
        }
        gaps
    }

    /// Inserts `data` starting at stream offset `offset`, resolving overlap with buffered and
    /// consumed bytes according to `policy`.
    pub(crate) fn insert(
        &mut self,
        offset: u64,
        data: &[u8],
        policy: OverlapPolicy,
    ) -> Result<Insertion, FlowError> {
        let mut offset = offset;
        let mut data = data;
        let end = offset + data.len() as u64;
        if data.is_empty() {
            return Ok(Insertion::Merged(0));
        }
        if end <= self.base {
            log::debug!("Dropping stale data. end: {} base: {}", end, self.base);
            return Ok(Insertion::Stale);
        }
        if offset < self.base {
            // Consumed bytes cannot be rewritten, whatever the policy.
            if policy == OverlapPolicy::Reject {
                return Ok(Insertion::Rejected(offset..self.base));
            }
            data = &data[(self.base - offset) as usize..];
            offset = self.base;
        }

        // Ranges that overlap or touch [offset, end). Ranges are sorted and disjoint, so their
        // ends are sorted as well and the scan stops at the first range ending before `offset`.
        let touching: Vec<(u64, u64)> = self
            .ranges
            .range(..=end)
            .rev()
            .map(|(start, data)| (*start, start + data.len() as u64))
            .take_while(|(_, range_end)| *range_end >= offset)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        if policy == OverlapPolicy::Reject {
            let conflict = touching
                .iter()
                .filter(|(start, range_end)| *start < end && *range_end > offset)
                .fold(None, |acc: Option<Range<u64>>, (start, range_end)| {
                    let lo = (*start).max(offset);
                    let hi = (*range_end).min(end);
                    Some(match acc {
                        Some(r) => r.start.min(lo)..r.end.max(hi),
                        None => lo..hi,
                    })
                });
            if let Some(conflict) = conflict {
                return Ok(Insertion::Rejected(conflict));
            }
        }

        let lo = touching.first().map_or(offset, |(start, _)| (*start).min(offset));
        let hi = touching.last().map_or(end, |(_, range_end)| (*range_end).max(end));
        let merged_len = (hi - lo) as usize;

        // Reuse the lowest range's allocation when it already starts the merged run.
        let mut olds = touching.iter();
        let mut merged = match touching.first() {
            Some((start, _)) if *start == lo => {
                olds.next();
                self.ranges.remove(start).unwrap_or_default()
            }
            _ => Vec::new(),
        };
        let mut old_bytes = merged.len();
        merged
            .try_reserve_exact(merged_len - merged.len())
            .map_err(|_| FlowError::OutOfMemory)?;
        merged.resize(merged_len, 0);

        for (start, _) in olds {
            if let Some(old) = self.ranges.remove(start) {
                let at = (start - lo) as usize;
                merged[at..at + old.len()].copy_from_slice(&old);
                old_bytes += old.len();
            }
        }

        let at = (offset - lo) as usize;
        match policy {
            OverlapPolicy::LastWins => {
                merged[at..at + data.len()].copy_from_slice(data);
            }
            OverlapPolicy::FirstWins | OverlapPolicy::Reject => {
                // Only fill holes left between the existing ranges.
                let mut cursor = offset;
                for (start, range_end) in touching.iter() {
                    if *start > cursor && cursor < end {
                        let hole_end = (*start).min(end);
                        let src = (cursor - offset) as usize..(hole_end - offset) as usize;
                        let dst = (cursor - lo) as usize;
                        merged[dst..dst + src.len()].copy_from_slice(&data[src]);
                    }
                    cursor = cursor.max(*range_end);
                }
                if cursor < end {
                    let src = (cursor - offset) as usize..data.len();
                    let dst = (cursor - lo) as usize;
                    merged[dst..dst + src.len()].copy_from_slice(&data[src]);
                }
            }
        }

        let added = merged_len - old_bytes;
        self.len += added;
        self.ranges.insert(lo, merged);
        Ok(Insertion::Merged(added))
    }

    /// Removes and returns the bytes available contiguously from `base`, advancing `base`.
    pub(crate) fn take_contiguous(&mut self) -> Vec<u8> {
        if self.contiguous_len() == 0 {
            return vec![];
        }
        match self.ranges.remove(&self.base) {
            Some(data) => {
                self.base += data.len() as u64;
                self.len -= data.len();
                data
            }
            None => vec![],
        }
    }

    /// Copies out everything buffered, laid out by offset from `base` with holes zero-filled.
    pub(crate) fn assemble(&self) -> Vec<u8> {
        let mut out = vec![0; (self.end() - self.base) as usize];
        for (start, data) in self.ranges.iter() {
            let at = (start - self.base) as usize;
            out[at..at + data.len()].copy_from_slice(data);
        }
        out
    }

    /// Drops all buffered data and moves `base` to `offset`.
    pub(crate) fn reset(&mut self, offset: u64) {
        self.ranges.clear();
        self.len = 0;
        self.base = offset;
    }
}

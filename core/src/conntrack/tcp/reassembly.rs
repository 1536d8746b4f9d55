use crate::config::OverlapPolicy;
use crate::conntrack::buffer::{Insertion, ReassemblyBuffer};
use crate::error::FlowError;

/// Represents a uni-directional TCP flow
#[derive(Debug, Default)]
pub(crate) struct TcpFlow {
    /// Sequence number of the first data byte (stream offset 0)
    isn: Option<u32>,
    /// Stream offset of the FIN
    fin: Option<u64>,
    /// Undelivered data, indexed by stream offset
    pub(super) buffer: ReassemblyBuffer,
}

impl TcpFlow {
    /// Returns `true` once the stream start is known.
    #[inline]
    pub(super) fn is_synchronized(&self) -> bool {
        self.isn.is_some()
    }

    /// Starts the stream at sequence number `seq`.
    pub(super) fn synchronize(&mut self, seq: u32) {
        self.isn = Some(seq);
        self.fin = None;
        self.buffer.reset(0);
    }

    /// Expected sequence number of next segment
    #[inline]
    pub(super) fn next_seq(&self) -> Option<u32> {
        self.isn
            .map(|isn| isn.wrapping_add(self.buffer.base() as u32))
    }

    /// Maps a sequence number to a stream offset. Negative offsets precede the stream start.
    fn offset_of(&self, seq: u32) -> Option<i64> {
        let next_seq = self.next_seq()?;
        let base = self.buffer.base() as i64;
        if wrapping_lt(seq, next_seq) {
            Some(base - next_seq.wrapping_sub(seq) as i64)
        } else {
            Some(base + seq.wrapping_sub(next_seq) as i64)
        }
    }

    /// Inserts segment data starting at sequence number `seq`.
    ///
    /// Data entirely behind the next expected sequence number is stale. Fails with
    /// [FlowError::ResourceLimitExceeded] if the undelivered span would exceed `max_buffered`.
    pub(super) fn insert(
        &mut self,
        seq: u32,
        data: &[u8],
        policy: OverlapPolicy,
        max_buffered: usize,
    ) -> Result<Insertion, FlowError> {
        if data.is_empty() {
            return Ok(Insertion::Merged(0));
        }
        let offset = match self.offset_of(seq) {
            Some(offset) => offset,
            None => return Ok(Insertion::Stale),
        };
        let base = self.buffer.base() as i64;
        let end = offset + data.len() as i64;
        if end <= base {
            log::debug!(
                "Dropping old segment. cur: {} expect: {:?}",
                seq,
                self.next_seq()
            );
            return Ok(Insertion::Stale);
        }
        if end - base > max_buffered as i64 {
            log::debug!("Out-of-order span overflow: {} bytes", end - base);
            return Err(FlowError::ResourceLimitExceeded);
        }
        let (offset, data) = if offset < 0 {
            (0, &data[offset.unsigned_abs() as usize..])
        } else {
            (offset as u64, data)
        };
        self.buffer.insert(offset, data, policy)
    }

    /// Records a FIN at sequence number `seq`. Only the first FIN counts.
    pub(super) fn set_fin(&mut self, seq: u32) {
        if self.fin.is_some() {
            return;
        }
        if let Some(offset) = self.offset_of(seq) {
            let offset = offset.max(self.buffer.base() as i64) as u64;
            log::debug!("FIN at stream offset {}", offset);
            self.fin = Some(offset);
        }
    }

    /// Removes and returns the newly contiguous bytes. Bytes past the FIN are dropped.
    pub(super) fn flush(&mut self) -> Vec<u8> {
        let mut data = self.buffer.take_contiguous();
        if let Some(fin) = self.fin {
            let base = self.buffer.base();
            if base > fin {
                let excess = (base - fin) as usize;
                data.truncate(data.len().saturating_sub(excess));
            }
            if base >= fin && !self.buffer.is_empty() {
                log::debug!("Dropping {} bytes past FIN", self.buffer.len());
                self.buffer.reset(base);
            }
        }
        data
    }

    /// Number of out-of-order ranges waiting for a hole to fill.
    #[inline]
    pub(super) fn nb_out_of_order(&self) -> usize {
        self.buffer.nb_ranges()
    }

    /// Returns `true` once every byte up to the FIN was delivered.
    #[inline]
    pub(super) fn is_closed(&self) -> bool {
        self.fin.map_or(false, |fin| self.buffer.base() >= fin)
    }

    #[inline]
    pub(super) fn has_fin(&self) -> bool {
        self.fin.is_some()
    }
}

pub(crate) fn wrapping_lt(lhs: u32, rhs: u32) -> bool {
    // From RFC1323:
    //     TCP determines if a data segment is "old" or "new" by testing
    //     whether its sequence number is within 2**31 bytes of the left edge
    //     of the window, and if it is not, discarding the data as "old".
    lhs.wrapping_sub(rhs) > (1 << 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 1 << 20;

    fn flow(isn: u32) -> TcpFlow {
        let mut flow = TcpFlow::default();
        flow.synchronize(isn);
        flow
    }

    #[test]
    fn core_wrapping_lt() {
        assert!(wrapping_lt(1, 2));
        assert!(!wrapping_lt(2, 1));
        assert!(wrapping_lt(0xffff_fff0, 0x10));
        assert!(!wrapping_lt(0x10, 0xffff_fff0));
        assert!(!wrapping_lt(5, 5));
    }

    #[test]
    fn core_tcp_flow_wraparound() {
        let mut flow = flow(0xffff_fff0);
        let res = flow.insert(0x10, b"late", OverlapPolicy::FirstWins, LIMIT);
        assert_eq!(res, Ok(Insertion::Merged(4)));
        assert!(flow.flush().is_empty());

        let head = vec![b'x'; 0x20];
        flow.insert(0xffff_fff0, &head, OverlapPolicy::FirstWins, LIMIT)
            .unwrap();
        let data = flow.flush();
        assert_eq!(data.len(), 0x24);
        assert_eq!(&data[0x20..], b"late");
        assert_eq!(flow.next_seq(), Some(0x14));
    }

    #[test]
    fn core_tcp_flow_old_data() {
        let mut flow = flow(1000);
        flow.insert(1000, b"abcd", OverlapPolicy::FirstWins, LIMIT)
            .unwrap();
        assert_eq!(flow.flush(), b"abcd".to_vec());
        assert_eq!(
            flow.insert(1000, b"abcd", OverlapPolicy::FirstWins, LIMIT),
            Ok(Insertion::Stale)
        );
        // partial retransmission keeps only the new bytes
        flow.insert(1002, b"cdef", OverlapPolicy::LastWins, LIMIT)
            .unwrap();
        assert_eq!(flow.flush(), b"ef".to_vec());
        assert_eq!(
            flow.insert(1004, b"EFgh", OverlapPolicy::Reject, LIMIT),
            Ok(Insertion::Rejected(4..6))
        );
    }

    #[test]
    fn core_tcp_flow_before_start() {
        let mut flow = flow(500);
        flow.insert(496, b"zzzzabc", OverlapPolicy::FirstWins, LIMIT)
            .unwrap();
        assert_eq!(flow.flush(), b"abc".to_vec());
    }

    #[test]
    fn core_tcp_flow_fin() {
        let mut flow = flow(0);
        flow.insert(4, b"efgh", OverlapPolicy::FirstWins, LIMIT)
            .unwrap();
        flow.set_fin(6);
        assert!(flow.has_fin());
        assert!(!flow.is_closed());
        flow.insert(0, b"abcd", OverlapPolicy::FirstWins, LIMIT)
            .unwrap();
        assert_eq!(flow.flush(), b"abcdef".to_vec());
        assert!(flow.is_closed());
    }

    #[test]
    fn core_tcp_flow_span_limit() {
        let mut flow = flow(0);
        assert_eq!(
            flow.insert(60, b"abcdefgh", OverlapPolicy::FirstWins, 64),
            Err(FlowError::ResourceLimitExceeded)
        );
        assert_eq!(
            flow.insert(56, b"abcdefgh", OverlapPolicy::FirstWins, 64),
            Ok(Insertion::Merged(8))
        );
        assert_eq!(flow.nb_out_of_order(), 1);
    }
}

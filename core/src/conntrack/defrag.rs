//! IP defragmentation.
//!
//! Fragments of one datagram share a key ([Ipv4Key] or [Ipv6Key]). Each fragment is merged into
//! the datagram's buffer under the session's overlap policy; once the final fragment has fixed
//! the total length and every byte before it is present, the callback receives the whole payload
//! with [Reason::Complete] and the datagram is forgotten.
//!
//! IPv4 and IPv6 share the engine. They only differ in how a fragment is decoded (see
//! [pdu](super::pdu)) and in the key that groups fragments.

use super::buffer::{Insertion, ReassemblyBuffer};
use super::flow_id::{Ipv4Key, Ipv6Key};
use super::pdu::{Fragment, Ipv4Fragment, Ipv6Fragment};
use super::{Reassembly, Session};
use crate::config::{FragmentConfig, TableConfig};
use crate::dispatch::{Direction, Reason};
use crate::error::FlowError;

use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

/// Reassembly state of one fragmented datagram.
#[derive(Debug)]
pub struct Datagram<K> {
    buffer: ReassemblyBuffer,
    /// Payload length, known once the final fragment arrives.
    total: Option<u64>,
    nb_fragments: usize,
    _key: PhantomData<K>,
}

impl<K> Reassembly for Datagram<K>
where
    K: Clone + Eq + Hash + fmt::Debug + fmt::Display,
{
    type Key = K;
    type Config = FragmentConfig;

    fn new(_key: &K, _config: &FragmentConfig) -> Self {
        Datagram {
            buffer: ReassemblyBuffer::new(),
            total: None,
            nb_fragments: 0,
            _key: PhantomData,
        }
    }

    fn pending(&self) -> Vec<(Direction, Vec<u8>)> {
        vec![(Direction::Forward, self.buffer.assemble())]
    }

    fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn nb_gaps(&self) -> usize {
        self.buffer.gaps(self.total).len()
    }

    fn expected_len(&self) -> Option<u64> {
        self.total
    }

    fn is_complete(&self) -> bool {
        self.total.map_or(false, |total| self.buffer.covers(total))
    }

    fn inactivity_window(&self, config: &FragmentConfig) -> Duration {
        config.inactivity_window()
    }
}

/// What to do with a datagram after merging a fragment.
enum Verdict {
    Pending,
    Overlap,
    Complete,
    Abort(FlowError),
}

impl<C> Session<Datagram<Ipv4Key>, C>
where
    C: Default,
{
    /// Adds one fragment of the IPv4 datagram identified by `key`, creating the datagram if
    /// needed.
    ///
    /// Fails with [FlowError::MalformedHeader] for fragments inconsistent with the configured
    /// limits or with fragments already received, leaving any existing state untouched. Fails
    /// with [FlowError::SessionFull] if neither the table nor the memory budget has room. Fails
    /// with [FlowError::ResourceLimitExceeded] when the datagram exceeds its fragment count or
    /// size limit; the datagram is then discarded after a [Reason::Error] callback.
    pub fn add_fragment(
        &mut self,
        key: &Ipv4Key,
        fragment: Ipv4Fragment<'_>,
        now: Instant,
    ) -> Result<(), FlowError> {
        self.defragment(key, &fragment, now)
    }
}

impl<C> Session<Datagram<Ipv6Key>, C>
where
    C: Default,
{
    /// Adds one fragment of the IPv6 packet identified by `key`, creating the packet if needed.
    ///
    /// The payload is the fragmentable part carried after the fragment header. Errors are the
    /// same as for IPv4 fragments.
    pub fn add_fragment(
        &mut self,
        key: &Ipv6Key,
        fragment: Ipv6Fragment<'_>,
        now: Instant,
    ) -> Result<(), FlowError> {
        self.defragment(key, &fragment, now)
    }
}

impl<K, C> Session<Datagram<K>, C>
where
    K: Clone + Eq + Hash + fmt::Debug + fmt::Display,
    C: Default,
{
    fn defragment<F: Fragment>(
        &mut self,
        key: &K,
        fragment: &F,
        now: Instant,
    ) -> Result<(), FlowError> {
        if let Err(err) = self.check_fragment(key, fragment) {
            self.stats.malformed += 1;
            return Err(err);
        }
        self.reserve(key, fragment.length())?;
        self.stats.packets += 1;

        let policy = self.config.overlap();
        let max_fragments = self.config.max_fragments;
        let max_reassembled_size = self.config.max_reassembled_size;
        let offset = fragment.byte_offset() as u64;

        let flow = self.upsert(key, now)?;
        let before = flow.state.buffered();
        flow.state.nb_fragments += 1;
        let verdict = if flow.state.nb_fragments > max_fragments {
            log::debug!("{}: too many fragments", key);
            Verdict::Abort(FlowError::ResourceLimitExceeded)
        } else {
            match flow.state.buffer.insert(offset, fragment.data(), policy) {
                Ok(Insertion::Rejected(range)) => {
                    log::warn!("{}: overlapping fragment rejected at {:?}", key, range);
                    flow.dispatch(flow.event(Reason::Overlap, fragment.data()).range(range));
                    Verdict::Overlap
                }
                Ok(_) => {
                    if !fragment.is_more_fragments() {
                        flow.state.total = Some(fragment.end() as u64);
                    }
                    if flow.state.buffer.len() > max_reassembled_size {
                        log::debug!("{}: reassembled size exceeded", key);
                        Verdict::Abort(FlowError::ResourceLimitExceeded)
                    } else if flow.state.is_complete() {
                        Verdict::Complete
                    } else {
                        Verdict::Pending
                    }
                }
                Err(err) => Verdict::Abort(err),
            }
        };
        let after = flow.state.buffered();
        self.account(before, after);

        match verdict {
            Verdict::Pending => Ok(()),
            Verdict::Overlap => {
                self.stats.overlaps += 1;
                Ok(())
            }
            Verdict::Complete => {
                if let Some(mut flow) = self.remove(key) {
                    let data = flow.state.buffer.take_contiguous();
                    self.stats.flows_completed += 1;
                    self.stats.bytes_delivered += data.len() as u64;
                    flow.dispatch(flow.event(Reason::Complete, &data));
                }
                Ok(())
            }
            Verdict::Abort(err) => {
                if let Some(flow) = self.remove(key) {
                    self.stats.flows_aborted += 1;
                    flow.abort(err);
                }
                Err(err)
            }
        }
    }

    /// Checks a fragment against the session limits and the datagram it belongs to.
    fn check_fragment<F: Fragment>(&self, key: &K, fragment: &F) -> Result<(), FlowError> {
        if fragment.data().is_empty() {
            log::debug!("{}: empty fragment", key);
            return Err(FlowError::MalformedHeader);
        }
        if fragment.end() > self.config.max_datagram_size {
            log::debug!("{}: fragment ends at {}", key, fragment.end());
            return Err(FlowError::MalformedHeader);
        }
        if fragment.is_more_fragments() {
            if fragment.length() % 8 != 0 {
                log::debug!("{}: unaligned fragment length {}", key, fragment.length());
                return Err(FlowError::MalformedHeader);
            }
            if fragment.length() < self.config.min_fragment_size {
                log::debug!("{}: tiny fragment length {}", key, fragment.length());
                return Err(FlowError::MalformedHeader);
            }
        }

        if let Some(flow) = self.table.get(key) {
            let datagram = &flow.state;
            let end = fragment.end() as u64;
            match datagram.total {
                Some(total) if end > total || (!fragment.is_more_fragments() && end != total) => {
                    log::debug!("{}: fragment ends at {}, total is {}", key, end, total);
                    return Err(FlowError::MalformedHeader);
                }
                None if !fragment.is_more_fragments() && datagram.buffer.end() > end => {
                    log::debug!("{}: final fragment ends before buffered data", key);
                    return Err(FlowError::MalformedHeader);
                }
                _ => (),
            }
        }
        Ok(())
    }
}

//! Flow tracking and reassembly.
//!
//! A [Session] owns a bounded table of flows for one protocol. The IPv4 and IPv6 sessions
//! ([Ipv4Session], [Ipv6Session]) reassemble fragmented datagrams; the TCP session
//! ([TcpSession]) reassembles byte streams. All of them share the table management implemented
//! here: bounded capacity with an explicit full-table policy, a session-wide memory budget,
//! least-recently-active eviction, and caller-driven idle expiry.
//!
//! Sessions have no internal concurrency and start no timers. Every operation completes before
//! it returns, and callbacks run synchronously inside the call that triggered them. A session is
//! `Send` when its user context is, so it can be moved to a worker, but it must not be mutated
//! from several threads without external locking. Independent sessions share no state.

pub(crate) mod buffer;
pub mod defrag;
pub(crate) mod flow;
pub mod flow_id;
pub mod pdu;
pub mod tcp;
mod timerwheel;

use self::flow::{Flow, FlowInfo};
use self::flow_id::{Ipv4Key, Ipv6Key};
use self::timerwheel::TimerWheel;
use crate::config::{FullPolicy, TableConfig};
use crate::dispatch::{Callback, Direction, FlowEvent, FlowId, Reason};
use crate::error::FlowError;
use crate::stats::SessionStats;

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashlink::linked_hash_map::{LinkedHashMap, RawEntryMut};

/// Protocol-specific reassembly state stored in each flow.
pub trait Reassembly: Sized {
    /// Flow identifier.
    type Key: Clone + Eq + Hash + fmt::Debug + fmt::Display;
    /// Session options.
    type Config: TableConfig;

    /// Creates empty state for a flow first seen with `key`.
    fn new(key: &Self::Key, config: &Self::Config) -> Self;

    /// Returns the key the flow is stored under.
    fn normalize(key: &Self::Key, _config: &Self::Config) -> Self::Key {
        key.clone()
    }

    /// Bytes buffered but not delivered, with holes zero-filled, for each direction that holds
    /// any. A flow with nothing buffered reports a single empty forward entry.
    fn pending(&self) -> Vec<(Direction, Vec<u8>)>;

    /// Number of buffered bytes.
    fn buffered(&self) -> usize;

    /// Number of holes in the buffered data.
    fn nb_gaps(&self) -> usize;

    /// Total expected length, if known.
    fn expected_len(&self) -> Option<u64> {
        None
    }

    /// Returns `true` once nothing but delivery remains.
    fn is_complete(&self) -> bool;

    /// Idle time after which the flow expires.
    fn inactivity_window(&self, config: &Self::Config) -> Duration;
}

/// A bounded collection of flows for one protocol.
///
/// `C` is the user context type stored with every flow and handed back on each callback.
/// Flows created implicitly by ingestion get `C::default()` and the session callback.
pub struct Session<R, C = ()>
where
    R: Reassembly,
{
    /// Configuration
    pub(crate) config: R::Config,
    /// Manages key to flow mappings, least-recently-active first.
    pub(crate) table: LinkedHashMap<R::Key, Flow<R, C>>,
    /// Callback for implicitly created flows.
    pub(crate) callback: Callback<R::Key, C>,
    /// Expiry timers of the tracked flows.
    timers: TimerWheel<R::Key>,
    /// Bytes buffered across all flows.
    memory: usize,
    /// Next flow identifier.
    next_id: u64,
    pub(crate) stats: SessionStats,
}

impl<R, C> Session<R, C>
where
    R: Reassembly,
{
    /// Creates a session tracking at most `max_flows` flows, with table space reserved for
    /// `min_flows`, and default options otherwise.
    pub fn new<F>(min_flows: usize, max_flows: usize, callback: F) -> Result<Self, FlowError>
    where
        R::Config: Default,
        F: Fn(&FlowEvent<'_, R::Key, C>) + Send + Sync + 'static,
    {
        let mut config = R::Config::default();
        config.set_bounds(min_flows, max_flows);
        Self::with_config(config, callback)
    }

    /// Creates a session from `config`.
    pub fn with_config<F>(config: R::Config, callback: F) -> Result<Self, FlowError>
    where
        F: Fn(&FlowEvent<'_, R::Key, C>) + Send + Sync + 'static,
    {
        config.validate()?;
        let table = LinkedHashMap::with_capacity(config.min_flows());
        let timers = TimerWheel::new(config.max_inactivity_window(), config.timeout_resolution());
        Ok(Session {
            config,
            table,
            callback: Arc::new(callback),
            timers,
            memory: 0,
            next_id: 0,
            stats: SessionStats::default(),
        })
    }

    /// Returns the session options.
    pub fn config(&self) -> &R::Config {
        &self.config
    }

    /// Returns the session callback, e.g. to pass to [new_flow](Session::new_flow).
    pub fn callback(&self) -> Callback<R::Key, C> {
        Arc::clone(&self.callback)
    }

    /// Returns the number of tracked flows.
    #[inline]
    pub fn size(&self) -> usize {
        self.table.len()
    }

    /// Returns the maximum number of tracked flows.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.config.max_flows()
    }

    /// Returns the number of bytes buffered across all flows.
    #[inline]
    pub fn memory(&self) -> usize {
        self.memory
    }

    /// Returns the session counters.
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Looks up the flow tracking `key`.
    pub fn find_flow(&self, key: &R::Key) -> Option<FlowId> {
        let key = R::normalize(key, &self.config);
        self.table.get(&key).map(|flow| flow.id)
    }

    /// Returns a snapshot of the flow tracking `key`.
    pub fn flow_info(&self, key: &R::Key) -> Option<FlowInfo> {
        let key = R::normalize(key, &self.config);
        self.table.get(&key).map(|flow| flow.info())
    }

    /// Starts tracking `key`, delivering its events to `callback` along with `context`.
    ///
    /// Fails with [FlowError::DuplicateKey] if the key is already tracked. If the table is full,
    /// either fails with [FlowError::SessionFull] or evicts the least-recently-active flow,
    /// depending on the configured [FullPolicy].
    pub fn new_flow(
        &mut self,
        key: R::Key,
        callback: Callback<R::Key, C>,
        context: C,
        now: Instant,
    ) -> Result<FlowId, FlowError> {
        self.create_flow(&key, callback, context, now)
    }

    /// Changes the maximum number of tracked flows.
    ///
    /// Shrinking below the current size evicts the least-recently-active flows. Fails with
    /// [FlowError::InvalidArgument] if `max_flows` is zero or below the configured minimum.
    pub fn resize(&mut self, max_flows: usize) -> Result<(), FlowError> {
        let min_flows = self.config.min_flows();
        if max_flows == 0 || max_flows < min_flows {
            return Err(FlowError::InvalidArgument);
        }
        self.config.set_bounds(min_flows, max_flows);
        while self.table.len() > max_flows && self.evict_front() {}
        log::info!("Resized table to {} flows", max_flows);
        Ok(())
    }

    /// Expires flows idle for longer than their inactivity window, delivering any buffered data
    /// with [Reason::Timeout].
    ///
    /// Returns the number of flows removed.
    pub fn tick(&mut self, now: Instant) -> usize {
        let config = &self.config;
        let table = &mut self.table;
        let mut expired = vec![];
        self.timers.expire(now, |key, timer| {
            match table.raw_entry_mut().from_key(key) {
                RawEntryMut::Occupied(mut occupied) => {
                    let flow = occupied.get();
                    if flow.timer != timer {
                        return None;
                    }
                    let deadline = flow.last_seen_ts + flow.state.inactivity_window(config);
                    if now > deadline {
                        expired.push(occupied.remove());
                        None
                    } else {
                        occupied.get_mut().deadline = deadline;
                        Some(deadline)
                    }
                }
                RawEntryMut::Vacant(_) => None,
            }
        });

        let nb_expired = expired.len();
        for flow in expired {
            self.memory -= flow.state.buffered();
            flow.terminate(Reason::Timeout);
        }
        self.stats.flows_timed_out += nb_expired as u64;
        if nb_expired > 0 {
            log::debug!("expired: {}, new table size: {}", nb_expired, self.size());
        }
        nb_expired
    }

    /// Releases the session and every flow it owns without invoking callbacks.
    pub fn free(self) {
        log::info!("Releasing session with {} flows", self.size());
        drop(self);
    }

    pub(crate) fn create_flow(
        &mut self,
        key: &R::Key,
        callback: Callback<R::Key, C>,
        context: C,
        now: Instant,
    ) -> Result<FlowId, FlowError> {
        let stored = R::normalize(key, &self.config);
        if self.table.contains_key(&stored) {
            return Err(FlowError::DuplicateKey);
        }
        self.make_room()?;
        let id = FlowId(self.next_id);
        self.next_id += 1;
        let state = R::new(key, &self.config);
        let mut flow = Flow::new(id, stored.clone(), state, callback, context, now);
        flow.deadline = now + flow.state.inactivity_window(&self.config);
        flow.timer = self.timers.insert(stored.clone(), flow.deadline);
        self.table.insert(stored, flow);
        self.stats.flows_created += 1;
        Ok(id)
    }

    /// Ensures there is room for one more flow.
    fn make_room(&mut self) -> Result<(), FlowError> {
        if self.table.len() < self.config.max_flows() {
            return Ok(());
        }
        match self.config.on_full() {
            FullPolicy::Reject => {
                log::error!("Table full. Rejecting new flow.");
                self.stats.flows_rejected += 1;
                Err(FlowError::SessionFull)
            }
            FullPolicy::Evict => {
                self.evict_front();
                Ok(())
            }
        }
    }

    /// Evicts the least-recently-active flow. Returns `false` if the table is empty.
    fn evict_front(&mut self) -> bool {
        match self.table.pop_front() {
            Some((_, flow)) => {
                log::debug!("Evicting {}", flow.key);
                self.memory -= flow.state.buffered();
                self.stats.flows_evicted += 1;
                flow.terminate(Reason::Evicted);
                true
            }
            None => false,
        }
    }

    /// Makes room in the memory budget for `len` more bytes destined to the flow tracking
    /// `key`.
    ///
    /// Under [FullPolicy::Evict] other flows are evicted, least recently active first. Fails
    /// with [FlowError::SessionFull] if the bytes still do not fit.
    pub(crate) fn reserve(&mut self, key: &R::Key, len: usize) -> Result<(), FlowError> {
        let max_memory = self.config.max_memory();
        if self.memory + len <= max_memory {
            return Ok(());
        }
        if self.config.on_full() == FullPolicy::Evict {
            let stored = R::normalize(key, &self.config);
            self.table.to_back(&stored);
            while self.memory + len > max_memory {
                if !matches!(self.table.front(), Some((front, _)) if *front != stored) {
                    break;
                }
                self.evict_front();
            }
        }
        if self.memory + len > max_memory {
            log::warn!("Memory budget exhausted. Refusing {} bytes for {}", len, key);
            self.stats.over_budget += 1;
            return Err(FlowError::SessionFull);
        }
        Ok(())
    }

    /// Records that a flow's buffered byte count went from `before` to `after`.
    #[inline]
    pub(crate) fn account(&mut self, before: usize, after: usize) {
        self.memory = self.memory + after - before;
    }

    /// Moves the expiry timer of the flow tracking `key` forward if its inactivity window
    /// shrank.
    pub(crate) fn rearm(&mut self, key: &R::Key) {
        let stored = R::normalize(key, &self.config);
        if let Some(flow) = self.table.get_mut(&stored) {
            let deadline = flow.last_seen_ts + flow.state.inactivity_window(&self.config);
            if deadline < flow.deadline {
                flow.deadline = deadline;
                flow.timer = self.timers.insert(stored, deadline);
            }
        }
    }

    /// Returns the flow tracking `key`, creating it with the session callback if needed, and
    /// records one packet of activity on it.
    pub(crate) fn upsert(&mut self, key: &R::Key, now: Instant) -> Result<&mut Flow<R, C>, FlowError>
    where
        C: Default,
    {
        let stored = R::normalize(key, &self.config);
        if !self.table.contains_key(&stored) {
            self.make_room()?;
        }
        let flow = match self.table.raw_entry_mut().from_key(&stored) {
            RawEntryMut::Occupied(mut occupied) => {
                occupied.to_back();
                occupied.into_mut()
            }
            RawEntryMut::Vacant(vacant) => {
                let id = FlowId(self.next_id);
                self.next_id += 1;
                self.stats.flows_created += 1;
                let state = R::new(key, &self.config);
                let callback = Arc::clone(&self.callback);
                let mut flow = Flow::new(id, stored.clone(), state, callback, C::default(), now);
                flow.deadline = now + flow.state.inactivity_window(&self.config);
                flow.timer = self.timers.insert(stored.clone(), flow.deadline);
                vacant.insert(stored, flow).1
            }
        };
        flow.last_seen_ts = now;
        flow.nb_pkts += 1;
        Ok(flow)
    }

    /// Stops tracking `key`, handing the flow back to the caller.
    pub(crate) fn remove(&mut self, key: &R::Key) -> Option<Flow<R, C>> {
        let key = R::normalize(key, &self.config);
        let flow = self.table.remove(&key)?;
        self.memory -= flow.state.buffered();
        Some(flow)
    }
}

/// IPv4 defragmentation session.
pub type Ipv4Session<C = ()> = Session<defrag::Datagram<Ipv4Key>, C>;

/// IPv6 defragmentation session.
pub type Ipv6Session<C = ()> = Session<defrag::Datagram<Ipv6Key>, C>;

/// TCP stream reassembly session.
pub type TcpSession<C = ()> = Session<tcp::TcpConn, C>;

//! TCP stream reassembly.
//!
//! Each connection follows a simplified TCP state machine: `SynSeen -> Established -> (FinSeen |
//! RstSeen) -> Closed`. Segments are placed in their half-stream by sequence number using modulo
//! 2^32 arithmetic, and every time the contiguous prefix grows, the new bytes are handed to the
//! callback with [Reason::Data]. A RST ends the connection at once with [Reason::Reset]; a FIN
//! ends it with [Reason::Closed] once every byte before it was delivered.
//!
//! By default each direction of a connection is its own flow. With
//! [TcpConfig::bidirectional](crate::config::TcpConfig::bidirectional) set, both directions share
//! one flow and each event carries its [Direction].

pub(crate) mod reassembly;

use self::reassembly::TcpFlow;
use super::buffer::Insertion;
use super::flow::Flow;
use super::flow_id::TcpKey;
use super::pdu::TcpSegment;
use super::{Reassembly, Session};
use crate::config::{OverlapPolicy, TableConfig, TcpConfig};
use crate::dispatch::{Direction, Reason};
use crate::error::FlowError;

use std::time::{Duration, Instant};

use serde::Serialize;

pub const CWR: u8 = 0b1000_0000;
pub const ECE: u8 = 0b0100_0000;
pub const URG: u8 = 0b0010_0000;
pub const ACK: u8 = 0b0001_0000;
pub const PSH: u8 = 0b0000_1000;
pub const RST: u8 = 0b0000_0100;
pub const SYN: u8 = 0b0000_0010;
pub const FIN: u8 = 0b0000_0001;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TcpState {
    /// A SYN was seen, but no segment acknowledging it.
    SynSeen,
    /// Data may flow in both directions.
    Established,
    /// At least one side sent a FIN.
    FinSeen,
    /// A RST was seen.
    RstSeen,
    /// All data up to the FIN was delivered.
    Closed,
}

/// Reassembly state of one TCP connection.
#[derive(Debug)]
pub struct TcpConn {
    /// Originator to responder key
    orig: TcpKey,
    state: TcpState,
    bidirectional: bool,
    ctos: TcpFlow,
    stoc: TcpFlow,
}

impl TcpConn {
    #[inline]
    fn direction(&self, key: &TcpKey) -> Direction {
        if *key == self.orig {
            Direction::Forward
        } else {
            Direction::Reverse
        }
    }

    /// Returns `true` if the connection should be terminated
    #[inline]
    fn is_closed(&self) -> bool {
        self.ctos.is_closed() && (!self.bidirectional || self.stoc.is_closed())
    }
}

impl Reassembly for TcpConn {
    type Key = TcpKey;
    type Config = TcpConfig;

    fn new(key: &TcpKey, config: &TcpConfig) -> Self {
        TcpConn {
            orig: *key,
            state: TcpState::SynSeen,
            bidirectional: config.bidirectional,
            ctos: TcpFlow::default(),
            stoc: TcpFlow::default(),
        }
    }

    fn normalize(key: &TcpKey, config: &TcpConfig) -> TcpKey {
        if config.bidirectional {
            key.canonical()
        } else {
            *key
        }
    }

    fn pending(&self) -> Vec<(Direction, Vec<u8>)> {
        let pending: Vec<_> = [
            (Direction::Forward, self.ctos.buffer.assemble()),
            (Direction::Reverse, self.stoc.buffer.assemble()),
        ]
        .into_iter()
        .filter(|(_, data)| !data.is_empty())
        .collect();
        if pending.is_empty() {
            vec![(Direction::Forward, vec![])]
        } else {
            pending
        }
    }

    fn buffered(&self) -> usize {
        self.ctos.buffer.len() + self.stoc.buffer.len()
    }

    fn nb_gaps(&self) -> usize {
        self.ctos.buffer.gaps(None).len() + self.stoc.buffer.gaps(None).len()
    }

    fn is_complete(&self) -> bool {
        self.ctos.has_fin() && (!self.bidirectional || self.stoc.has_fin())
    }

    fn inactivity_window(&self, config: &TcpConfig) -> Duration {
        match self.state {
            TcpState::SynSeen => config.establish_window(),
            _ => config.inactivity_window(),
        }
    }
}

/// Per-segment limits taken from the session configuration.
struct Limits {
    overlap: OverlapPolicy,
    max_out_of_order: usize,
    max_buffered: usize,
}

/// Counters updated while handling one segment.
#[derive(Debug, Default)]
struct Notice {
    delivered: u64,
    overlaps: u64,
}

/// What to do with a connection after handling a segment.
enum Verdict {
    Continue,
    Ignored,
    Reset,
    Closed,
    Abort(FlowError),
}

impl<C> Flow<TcpConn, C> {
    /// Advances the connection with one segment sent on `key`, delivering newly contiguous
    /// bytes and overlap notifications.
    fn update(
        &mut self,
        key: &TcpKey,
        segment: TcpSegment<'_>,
        limits: &Limits,
        notice: &mut Notice,
    ) -> Verdict {
        let dir = self.state.direction(key);
        if segment.flags & RST != 0 {
            self.state.state = TcpState::RstSeen;
            return Verdict::Reset;
        }

        let half = match dir {
            Direction::Forward => &mut self.state.ctos,
            Direction::Reverse => &mut self.state.stoc,
        };
        let mut seq = segment.seq_no;
        if segment.flags & SYN != 0 {
            if half.is_synchronized() {
                log::debug!("Ignoring SYN on synchronized flow. seq: {}", seq);
                return Verdict::Ignored;
            }
            // SYN occupies one sequence number
            seq = seq.wrapping_add(1);
            half.synchronize(seq);
        } else {
            if !half.is_synchronized() {
                log::debug!("Picking up flow at seq: {}", seq);
                half.synchronize(seq);
            }
            if self.state.state == TcpState::SynSeen {
                self.state.state = TcpState::Established;
            }
        }

        match half.insert(seq, segment.payload, limits.overlap, limits.max_buffered) {
            Ok(Insertion::Rejected(range)) => {
                log::warn!("{}: overlapping segment rejected at {:?}", key, range);
                notice.overlaps += 1;
                self.dispatch(
                    self.event(Reason::Overlap, segment.payload)
                        .direction(dir)
                        .range(range),
                );
            }
            Ok(_) => (),
            Err(err) => return Verdict::Abort(err),
        }

        // a rejected segment still ends the stream where its FIN says
        let half = match dir {
            Direction::Forward => &mut self.state.ctos,
            Direction::Reverse => &mut self.state.stoc,
        };
        if segment.flags & FIN != 0 {
            half.set_fin(seq.wrapping_add(segment.length() as u32));
            self.state.state = TcpState::FinSeen;
        }
        let data = half.flush();
        let nb_out_of_order = half.nb_out_of_order();

        if !data.is_empty() {
            notice.delivered += data.len() as u64;
            self.dispatch(self.event(Reason::Data, &data).direction(dir));
        }
        if self.state.is_closed() {
            Verdict::Closed
        } else if nb_out_of_order > limits.max_out_of_order {
            log::warn!("Out-of-order buffer overflow");
            Verdict::Abort(FlowError::ResourceLimitExceeded)
        } else {
            Verdict::Continue
        }
    }
}

impl<C> Session<TcpConn, C>
where
    C: Default,
{
    /// Adds one segment sent on `key`.
    ///
    /// Segments for untracked connections start a flow only if they carry a SYN, or if
    /// [TcpConfig::allow_midstream](crate::config::TcpConfig::allow_midstream) is set; others are
    /// ignored. Fails with [FlowError::SessionFull] if neither the table nor the memory budget
    /// has room. Fails with [FlowError::ResourceLimitExceeded] when a half-stream exceeds its
    /// out-of-order or buffering limit; the connection is then discarded after a [Reason::Error]
    /// callback.
    pub fn add_segment(
        &mut self,
        key: &TcpKey,
        segment: TcpSegment<'_>,
        now: Instant,
    ) -> Result<(), FlowError> {
        let stored = TcpConn::normalize(key, &self.config);
        if !self.table.contains_key(&stored) {
            let can_start = segment.flags & SYN != 0 || self.config.allow_midstream;
            if !can_start || segment.flags & RST != 0 {
                log::debug!("Ignoring segment for untracked {}", key);
                self.stats.ignored += 1;
                return Ok(());
            }
        }
        self.reserve(key, segment.length())?;
        self.stats.packets += 1;

        let limits = Limits {
            overlap: self.config.overlap(),
            max_out_of_order: self.config.max_out_of_order,
            max_buffered: self.config.max_buffered,
        };
        let mut notice = Notice::default();
        let flow = self.upsert(key, now)?;
        let before = flow.state.buffered();
        let verdict = flow.update(key, segment, &limits, &mut notice);
        let after = flow.state.buffered();
        self.account(before, after);
        self.stats.bytes_delivered += notice.delivered;
        self.stats.overlaps += notice.overlaps;

        match verdict {
            Verdict::Continue => {
                self.rearm(key);
                Ok(())
            }
            Verdict::Ignored => {
                self.stats.ignored += 1;
                self.rearm(key);
                Ok(())
            }
            Verdict::Reset => {
                if let Some(flow) = self.remove(key) {
                    self.stats.flows_reset += 1;
                    flow.terminate(Reason::Reset);
                }
                Ok(())
            }
            Verdict::Closed => {
                if let Some(mut flow) = self.remove(key) {
                    flow.state.state = TcpState::Closed;
                    self.stats.flows_closed += 1;
                    flow.terminate(Reason::Closed);
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

    /// Returns the state of the connection tracking `key`.
    pub fn tcp_state(&self, key: &TcpKey) -> Option<TcpState> {
        let key = TcpConn::normalize(key, &self.config);
        self.table.get(&key).map(|flow| flow.state.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{FlowEvent, FlowId};

    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<(Reason, Direction, Vec<u8>)>>>;

    fn client() -> TcpKey {
        TcpKey::new(
            "10.0.0.1:40000".parse().unwrap(),
            "10.0.0.2:80".parse().unwrap(),
        )
    }

    fn session(config: TcpConfig) -> (Session<TcpConn>, Log) {
        let log: Log = Arc::new(Mutex::new(vec![]));
        let sink = Arc::clone(&log);
        let session = Session::with_config(config, move |ev: &FlowEvent<'_, TcpKey, ()>| {
            sink.lock()
                .unwrap()
                .push((ev.reason, ev.direction, ev.data.to_vec()))
        })
        .unwrap();
        (session, log)
    }

    fn data(log: &Log) -> Vec<u8> {
        log.lock()
            .unwrap()
            .iter()
            .filter(|(reason, _, _)| *reason == Reason::Data)
            .flat_map(|(_, _, data)| data.clone())
            .collect()
    }

    #[test]
    fn core_tcp_handshake_data_fin() {
        let (mut session, log) = session(TcpConfig::default());
        let now = Instant::now();
        let key = client();
        session
            .add_segment(&key, TcpSegment::new(99, SYN, b""), now)
            .unwrap();
        assert_eq!(session.tcp_state(&key), Some(TcpState::SynSeen));
        session
            .add_segment(&key, TcpSegment::new(100, ACK | PSH, b"hello "), now)
            .unwrap();
        assert_eq!(session.tcp_state(&key), Some(TcpState::Established));
        session
            .add_segment(&key, TcpSegment::new(111, ACK | FIN, b"!"), now)
            .unwrap();
        assert_eq!(session.tcp_state(&key), Some(TcpState::FinSeen));
        assert!(session.flow_info(&key).unwrap().complete);
        session
            .add_segment(&key, TcpSegment::new(106, ACK, b"world"), now)
            .unwrap();

        assert_eq!(data(&log), b"hello world!".to_vec());
        let log = log.lock().unwrap();
        assert_eq!(log.last().unwrap().0, Reason::Closed);
        assert_eq!(log.iter().filter(|e| e.0 == Reason::Closed).count(), 1);
        assert_eq!(session.size(), 0);
        assert_eq!(session.tcp_state(&key), None);
        assert_eq!(session.stats().flows_closed, 1);
        assert_eq!(session.stats().bytes_delivered, 12);
    }

    #[test]
    fn core_tcp_reset() {
        let (mut session, log) = session(TcpConfig::default());
        let now = Instant::now();
        let key = client();
        session
            .add_segment(&key, TcpSegment::new(0, SYN, b""), now)
            .unwrap();
        session
            .add_segment(&key, TcpSegment::new(5, ACK, b"later"), now)
            .unwrap();
        session
            .add_segment(&key, TcpSegment::new(1, RST, b""), now)
            .unwrap();
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, Reason::Reset);
        assert_eq!(log[0].2, b"\0\0\0\0later".to_vec());
        assert_eq!(session.size(), 0);
    }

    #[test]
    fn core_tcp_untracked_ignored() {
        let (mut session, log) = session(TcpConfig::default());
        let now = Instant::now();
        session
            .add_segment(&client(), TcpSegment::new(7, ACK, b"data"), now)
            .unwrap();
        session
            .add_segment(&client(), TcpSegment::new(7, RST, b""), now)
            .unwrap();
        assert_eq!(session.size(), 0);
        assert_eq!(session.stats().ignored, 2);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn core_tcp_midstream() {
        let config = TcpConfig {
            allow_midstream: true,
            ..TcpConfig::default()
        };
        let (mut session, log) = session(config);
        let now = Instant::now();
        session
            .add_segment(&client(), TcpSegment::new(5000, ACK, b"mid"), now)
            .unwrap();
        session
            .add_segment(&client(), TcpSegment::new(5003, ACK, b"stream"), now)
            .unwrap();
        assert_eq!(data(&log), b"midstream".to_vec());
        assert_eq!(session.tcp_state(&client()), Some(TcpState::Established));
    }

    #[test]
    fn core_tcp_new_flow_pickup() {
        let (mut session, log) = session(TcpConfig::default());
        let now = Instant::now();
        let cb = session.callback();
        let id = session.new_flow(client(), cb, (), now).unwrap();
        assert_eq!(id, FlowId(0));
        session
            .add_segment(&client(), TcpSegment::new(42, ACK, b"abc"), now)
            .unwrap();
        assert_eq!(data(&log), b"abc".to_vec());
    }

    #[test]
    fn core_tcp_syn_retransmission() {
        let (mut session, log) = session(TcpConfig::default());
        let now = Instant::now();
        let key = client();
        session
            .add_segment(&key, TcpSegment::new(10, SYN, b""), now)
            .unwrap();
        session
            .add_segment(&key, TcpSegment::new(11, ACK, b"ab"), now)
            .unwrap();
        session
            .add_segment(&key, TcpSegment::new(10, SYN, b""), now)
            .unwrap();
        session
            .add_segment(&key, TcpSegment::new(13, ACK, b"cd"), now)
            .unwrap();
        assert_eq!(data(&log), b"abcd".to_vec());
        assert_eq!(session.stats().ignored, 1);
    }

    #[test]
    fn core_tcp_reject_partial_retransmission() {
        let config = TcpConfig {
            overlap: OverlapPolicy::Reject,
            ..TcpConfig::default()
        };
        let (mut session, log) = session(config);
        let now = Instant::now();
        let key = client();
        session
            .add_segment(&key, TcpSegment::new(0, SYN, b""), now)
            .unwrap();
        session
            .add_segment(&key, TcpSegment::new(1, ACK, b"abcd"), now)
            .unwrap();
        // fully behind: silently dropped
        session
            .add_segment(&key, TcpSegment::new(1, ACK, b"abcd"), now)
            .unwrap();
        session
            .add_segment(&key, TcpSegment::new(3, ACK, b"CDef"), now)
            .unwrap();
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1], (Reason::Overlap, Direction::Forward, b"CDef".to_vec()));
        assert_eq!(session.stats().overlaps, 1);
        assert_eq!(session.size(), 1);
    }

    #[test]
    fn core_tcp_reject_overlap_keeps_fin() {
        let config = TcpConfig {
            overlap: OverlapPolicy::Reject,
            ..TcpConfig::default()
        };
        let (mut session, log) = session(config);
        let now = Instant::now();
        let key = client();
        session
            .add_segment(&key, TcpSegment::new(0, SYN, b""), now)
            .unwrap();
        session
            .add_segment(&key, TcpSegment::new(1, ACK, b"abcd"), now)
            .unwrap();
        session
            .add_segment(&key, TcpSegment::new(3, ACK | FIN, b"cdef"), now)
            .unwrap();
        assert_eq!(session.tcp_state(&key), Some(TcpState::FinSeen));
        session
            .add_segment(&key, TcpSegment::new(5, ACK, b"ef"), now)
            .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                (Reason::Data, Direction::Forward, b"abcd".to_vec()),
                (Reason::Overlap, Direction::Forward, b"cdef".to_vec()),
                (Reason::Data, Direction::Forward, b"ef".to_vec()),
                (Reason::Closed, Direction::Forward, vec![]),
            ]
        );
        assert_eq!(session.size(), 0);
        assert_eq!(session.stats().flows_closed, 1);
    }

    #[test]
    fn core_tcp_memory_budget() {
        let config = TcpConfig {
            max_memory: 8,
            ..TcpConfig::default()
        };
        let (mut session, _) = session(config);
        let now = Instant::now();
        let key = client();
        session
            .add_segment(&key, TcpSegment::new(0, SYN, b""), now)
            .unwrap();
        // delivered at once, nothing stays buffered
        session
            .add_segment(&key, TcpSegment::new(1, ACK, b"abcdefgh"), now)
            .unwrap();
        assert_eq!(session.memory(), 0);
        session
            .add_segment(&key, TcpSegment::new(20, ACK, b"zz"), now)
            .unwrap();
        assert_eq!(session.memory(), 2);
        assert_eq!(
            session.add_segment(&key, TcpSegment::new(30, ACK, b"0123456789"), now),
            Err(FlowError::SessionFull)
        );
        assert_eq!(session.memory(), 2);
        assert_eq!(session.stats().over_budget, 1);
        assert_eq!(session.flow_info(&key).unwrap().nb_pkts, 3);
    }

    #[test]
    fn core_tcp_out_of_order_limit() {
        let config = TcpConfig {
            max_out_of_order: 2,
            ..TcpConfig::default()
        };
        let (mut session, log) = session(config);
        let now = Instant::now();
        let key = client();
        session
            .add_segment(&key, TcpSegment::new(0, SYN, b""), now)
            .unwrap();
        for seq in [11, 21] {
            session
                .add_segment(&key, TcpSegment::new(seq, ACK, b"x"), now)
                .unwrap();
        }
        assert_eq!(
            session.add_segment(&key, TcpSegment::new(31, ACK, b"x"), now),
            Err(FlowError::ResourceLimitExceeded)
        );
        assert_eq!(session.size(), 0);
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, Reason::Error);
    }

    #[test]
    fn core_tcp_bidirectional() {
        let config = TcpConfig {
            bidirectional: true,
            ..TcpConfig::default()
        };
        let (mut session, log) = session(config);
        let now = Instant::now();
        let fwd = client();
        let rev = fwd.reversed();
        session
            .add_segment(&fwd, TcpSegment::new(100, SYN, b""), now)
            .unwrap();
        session
            .add_segment(&rev, TcpSegment::new(500, SYN | ACK, b""), now)
            .unwrap();
        assert_eq!(session.size(), 1);
        assert_eq!(session.tcp_state(&rev), Some(TcpState::SynSeen));
        session
            .add_segment(&fwd, TcpSegment::new(101, ACK, b"GET"), now)
            .unwrap();
        session
            .add_segment(&rev, TcpSegment::new(501, ACK, b"OK"), now)
            .unwrap();
        session
            .add_segment(&fwd, TcpSegment::new(104, ACK | FIN, b""), now)
            .unwrap();
        assert_eq!(session.size(), 1);
        session
            .add_segment(&rev, TcpSegment::new(503, ACK | FIN, b""), now)
            .unwrap();
        assert_eq!(session.size(), 0);

        let log = log.lock().unwrap();
        assert_eq!(
            *log,
            vec![
                (Reason::Data, Direction::Forward, b"GET".to_vec()),
                (Reason::Data, Direction::Reverse, b"OK".to_vec()),
                (Reason::Closed, Direction::Forward, vec![]),
            ]
        );
    }

    #[test]
    fn core_tcp_bidirectional_teardown_both_directions() {
        let config = TcpConfig {
            bidirectional: true,
            ..TcpConfig::default()
        };
        let (mut session, log) = session(config);
        let now = Instant::now();
        let fwd = client();
        let rev = fwd.reversed();
        session
            .add_segment(&fwd, TcpSegment::new(100, SYN, b""), now)
            .unwrap();
        session
            .add_segment(&rev, TcpSegment::new(500, SYN | ACK, b""), now)
            .unwrap();
        session
            .add_segment(&fwd, TcpSegment::new(105, ACK, b"FWDGAP"), now)
            .unwrap();
        session
            .add_segment(&rev, TcpSegment::new(505, ACK, b"REVGAP"), now)
            .unwrap();
        assert_eq!(session.memory(), 12);
        assert!(log.lock().unwrap().is_empty());

        assert_eq!(session.tick(now + Duration::from_secs(120)), 1);
        assert_eq!(session.memory(), 0);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                (Reason::Timeout, Direction::Forward, b"\0\0\0\0FWDGAP".to_vec()),
                (Reason::Timeout, Direction::Reverse, b"\0\0\0\0REVGAP".to_vec()),
            ]
        );
    }

    #[test]
    fn core_tcp_establish_timeout() {
        let (mut session, log) = session(TcpConfig::default());
        let start = Instant::now();
        let syn_only = client();
        let established = client().reversed();
        session
            .add_segment(&syn_only, TcpSegment::new(0, SYN, b""), start)
            .unwrap();
        session
            .add_segment(&established, TcpSegment::new(0, SYN, b""), start)
            .unwrap();
        session
            .add_segment(&established, TcpSegment::new(1, ACK, b"x"), start)
            .unwrap();
        let later = start + session.config().establish_window() + Duration::from_millis(1);
        assert_eq!(session.tick(later), 1);
        assert_eq!(session.tcp_state(&syn_only), None);
        assert_eq!(
            session.tcp_state(&established),
            Some(TcpState::Established)
        );
        assert_eq!(log.lock().unwrap().last().unwrap().0, Reason::Timeout);
    }
}

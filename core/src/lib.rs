//! A traffic normalization engine for IPv4 and IPv6 defragmentation and TCP stream reassembly.
//!
//! Intrusion detection and deep packet inspection systems must see the same bytes the end host
//! reconstructs, or payloads can be smuggled past them by splitting, reordering, duplicating, or
//! overlapping packets on the wire. This crate tracks per-flow state across packets, rebuilds
//! fragmented datagrams and out-of-order byte streams, and delivers the normalized data to a
//! callback exactly once and in order. Anomalies such as conflicting overlaps, resets, timeouts,
//! and evictions are reported structurally through the callback's [Reason].
//!
//! Header decoding and packet capture happen outside the engine: callers hand it a decoded key
//! and payload. The engine starts no threads and sets no timers; idle flows are expired by
//! calling [Session::tick] with the current time.
//!
//! ```rust
//! use reflow_core::{FlowEvent, Ipv4Fragment, Ipv4Key, Ipv4Session, Reason};
//! use std::net::Ipv4Addr;
//! use std::time::Instant;
//!
//! let mut session = Ipv4Session::new(0, 1024, |ev: &FlowEvent<'_, Ipv4Key, ()>| {
//!     if ev.reason == Reason::Complete {
//!         println!("{}: {} bytes", ev.key, ev.len());
//!     }
//! })
//! .unwrap();
//!
//! let key = Ipv4Key::from_header(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), 17, 1);
//! let now = Instant::now();
//! session.add_fragment(&key, Ipv4Fragment::new(1, false, b"tail"), now).unwrap();
//! session.add_fragment(&key, Ipv4Fragment::new(0, true, b"12345678"), now).unwrap();
//! assert_eq!(session.size(), 0);
//! ```

pub mod config;
pub mod conntrack;
pub mod dispatch;
pub mod error;
pub mod stats;

pub use self::conntrack::flow::FlowInfo;
pub use self::conntrack::flow_id::{Ipv4Key, Ipv6Key, TcpKey};
pub use self::conntrack::pdu::{Fragment, Ipv4Fragment, Ipv6Fragment, TcpSegment};
pub use self::conntrack::tcp::TcpState;
pub use self::conntrack::{Ipv4Session, Ipv6Session, Reassembly, Session, TcpSession};
pub use self::dispatch::{Callback, Direction, FlowEvent, FlowId, Reason};
pub use self::error::FlowError;
pub use self::stats::SessionStats;

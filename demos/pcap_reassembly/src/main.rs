//! Offline normalization of a capture file.
//!
//! Reads Ethernet frames from a pcap, defragments IPv4 and IPv6, reassembles TCP streams
//! (including streams carried in fragmented datagrams), and prints what the engine reported as
//! JSON.

use reflow_core::config::{default_config, load_config};
use reflow_core::conntrack::pdu::is_fragment;
use reflow_core::{
    FlowEvent, Ipv4Fragment, Ipv4Key, Ipv4Session, Ipv6Fragment, Ipv6Key, Ipv6Session, Reason,
    SessionStats, TcpKey, TcpSegment, TcpSession,
};

use std::collections::{BTreeMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use pcap::Capture;
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::{FragmentPacket, Ipv6Packet};
use pnet::packet::tcp::TcpPacket;
use pnet::packet::Packet;
use serde::Serialize;

/// Sessions are swept at most this often, in capture time.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
struct Args {
    #[clap(short, long, parse(from_os_str), value_name = "FILE")]
    config: Option<PathBuf>,
    #[clap(short, long, parse(from_os_str), value_name = "FILE")]
    pcap: PathBuf,
}

/// Callback invocations per reason.
type Counts = Arc<Mutex<BTreeMap<String, u64>>>;

/// Reassembled datagrams waiting to be handed to the TCP session.
type Datagrams = Arc<Mutex<VecDeque<(IpAddr, IpAddr, Vec<u8>)>>>;

#[derive(Debug, Serialize)]
struct SessionReport {
    events: BTreeMap<String, u64>,
    stats: SessionStats,
}

#[derive(Debug, Serialize)]
struct Report {
    nb_frames: u64,
    nb_skipped: u64,
    ipv4: SessionReport,
    ipv6: SessionReport,
    tcp: SessionReport,
}

/// Maps capture timestamps onto the monotonic clock the sessions run on.
struct CaptureClock {
    origin: Instant,
    first: Option<Duration>,
    last: Instant,
}

impl CaptureClock {
    fn new() -> Self {
        let origin = Instant::now();
        CaptureClock {
            origin,
            first: None,
            last: origin,
        }
    }

    fn at(&mut self, ts: Duration) -> Instant {
        let first = *self.first.get_or_insert(ts);
        let now = self.origin + ts.saturating_sub(first);
        self.last = self.last.max(now);
        now
    }
}

fn count(counts: &Counts, reason: Reason) {
    *counts
        .lock()
        .unwrap()
        .entry(reason.as_ref().to_string())
        .or_insert(0) += 1;
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => default_config(),
    };
    log::debug!("{:#?}", config);

    let ipv4_counts = Counts::default();
    let ipv6_counts = Counts::default();
    let tcp_counts = Counts::default();
    let datagrams = Datagrams::default();

    let mut ipv4 = {
        let counts = Arc::clone(&ipv4_counts);
        let queue = Arc::clone(&datagrams);
        Ipv4Session::with_config(
            config.ipv4.clone(),
            move |ev: &FlowEvent<'_, Ipv4Key, ()>| {
                count(&counts, ev.reason);
                if ev.reason == Reason::Complete && ev.key.proto == IpNextHeaderProtocols::Tcp.0 {
                    let (src, dst) = (IpAddr::V4(ev.key.src), IpAddr::V4(ev.key.dst));
                    queue.lock().unwrap().push_back((src, dst, ev.data.to_vec()));
                }
            },
        )?
    };
    let mut ipv6 = {
        let counts = Arc::clone(&ipv6_counts);
        let queue = Arc::clone(&datagrams);
        Ipv6Session::with_config(
            config.ipv6.clone(),
            move |ev: &FlowEvent<'_, Ipv6Key, ()>| {
                count(&counts, ev.reason);
                if ev.reason == Reason::Complete && ev.key.proto == IpNextHeaderProtocols::Tcp.0 {
                    let (src, dst) = (IpAddr::V6(ev.key.src), IpAddr::V6(ev.key.dst));
                    queue.lock().unwrap().push_back((src, dst, ev.data.to_vec()));
                }
            },
        )?
    };
    let mut tcp = {
        let counts = Arc::clone(&tcp_counts);
        TcpSession::with_config(config.tcp.clone(), move |ev: &FlowEvent<'_, TcpKey, ()>| {
            count(&counts, ev.reason);
            match ev.reason {
                Reason::Data => log::debug!("{} {}: {} bytes", ev.flow, ev.key, ev.len()),
                _ => log::info!("{} {}: {}", ev.flow, ev.key, ev.reason),
            }
        })?
    };

    log::info!("Processing pcap: {}", args.pcap.display());
    let mut cap = Capture::from_file(&args.pcap)
        .with_context(|| format!("Error opening pcap {}", args.pcap.display()))?;
    let mut clock = CaptureClock::new();
    let mut last_tick = clock.origin;
    let mut nb_frames = 0;
    let mut nb_skipped = 0;
    while let Ok(frame) = cap.next() {
        nb_frames += 1;
        let ts = Duration::from_secs(frame.header.ts.tv_sec as u64)
            + Duration::from_micros(frame.header.ts.tv_usec as u64);
        let now = clock.at(ts);
        let mut sessions = Sessions {
            ipv4: &mut ipv4,
            ipv6: &mut ipv6,
            tcp: &mut tcp,
            datagrams: &datagrams,
        };
        if !sessions.process_frame(frame.data, now) {
            nb_skipped += 1;
        }
        if now.saturating_duration_since(last_tick) >= TICK_INTERVAL {
            ipv4.tick(now);
            ipv6.tick(now);
            tcp.tick(now);
            last_tick = now;
        }
    }

    // Expire whatever is left so partial data is accounted for
    let idle = config
        .ipv4
        .inactivity_timeout
        .max(config.ipv6.inactivity_timeout)
        .max(config.tcp.inactivity_timeout) as u64;
    let end = clock.last + Duration::from_millis(idle + 1);
    ipv4.tick(end);
    ipv6.tick(end);
    feed_datagrams(&datagrams, &mut tcp, end);
    tcp.tick(end);

    let report = Report {
        nb_frames,
        nb_skipped,
        ipv4: SessionReport {
            events: ipv4_counts.lock().unwrap().clone(),
            stats: ipv4.stats().clone(),
        },
        ipv6: SessionReport {
            events: ipv6_counts.lock().unwrap().clone(),
            stats: ipv6.stats().clone(),
        },
        tcp: SessionReport {
            events: tcp_counts.lock().unwrap().clone(),
            stats: tcp.stats().clone(),
        },
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    ipv4.free();
    ipv6.free();
    tcp.free();
    Ok(())
}

/// The sessions a frame may be handed to.
struct Sessions<'a> {
    ipv4: &'a mut Ipv4Session,
    ipv6: &'a mut Ipv6Session,
    tcp: &'a mut TcpSession,
    datagrams: &'a Datagrams,
}

impl<'a> Sessions<'a> {
    /// Feeds one Ethernet frame to the sessions. Returns `false` if the frame was not IP
    /// carrying a fragment or a TCP segment.
    fn process_frame(&mut self, data: &[u8], now: Instant) -> bool {
        let eth = match EthernetPacket::new(data) {
            Some(eth) => eth,
            None => return false,
        };
        match eth.get_ethertype() {
            EtherTypes::Ipv4 => self.process_ipv4(eth.payload(), now),
            EtherTypes::Ipv6 => self.process_ipv6(eth.payload(), now),
            _ => false,
        }
    }

    fn process_ipv4(&mut self, data: &[u8], now: Instant) -> bool {
        let ip = match Ipv4Packet::new(data) {
            Some(ip) => ip,
            None => return false,
        };

        let flags_offset = (ip.get_flags() as u16) << 13 | ip.get_fragment_offset();
        if is_fragment(flags_offset) {
            let key = Ipv4Key::from_header(
                ip.get_source(),
                ip.get_destination(),
                ip.get_next_level_protocol().0,
                ip.get_identification(),
            );
            match Ipv4Fragment::from_header_field(flags_offset, ip.payload()) {
                Ok(fragment) => {
                    if let Err(err) = self.ipv4.add_fragment(&key, fragment, now) {
                        log::debug!("{}: {}", key, err);
                    }
                }
                Err(err) => log::debug!("{}: {}", key, err),
            }
            feed_datagrams(self.datagrams, self.tcp, now);
            true
        } else if ip.get_next_level_protocol() == IpNextHeaderProtocols::Tcp {
            let (src, dst) = (IpAddr::V4(ip.get_source()), IpAddr::V4(ip.get_destination()));
            feed_segment(self.tcp, src, dst, ip.payload(), now)
        } else {
            false
        }
    }

    /// Only a fragment header directly after the fixed header is recognized.
    fn process_ipv6(&mut self, data: &[u8], now: Instant) -> bool {
        let ip = match Ipv6Packet::new(data) {
            Some(ip) => ip,
            None => return false,
        };
        let (src, dst) = (ip.get_source(), ip.get_destination());

        match ip.get_next_header() {
            IpNextHeaderProtocols::Ipv6Frag => {
                let header = match FragmentPacket::new(ip.payload()) {
                    Some(header) => header,
                    None => return false,
                };
                let key = Ipv6Key::from_header(
                    src,
                    dst,
                    header.get_next_header().0,
                    header.get_id(),
                );
                let offset_flags = header.get_fragment_offset_with_flags();
                match Ipv6Fragment::from_header_field(offset_flags, header.payload()) {
                    Ok(fragment) => {
                        if let Err(err) = self.ipv6.add_fragment(&key, fragment, now) {
                            log::debug!("{}: {}", key, err);
                        }
                    }
                    // atomic fragment, carries a whole packet
                    Err(_) if header.get_next_header() == IpNextHeaderProtocols::Tcp => {
                        let (src, dst) = (IpAddr::V6(src), IpAddr::V6(dst));
                        return feed_segment(self.tcp, src, dst, header.payload(), now);
                    }
                    Err(err) => log::debug!("{}: {}", key, err),
                }
                feed_datagrams(self.datagrams, self.tcp, now);
                true
            }
            IpNextHeaderProtocols::Tcp => {
                let (src, dst) = (IpAddr::V6(src), IpAddr::V6(dst));
                feed_segment(self.tcp, src, dst, ip.payload(), now)
            }
            _ => false,
        }
    }
}

/// Hands reassembled TCP datagrams to the TCP session.
fn feed_datagrams(datagrams: &Datagrams, tcp: &mut TcpSession, now: Instant) {
    let ready: Vec<_> = datagrams.lock().unwrap().drain(..).collect();
    for (src, dst, payload) in ready {
        feed_segment(tcp, src, dst, &payload, now);
    }
}

fn feed_segment(
    tcp: &mut TcpSession,
    src: IpAddr,
    dst: IpAddr,
    data: &[u8],
    now: Instant,
) -> bool {
    let segment = match TcpPacket::new(data) {
        Some(segment) => segment,
        None => return false,
    };
    let key = TcpKey::new(
        SocketAddr::new(src, segment.get_source()),
        SocketAddr::new(dst, segment.get_destination()),
    );
    let pdu = TcpSegment::new(
        segment.get_sequence(),
        segment.get_flags() as u8,
        segment.payload(),
    );
    if let Err(err) = tcp.add_segment(&key, pdu, now) {
        log::debug!("{}: {}", key, err);
    }
    true
}

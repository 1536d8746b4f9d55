//! Configuration options.
//!
//! Each session is created from a protocol-specific configuration that bounds its flow table,
//! selects how overlapping data is resolved, and limits per-flow resource usage. Options can be
//! built in code, taken from [default_config], or loaded from a TOML file with [load_config].
//! See the `configs/` directory at the repository root for examples.

use crate::error::FlowError;

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Loads a configuration file from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RuntimeConfig> {
    let path = path.as_ref();
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: RuntimeConfig = toml::from_str(&config_str)
        .with_context(|| format!("Invalid config file {}", path.display()))?;

    // error check config
    if let Err(err) = config.ipv4.validate() {
        log::error!("Invalid IPv4 options: {:#?}", config.ipv4);
        return Err(err).context("Invalid [ipv4] section");
    }
    if let Err(err) = config.ipv6.validate() {
        log::error!("Invalid IPv6 options: {:#?}", config.ipv6);
        return Err(err).context("Invalid [ipv6] section");
    }
    if let Err(err) = config.tcp.validate() {
        log::error!("Invalid TCP options: {:#?}", config.tcp);
        return Err(err).context("Invalid [tcp] section");
    }
    Ok(config)
}

/// Loads a default configuration.
///
/// ```toml
/// [ipv4]
///     max_flows = 1024
///
/// [ipv6]
///     max_flows = 1024
///
/// [tcp]
///     max_flows = 4096
/// ```
pub fn default_config() -> RuntimeConfig {
    RuntimeConfig::default()
}

/* --------------------------------------------------------------------------------- */

/// Options for every reassembly session.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// IPv4 defragmentation settings.
    #[serde(default)]
    pub ipv4: Ipv4Config,

    /// IPv6 defragmentation settings.
    #[serde(default)]
    pub ipv6: Ipv6Config,

    /// TCP stream reassembly settings.
    #[serde(default)]
    pub tcp: TcpConfig,
}

/* --------------------------------------------------------------------------------- */

/// Resolution rule for bytes claimed by more than one fragment or segment.
///
/// End hosts disagree on which copy of overlapping data wins, so an inspecting engine must be
/// able to reproduce the behavior of the host it protects.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Bytes already buffered are kept; only the non-overlapping part of new data is merged.
    FirstWins,
    /// New bytes replace the overlapping part of buffered data.
    LastWins,
    /// Any overlap is an anomaly: the new data is discarded and reported.
    Reject,
}

/// Behavior of a full flow table when a new flow is requested.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FullPolicy {
    /// Fail with [FlowError::SessionFull].
    Reject,
    /// Evict the least-recently-active flow, then insert.
    Evict,
}

/// Options common to every flow table.
pub trait TableConfig: Clone + std::fmt::Debug {
    /// Number of flows to pre-allocate table space for.
    fn min_flows(&self) -> usize;

    /// Maximum number of concurrently tracked flows.
    fn max_flows(&self) -> usize;

    /// What to do when a new flow is requested at capacity.
    fn on_full(&self) -> FullPolicy;

    /// How overlapping data is resolved.
    fn overlap(&self) -> OverlapPolicy;

    /// Maximum number of bytes buffered across all flows of the session.
    fn max_memory(&self) -> usize;

    /// Width of one timer bucket.
    fn timeout_resolution(&self) -> Duration;

    /// Longest inactivity window any flow can be given.
    fn max_inactivity_window(&self) -> Duration;

    /// Overrides the table bounds.
    fn set_bounds(&mut self, min_flows: usize, max_flows: usize);

    /// Checks protocol-specific limits.
    fn validate_limits(&self) -> Result<(), FlowError>;

    /// Returns `Ok` if the options describe a usable table.
    fn validate(&self) -> Result<(), FlowError> {
        if self.max_flows() == 0 || self.min_flows() > self.max_flows() {
            return Err(FlowError::InvalidArgument);
        }
        if self.max_memory() == 0 || self.timeout_resolution().is_zero() {
            return Err(FlowError::InvalidArgument);
        }
        self.validate_limits()
    }
}

/* --------------------------------------------------------------------------------- */

/// IPv4 defragmentation options.
pub type Ipv4Config = FragmentConfig;

/// IPv6 defragmentation options.
pub type Ipv6Config = FragmentConfig;

/// Defragmentation options, shared by the `[ipv4]` and `[ipv6]` sections.
///
/// ## Example
/// ```toml
/// [ipv4]
///     max_flows = 1024
///     inactivity_timeout = 15_000
///     on_full = "evict"
///     overlap = "first_wins"
///     max_fragments = 64
///
/// [ipv6]
///     min_fragment_size = 1280
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct FragmentConfig {
    /// Number of fragment groups to reserve table space for up front. Defaults to `0`.
    #[serde(default = "default_min_flows")]
    pub min_flows: usize,

    /// Maximum number of datagrams reassembled at once. Defaults to `1024`.
    #[serde(default = "default_fragment_max_flows")]
    pub max_flows: usize,

    /// Time (in milliseconds) after which an incomplete datagram is discarded. Defaults to
    /// `15_000`.
    #[serde(default = "default_fragment_inactivity_timeout")]
    pub inactivity_timeout: usize,

    /// Granularity (in milliseconds) of the expiry timers. Defaults to `1000`.
    #[serde(default = "default_timeout_resolution")]
    pub timeout_resolution: usize,

    /// Full-table behavior. Defaults to `reject`.
    #[serde(default = "default_on_full")]
    pub on_full: FullPolicy,

    /// Overlapping fragment resolution. Defaults to `first_wins`.
    #[serde(default = "default_overlap")]
    pub overlap: OverlapPolicy,

    /// Largest datagram payload offset + length accepted from any single fragment. Defaults to
    /// `65_535`.
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,

    /// Maximum number of bytes buffered for one datagram. Defaults to `65_535`.
    #[serde(default = "default_max_datagram_size")]
    pub max_reassembled_size: usize,

    /// Maximum number of fragments accepted for one datagram. Defaults to `64`.
    #[serde(default = "default_max_fragments")]
    pub max_fragments: usize,

    /// Maximum number of payload bytes buffered across all datagrams. Defaults to `12_582_912`
    /// (12 MiB).
    ///
    /// ## Remarks
    /// A fragment that would exceed the budget either evicts the least-recently-active
    /// datagrams or is refused with [FlowError::SessionFull], following `on_full`.
    #[serde(default = "default_fragment_max_memory")]
    pub max_memory: usize,

    /// Minimum payload length of a non-final fragment, or `0` to accept any length. Defaults to
    /// `0`.
    ///
    /// ## Remarks
    /// Hosts rarely emit non-final fragments shorter than the minimum MTU (`576` for IPv4,
    /// `1280` for IPv6), so setting this rejects hand-crafted tiny fragments.
    #[serde(default = "default_min_fragment_size")]
    pub min_fragment_size: usize,
}

impl FragmentConfig {
    pub(crate) fn inactivity_window(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout as u64)
    }
}

impl Default for FragmentConfig {
    fn default() -> Self {
        FragmentConfig {
            min_flows: default_min_flows(),
            max_flows: default_fragment_max_flows(),
            inactivity_timeout: default_fragment_inactivity_timeout(),
            timeout_resolution: default_timeout_resolution(),
            on_full: default_on_full(),
            overlap: default_overlap(),
            max_datagram_size: default_max_datagram_size(),
            max_reassembled_size: default_max_datagram_size(),
            max_fragments: default_max_fragments(),
            max_memory: default_fragment_max_memory(),
            min_fragment_size: default_min_fragment_size(),
        }
    }
}

impl TableConfig for FragmentConfig {
    fn min_flows(&self) -> usize {
        self.min_flows
    }

    fn max_flows(&self) -> usize {
        self.max_flows
    }

    fn on_full(&self) -> FullPolicy {
        self.on_full
    }

    fn overlap(&self) -> OverlapPolicy {
        self.overlap
    }

    fn max_memory(&self) -> usize {
        self.max_memory
    }

    fn timeout_resolution(&self) -> Duration {
        Duration::from_millis(self.timeout_resolution as u64)
    }

    fn max_inactivity_window(&self) -> Duration {
        self.inactivity_window()
    }

    fn set_bounds(&mut self, min_flows: usize, max_flows: usize) {
        self.min_flows = min_flows;
        self.max_flows = max_flows;
    }

    fn validate_limits(&self) -> Result<(), FlowError> {
        if self.max_datagram_size == 0 || self.max_reassembled_size == 0 || self.max_fragments == 0
        {
            return Err(FlowError::InvalidArgument);
        }
        Ok(())
    }
}

fn default_min_flows() -> usize {
    0
}

fn default_fragment_max_flows() -> usize {
    1024
}

fn default_fragment_inactivity_timeout() -> usize {
    15_000
}

fn default_timeout_resolution() -> usize {
    1000
}

fn default_on_full() -> FullPolicy {
    FullPolicy::Reject
}

fn default_overlap() -> OverlapPolicy {
    OverlapPolicy::FirstWins
}

fn default_max_datagram_size() -> usize {
    65_535
}

fn default_max_fragments() -> usize {
    64
}

fn default_fragment_max_memory() -> usize {
    12 * 1024 * 1024
}

fn default_min_fragment_size() -> usize {
    0
}

/* --------------------------------------------------------------------------------- */

/// TCP stream reassembly options.
///
/// ## Example
/// ```toml
/// [tcp]
///     max_flows = 4096
///     inactivity_timeout = 60_000
///     establish_timeout = 5000
///     max_out_of_order = 100
///     bidirectional = true
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TcpConfig {
    /// Number of connections to reserve table space for up front. Defaults to `0`.
    #[serde(default = "default_min_flows")]
    pub min_flows: usize,

    /// Maximum number of connections tracked at once. Defaults to `4096`.
    #[serde(default = "default_tcp_max_flows")]
    pub max_flows: usize,

    /// Time (in milliseconds) to expire inactive established connections. Defaults to `60_000`.
    #[serde(default = "default_tcp_inactivity_timeout")]
    pub inactivity_timeout: usize,

    /// Time (in milliseconds) to expire connections that never got past the SYN. Defaults to
    /// `5000`.
    #[serde(default = "default_tcp_establish_timeout")]
    pub establish_timeout: usize,

    /// Granularity (in milliseconds) of the expiry timers. Defaults to `1000`.
    #[serde(default = "default_timeout_resolution")]
    pub timeout_resolution: usize,

    /// Full-table behavior. Defaults to `reject`.
    #[serde(default = "default_on_full")]
    pub on_full: FullPolicy,

    /// Overlapping segment resolution. Defaults to `first_wins`.
    #[serde(default = "default_overlap")]
    pub overlap: OverlapPolicy,

    /// Maximum number of disjoint out-of-order ranges buffered per direction before the
    /// connection is discarded. Defaults to `100`.
    #[serde(default = "default_max_out_of_order")]
    pub max_out_of_order: usize,

    /// Maximum span of undelivered stream bytes per direction, holes included. Defaults to
    /// `1_048_576`.
    #[serde(default = "default_max_buffered")]
    pub max_buffered: usize,

    /// Maximum number of undelivered bytes buffered across all connections. Defaults to
    /// `67_108_864` (64 MiB).
    ///
    /// ## Remarks
    /// A segment that would exceed the budget either evicts the least-recently-active
    /// connections or is refused with [FlowError::SessionFull], following `on_full`.
    #[serde(default = "default_tcp_max_memory")]
    pub max_memory: usize,

    /// Start tracking connections whose SYN was not observed. Defaults to `false`.
    #[serde(default = "default_allow_midstream")]
    pub allow_midstream: bool,

    /// Track both directions of a connection in one flow. Defaults to `false`.
    ///
    /// ## Remarks
    /// When set, keys are normalized with [TcpKey::canonical](crate::TcpKey::canonical) before
    /// lookup, so the forward and reverse legs share one flow and one callback.
    #[serde(default = "default_bidirectional")]
    pub bidirectional: bool,
}

impl TcpConfig {
    pub(crate) fn inactivity_window(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout as u64)
    }

    pub(crate) fn establish_window(&self) -> Duration {
        Duration::from_millis(self.establish_timeout as u64)
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            min_flows: default_min_flows(),
            max_flows: default_tcp_max_flows(),
            inactivity_timeout: default_tcp_inactivity_timeout(),
            establish_timeout: default_tcp_establish_timeout(),
            timeout_resolution: default_timeout_resolution(),
            on_full: default_on_full(),
            overlap: default_overlap(),
            max_out_of_order: default_max_out_of_order(),
            max_buffered: default_max_buffered(),
            max_memory: default_tcp_max_memory(),
            allow_midstream: default_allow_midstream(),
            bidirectional: default_bidirectional(),
        }
    }
}

impl TableConfig for TcpConfig {
    fn min_flows(&self) -> usize {
        self.min_flows
    }

    fn max_flows(&self) -> usize {
        self.max_flows
    }

    fn on_full(&self) -> FullPolicy {
        self.on_full
    }

    fn overlap(&self) -> OverlapPolicy {
        self.overlap
    }

    fn max_memory(&self) -> usize {
        self.max_memory
    }

    fn timeout_resolution(&self) -> Duration {
        Duration::from_millis(self.timeout_resolution as u64)
    }

    fn max_inactivity_window(&self) -> Duration {
        self.inactivity_window().max(self.establish_window())
    }

    fn set_bounds(&mut self, min_flows: usize, max_flows: usize) {
        self.min_flows = min_flows;
        self.max_flows = max_flows;
    }

    fn validate_limits(&self) -> Result<(), FlowError> {
        if self.max_out_of_order == 0 || self.max_buffered == 0 {
            return Err(FlowError::InvalidArgument);
        }
        Ok(())
    }
}

fn default_tcp_max_flows() -> usize {
    4096
}

fn default_tcp_inactivity_timeout() -> usize {
    60_000
}

fn default_tcp_establish_timeout() -> usize {
    5000
}

fn default_max_out_of_order() -> usize {
    100
}

fn default_max_buffered() -> usize {
    1_048_576
}

fn default_tcp_max_memory() -> usize {
    64 * 1024 * 1024
}

fn default_allow_midstream() -> bool {
    false
}

fn default_bidirectional() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_config_partial_toml_uses_defaults() {
        let config: RuntimeConfig = toml::from_str(
            r#"
            [ipv4]
                max_flows = 8
                on_full = "evict"
                overlap = "last_wins"

            [tcp]
                bidirectional = true
            "#,
        )
        .unwrap();
        assert_eq!(config.ipv4.max_flows, 8);
        assert_eq!(config.ipv4.on_full, FullPolicy::Evict);
        assert_eq!(config.ipv4.overlap, OverlapPolicy::LastWins);
        assert_eq!(config.ipv4.max_fragments, 64);
        assert_eq!(config.tcp.max_flows, 4096);
        assert!(config.tcp.bidirectional);
        assert_eq!(config.tcp.on_full, FullPolicy::Reject);
    }

    #[test]
    fn core_config_empty_toml() {
        let config: RuntimeConfig = toml::from_str("").unwrap();
        assert_eq!(config.ipv4.inactivity_timeout, 15_000);
        assert_eq!(config.ipv6.inactivity_timeout, 15_000);
        assert_eq!(config.tcp.max_memory, 64 * 1024 * 1024);
        assert_eq!(config.tcp.establish_timeout, 5000);
    }

    #[test]
    fn core_config_validate_bounds() {
        let mut config = Ipv4Config::default();
        assert!(config.validate().is_ok());
        config.set_bounds(0, 0);
        assert_eq!(config.validate(), Err(FlowError::InvalidArgument));
        config.set_bounds(10, 5);
        assert_eq!(config.validate(), Err(FlowError::InvalidArgument));
        config.set_bounds(5, 5);
        assert!(config.validate().is_ok());

        let mut tcp = TcpConfig::default();
        tcp.max_out_of_order = 0;
        assert_eq!(tcp.validate(), Err(FlowError::InvalidArgument));

        let no_budget = Ipv6Config {
            max_memory: 0,
            ..Ipv6Config::default()
        };
        assert_eq!(no_budget.validate(), Err(FlowError::InvalidArgument));
        let no_resolution = TcpConfig {
            timeout_resolution: 0,
            ..TcpConfig::default()
        };
        assert_eq!(no_resolution.validate(), Err(FlowError::InvalidArgument));
    }

    #[test]
    fn core_config_max_inactivity_window() {
        let tcp = TcpConfig {
            inactivity_timeout: 1000,
            establish_timeout: 5000,
            ..TcpConfig::default()
        };
        assert_eq!(tcp.max_inactivity_window(), Duration::from_millis(5000));
        assert_eq!(
            Ipv4Config::default().max_inactivity_window(),
            Duration::from_millis(15_000)
        );
    }

    #[test]
    fn core_config_load_samples() {
        let dir = concat!(env!("CARGO_MANIFEST_DIR"), "/../configs");
        let config = load_config(format!("{}/default.toml", dir)).unwrap();
        assert_eq!(config.ipv4.max_flows, 1024);
        assert_eq!(config.tcp.max_buffered, 1_048_576);

        assert_eq!(config.ipv6.max_memory, 12 * 1024 * 1024);

        let config = load_config(format!("{}/ids.toml", dir)).unwrap();
        assert_eq!(config.ipv4.min_fragment_size, 576);
        assert_eq!(config.ipv6.min_fragment_size, 1280);
        assert_eq!(config.tcp.overlap, OverlapPolicy::Reject);
        assert!(config.tcp.allow_midstream);
        assert_eq!(config.tcp.inactivity_timeout, 60_000);
    }

    #[test]
    fn core_config_load_missing_file() {
        assert!(load_config("/nonexistent/reflow.toml").is_err());
    }
}

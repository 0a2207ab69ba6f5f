use std::env;
use std::time::Duration;
use anyhow::{bail, Context};
use tracing::level_filters::LevelFilter;

pub const ENV_LOGGING: &str = "GO_UTP_LOGGING";
pub const ENV_PACKET_DROP: &str = "GO_UTP_PACKET_DROP";

/// The smallest MTU a path is assumed to support. It leaves room for IPv6 and UDP headers
///  inside the 1280 bytes IPv6 guarantees.
pub const MIN_MTU: usize = 1232;

pub struct UtpConfig {
    /// Size of the largest datagram this end point sends. uTP does not do path MTU discovery,
    ///  so this must be supported by every route between peers.
    pub mtu: usize,

    /// Room reserved for the fixed header plus extensions. The payload of a DATA packet is
    ///  `mtu - max_header_size`.
    pub max_header_size: usize,

    /// Bytes of received data a connection buffers before the advertised window drops to 0
    pub recv_window: u32,

    /// Size of the buffer the dispatcher reads datagrams into. Longer datagrams are truncated
    ///  by the OS.
    pub max_recv_size: usize,

    /// Number of SYNs waiting to be accepted. When it is exceeded, a random entry is evicted
    ///  and reset.
    pub backlog: usize,

    /// Out-of-order packets a connection holds ahead of its cumulative ack
    pub max_unacked_inbound: usize,

    /// Outstanding packets a connection may have before writes block
    pub max_unacked_outbound: usize,

    /// A connection is destroyed if an outstanding packet stays unacked for this long
    pub send_timeout: Duration,

    pub initial_rto: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,

    /// LEDBAT's queuing delay target
    pub target_delay: Duration,
    /// LEDBAT's window gain per ack, in bytes, at full `target_delay` offset
    pub gain: f64,

    /// How long a one-way delay sample takes part in the base delay minimum
    pub base_delay_retention: Duration,

    /// Depth of each connection's inbox. The dispatcher drops packets for a connection whose
    ///  inbox is full rather than block all other connections.
    pub inbound_queue_depth: usize,

    /// Number of non-uTP datagrams buffered for `recv_from_out_of_band`. Overflow is dropped.
    pub out_of_band_queue_depth: usize,

    /// Numbers of selective acks skipping over a packet that trigger an immediate resend
    pub fast_resend_thresholds: Vec<u32>,

    /// Number of duplicate acks that trigger a fast retransmit of the oldest outstanding packet
    pub duplicate_ack_threshold: u32,

    /// STATE packets are coalesced: after a packet arrives, the connection waits this long for
    ///  further packets before acknowledging all of them with a single STATE.
    pub state_coalesce_delay: Duration,

    /// If set, an idle connection sends a STATE packet at this interval
    pub keepalive_interval: Option<Duration>,

    /// Probability for silently discarding an outgoing packet. This is for testing
    ///  retransmission and should be 0 in production.
    pub packet_drop_probability: f64,

    /// Upper bound on random draws when allocating a connection id. Dialing fails with
    ///  `ConnectionExhausted` after that.
    pub max_conn_id_attempts: usize,
}

impl Default for UtpConfig {
    fn default() -> Self {
        UtpConfig {
            mtu: MIN_MTU,
            max_header_size: 30,
            recv_window: 0x8000,
            max_recv_size: 0x2000,
            backlog: 50,
            max_unacked_inbound: 64,
            max_unacked_outbound: 64,
            send_timeout: Duration::from_secs(15),
            initial_rto: Duration::from_secs(1),
            min_rto: Duration::from_millis(60),
            max_rto: Duration::from_millis(1000),
            target_delay: Duration::from_millis(100),
            gain: 3000.0,
            base_delay_retention: Duration::from_secs(120),
            inbound_queue_depth: 100,
            out_of_band_queue_depth: 100,
            fast_resend_thresholds: vec![3, 60],
            duplicate_ack_threshold: 3,
            state_coalesce_delay: Duration::from_micros(500),
            keepalive_interval: None,
            packet_drop_probability: 0.0,
            max_conn_id_attempts: 0x10000,
        }
    }
}

impl UtpConfig {
    /// defaults, with test aids taken from the environment
    pub fn from_env() -> anyhow::Result<UtpConfig> {
        let mut result = UtpConfig::default();
        if let Ok(raw) = env::var(ENV_PACKET_DROP) {
            result.packet_drop_probability = parse_drop_probability(&raw)?;
        }
        result.validate()?;
        Ok(result)
    }

    pub fn max_payload_size(&self) -> usize {
        self.mtu - self.max_header_size
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu < MIN_MTU {
            bail!("MTU must be at least {}", MIN_MTU);
        }
        if self.max_header_size < 20 + 2 + 8 {
            bail!("header size must leave room for the fixed header and a selective ack");
        }
        if self.max_recv_size < self.mtu {
            bail!("receive buffer size must cover the MTU");
        }
        if self.backlog == 0 {
            bail!("backlog must not be empty");
        }
        if self.max_unacked_inbound == 0 || self.max_unacked_inbound > 0x8000 {
            bail!("inbound window must be between 1 and 32768 packets");
        }
        if self.max_unacked_outbound == 0 || self.max_unacked_outbound > 0x4000 {
            bail!("outbound window must be between 1 and 16384 packets");
        }
        if self.min_rto > self.max_rto {
            bail!("minimum RTO must not exceed maximum RTO");
        }
        if self.target_delay.is_zero() {
            bail!("target delay must be positive");
        }
        if self.base_delay_retention < Duration::from_secs(30) || self.base_delay_retention > Duration::from_secs(600) {
            bail!("base delay retention must be between 30 seconds and 10 minutes");
        }
        if self.inbound_queue_depth == 0 || self.out_of_band_queue_depth == 0 {
            bail!("queue depths must be positive");
        }
        if self.state_coalesce_delay > Duration::from_micros(500) {
            bail!("STATE coalescing delay must not exceed 500 microseconds");
        }
        if !(0.0..=1.0).contains(&self.packet_drop_probability) {
            bail!("packet drop probability must be between 0 and 1");
        }
        if self.max_conn_id_attempts == 0 {
            bail!("at least one connection id attempt is required");
        }
        Ok(())
    }
}

fn parse_drop_probability(raw: &str) -> anyhow::Result<f64> {
    let value: f64 = raw.trim().parse()
        .with_context(|| format!("{} is not a number: {:?}", ENV_PACKET_DROP, raw))?;
    if !(0.0..=1.0).contains(&value) {
        bail!("{} must be between 0 and 1, was {}", ENV_PACKET_DROP, value);
    }
    Ok(value)
}

/// The log verbosity requested through the environment, for installing a subscriber
pub fn log_level_from_env() -> LevelFilter {
    parse_log_level(env::var(ENV_LOGGING).ok().as_deref())
}

fn parse_log_level(raw: Option<&str>) -> LevelFilter {
    match raw.and_then(|s| s.trim().parse::<u32>().ok()) {
        None => LevelFilter::WARN,
        Some(0) => LevelFilter::OFF,
        Some(1) => LevelFilter::ERROR,
        Some(2) => LevelFilter::WARN,
        Some(3) => LevelFilter::INFO,
        Some(4) => LevelFilter::DEBUG,
        Some(_) => LevelFilter::TRACE,
    }
}

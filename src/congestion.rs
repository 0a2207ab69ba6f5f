//! Round trip estimation and LEDBAT (RFC 6817) congestion control.
//!
//! LEDBAT measures one-way delay and compares it against the smallest delay seen recently (the
//!  'base delay'). Delay above the base delay is attributed to queuing; the window grows while
//!  queuing delay stays below a target and shrinks when it exceeds it. Background transfers
//!  therefore back off as soon as they start filling router queues.

use std::time::Duration;
use tracing::{debug, instrument, trace};

/// Smoothed round trip time and retransmission timeout, RFC 6298 style
#[derive(Debug)]
pub struct RttEstimator {
    rtt: Option<Duration>,
    rtt_var: Duration,
    rto: Duration,
    min_rto: Duration,
    max_rto: Duration,
}

impl RttEstimator {
    pub fn new(initial_rto: Duration, min_rto: Duration, max_rto: Duration) -> RttEstimator {
        RttEstimator {
            rtt: None,
            rtt_var: Duration::ZERO,
            rto: initial_rto,
            min_rto,
            max_rto,
        }
    }

    pub fn rtt(&self) -> Duration {
        self.rtt.unwrap_or(Duration::ZERO)
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn on_sample(&mut self, latency: Duration) {
        let rtt = match self.rtt {
            None => {
                self.rtt_var = latency / 2;
                latency
            }
            Some(rtt) => {
                let delta = rtt.abs_diff(latency);
                if delta >= self.rtt_var {
                    self.rtt_var += (delta - self.rtt_var) / 4;
                }
                else {
                    self.rtt_var -= (self.rtt_var - delta) / 4;
                }
                rtt * 7 / 8 + latency / 8
            }
        };
        self.rtt = Some(rtt);
        self.rto = (rtt + self.rtt_var * 4).clamp(self.min_rto, self.max_rto);
        trace!("rtt sample {:?} -> rtt {:?}, rttvar {:?}, rto {:?}", latency, rtt, self.rtt_var, self.rto);
    }
}

/// LEDBAT's congestion window in bytes
#[derive(Debug)]
pub struct LedbatController {
    max_window: f64,
    mtu: f64,
    target_micros: f64,
    gain: f64,
}

impl LedbatController {
    pub fn new(mtu: usize, target: Duration, gain: f64) -> LedbatController {
        LedbatController {
            max_window: mtu as f64,
            mtu: mtu as f64,
            target_micros: target.as_micros() as f64,
            gain,
        }
    }

    pub fn max_window(&self) -> u32 {
        self.max_window.min(u32::MAX as f64) as u32
    }

    /// Adjusts the window for a packet that acknowledged new data. `delay` is the current
    ///  one-way delay sample, `base_delay` the minimum over the retention window (both in µs).
    #[instrument(level = "trace")]
    pub fn on_ack(&mut self, delay: u32, base_delay: u32) {
        let our_delay = delay as f64 - base_delay as f64;
        let off_target = self.target_micros - our_delay;
        let gain = self.gain * (off_target / self.target_micros) * (self.mtu / self.max_window);
        self.max_window = (self.max_window + gain).max(self.mtu);
        trace!("queuing delay {}µs -> max window {}", our_delay, self.max_window);
    }

    /// packet loss: halve the window, but never below one packet
    pub fn on_loss(&mut self) {
        self.max_window = (self.max_window / 2.0).max(self.mtu);
        debug!("packet loss -> max window {}", self.max_window);
    }

    #[cfg(test)]
    pub fn set_max_window(&mut self, max_window: f64) {
        self.max_window = max_window;
    }
}

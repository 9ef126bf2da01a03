//! Traffic shaping math — constant packet rate and heartbeat cadence.
//!
//! CPR sends one full-MTU datagram every `cpr_cycle`, so the wire carries a
//! fixed `rate * 1024` bytes per second whether or not real traffic exists;
//! heartbeats fill the gaps and padding makes every datagram the same size.

use std::time::Duration;

use crate::wire::TIMEOUT_HEARTBEAT;

/// Inter-datagram period for a target rate in KiB/s.
///
///   cpr_cycle = 1 s / (rate * 1024 / MTU)
///
/// A zero rate disables shaping.
pub fn cpr_cycle(rate_kibps: u32, mtu: usize) -> Duration {
    if rate_kibps == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(mtu as f64 / (rate_kibps as f64 * 1024.0))
}

/// How often the TAP multiplexer injects an empty heartbeat frame.
///
/// Under CPR the heartbeat fills the exact send cadence; otherwise four
/// heartbeats fit into one nominal timeout.
pub fn heartbeat_period(timeout: Duration, cpr_kibps: u32, mtu: usize) -> Duration {
    if cpr_kibps > 0 {
        cpr_cycle(cpr_kibps, mtu)
    } else {
        timeout / TIMEOUT_HEARTBEAT
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

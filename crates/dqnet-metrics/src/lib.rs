//! Metrics and tracing facade for dqnet.
//!
//! The helpers here emit both metrics (via the `metrics` crate) and lightweight tracing events.
//! Without an installed recorder the metric calls are no-ops.

use metrics::{counter, gauge};
use tracing::trace;

/// Count a packet received on one of a solver's interfaces.
pub fn record_packet_received(solver: &str, kind: &'static str) {
    counter!("dqnet.packets.received", "solver" => solver.to_string(), "kind" => kind)
        .increment(1);
    trace!(solver, kind, "packet received");
}

/// Count a packet handed to a link for delivery.
pub fn record_packet_sent(solver: &str, kind: &'static str) {
    counter!("dqnet.packets.sent", "solver" => solver.to_string(), "kind" => kind).increment(1);
    trace!(solver, kind, "packet sent");
}

/// Count FIB changes (`installed` or `replaced`).
pub fn record_route_update(solver: &str, change: &'static str) {
    counter!("dqnet.route.updates", "solver" => solver.to_string(), "change" => change)
        .increment(1);
    trace!(solver, change, "route update recorded");
}

/// Count route announcements skipped because the peer's queue was full.
pub fn record_announce_dropped(solver: &str, dropped: u64) {
    if dropped == 0 {
        return;
    }
    counter!("dqnet.route.announce_dropped", "solver" => solver.to_string()).increment(dropped);
    trace!(solver, dropped, "route announcements dropped");
}

/// Track the number of in-flight entries in a solver's pending request table.
pub fn record_pending_requests(solver: &str, depth: usize) {
    gauge!("dqnet.prt.depth", "solver" => solver.to_string()).set(depth as f64);
    trace!(solver, depth, "pending request depth recorded");
}

/// Count queries recorded without a route; they stall until answered.
pub fn record_query_unrouted(solver: &str) {
    counter!("dqnet.query.unrouted", "solver" => solver.to_string()).increment(1);
    trace!(solver, "unrouted query recorded");
}

/// Count responses dropped because no pending request matched them.
pub fn record_answer_unmatched(solver: &str) {
    counter!("dqnet.answer.unmatched", "solver" => solver.to_string()).increment(1);
    trace!(solver, "unmatched answer recorded");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_without_recorder() {
        record_packet_received("s1", "request");
        record_packet_sent("s1", "response");
        record_route_update("s1", "installed");
        record_announce_dropped("s1", 0);
        record_announce_dropped("s1", 2);
        record_pending_requests("s1", 3);
        record_query_unrouted("s1");
        record_answer_unmatched("s1");
    }
}

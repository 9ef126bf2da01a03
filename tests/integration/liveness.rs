//! Heartbeat and timeout behaviour of an otherwise idle tunnel.

use std::time::Duration;

use burrowd::transport::LoopExit;
use tokio::sync::broadcast;

use crate::*;

#[tokio::test]
async fn heartbeats_keep_a_quiet_tunnel_alive() {
    let (sa, sb) = socket_pair().await;
    let (shutdown, _) = broadcast::channel(1);
    // timeout 2 s → heartbeats roughly every 500 ms on both sides
    let mut a = spawn_node(sa, shared_key(), true, Duration::from_secs(2), &shutdown);
    let mut b = spawn_node(sb, shared_key(), false, Duration::from_secs(2), &shutdown);

    // No TAP traffic at all; the tunnel must outlive its own timeout.
    tokio::time::sleep(Duration::from_millis(2600)).await;

    // Heartbeats never surface as TAP writes.
    assert!(a.tap_out.try_recv().is_err());
    assert!(b.tap_out.try_recv().is_err());

    shutdown.send(()).unwrap();
    let (exit_a, stats_a) = a.finish().await;
    let (exit_b, stats_b) = b.finish().await;

    assert_eq!(exit_a, LoopExit::Terminated, "A must not have timed out");
    assert_eq!(exit_b, LoopExit::Terminated, "B must not have timed out");
    assert!(stats_a.heartbeat_sent >= 2, "A sent {}", stats_a.heartbeat_sent);
    assert!(stats_b.heartbeat_sent >= 2, "B sent {}", stats_b.heartbeat_sent);
    assert!(stats_a.heartbeat_recv >= 2, "A got {}", stats_a.heartbeat_recv);
    assert!(stats_b.heartbeat_recv >= 2, "B got {}", stats_b.heartbeat_recv);
}

#[tokio::test]
async fn a_silent_remote_times_the_peer_out() {
    let (sa, _sb) = socket_pair().await;
    let (shutdown, _keep) = broadcast::channel(1);
    let a = spawn_node(sa, shared_key(), true, Duration::from_secs(2), &shutdown);

    // _sb exists but nobody answers on it.
    let started = std::time::Instant::now();
    let (exit, stats) = a.finish().await;

    assert_eq!(exit, LoopExit::Timeout);
    assert!(
        started.elapsed() >= Duration::from_millis(1500),
        "timed out too early: {:?}",
        started.elapsed()
    );
    assert!(stats.heartbeat_sent >= 1, "kept sending into the void");
    assert_eq!(stats.frames_in, 0);
    assert_eq!(stats.heartbeat_recv, 0);
}

//! End-to-end tunnel scenarios: frames in, ciphertext across, frames out.

use std::time::Duration;

use burrow_core::wire;
use burrowd::transport::LoopExit;
use tokio::sync::broadcast;

use crate::*;

#[tokio::test]
async fn frames_cross_the_tunnel_in_both_directions() {
    let (sa, sb) = socket_pair().await;
    let (shutdown, _) = broadcast::channel(1);
    let mut a = spawn_node(sa, shared_key(), true, Duration::from_secs(30), &shutdown);
    let mut b = spawn_node(sb, shared_key(), false, Duration::from_secs(30), &shutdown);

    a.tap_in.send(b"frame from a".to_vec()).await.unwrap();
    assert_eq!(recv_frame(&mut b).await, b"frame from a");

    b.tap_in.send(b"frame from b".to_vec()).await.unwrap();
    assert_eq!(recv_frame(&mut a).await, b"frame from b");

    shutdown.send(()).unwrap();
    let (exit_a, stats_a) = a.finish().await;
    let (exit_b, stats_b) = b.finish().await;

    assert_eq!(exit_a, LoopExit::Terminated);
    assert_eq!(exit_b, LoopExit::Terminated);
    assert_eq!(stats_a.bytes_payload_out, 12);
    assert_eq!(stats_a.bytes_payload_in, 12);
    assert_eq!(stats_b.frames_in, 1);
    assert_eq!(stats_b.frames_out, 1);
    assert_eq!(stats_b.frames_unauth, 0);
    assert_eq!(stats_b.frames_dup, 0);
}

#[tokio::test]
async fn a_stream_of_frames_arrives_complete_and_in_order() {
    let (sa, sb) = socket_pair().await;
    let (shutdown, _) = broadcast::channel(1);
    let a = spawn_node(sa, shared_key(), true, Duration::from_secs(30), &shutdown);
    let mut b = spawn_node(sb, shared_key(), false, Duration::from_secs(30), &shutdown);

    for i in 0..40u32 {
        let payload = format!("tunnelled frame number {i:03}");
        a.tap_in.send(payload.into_bytes()).await.unwrap();
    }
    for i in 0..40u32 {
        let frame = recv_frame(&mut b).await;
        assert_eq!(
            String::from_utf8(frame).unwrap(),
            format!("tunnelled frame number {i:03}")
        );
    }

    shutdown.send(()).unwrap();
    let (_, stats_a) = a.finish().await;
    let (_, stats_b) = b.finish().await;
    assert_eq!(stats_a.frames_out, 40);
    assert_eq!(stats_b.frames_in, 40);
    assert_eq!(stats_b.frames_dup, 0);
}

#[tokio::test]
async fn junk_datagrams_are_counted_and_ignored() {
    let (sa, sb) = socket_pair().await;
    let (shutdown, _) = broadcast::channel(1);
    let a = spawn_node(sa, shared_key(), true, Duration::from_secs(30), &shutdown);
    let mut b = spawn_node(sb, shared_key(), false, Duration::from_secs(30), &shutdown);

    // Unauthenticated noise from the right source address.
    a.socket.send(&[0u8; 40]).await.unwrap();
    a.socket.send(&[0xffu8; 64]).await.unwrap();

    // The tunnel still works afterwards.
    a.tap_in.send(b"still alive".to_vec()).await.unwrap();
    assert_eq!(recv_frame(&mut b).await, b"still alive");

    shutdown.send(()).unwrap();
    let (_, stats_b) = b.finish().await;
    assert_eq!(stats_b.frames_unauth, 2);
    assert_eq!(stats_b.frames_in, 1);
    let (_, _) = a.finish().await;
}

#[tokio::test]
async fn frames_up_to_the_payload_limit_survive() {
    let (sa, sb) = socket_pair().await;
    let (shutdown, _) = broadcast::channel(1);
    let a = spawn_node(sa, shared_key(), true, Duration::from_secs(30), &shutdown);
    let mut b = spawn_node(sb, shared_key(), false, Duration::from_secs(30), &shutdown);

    let payload: Vec<u8> = (0..wire::max_frame_len(MTU)).map(|i| i as u8).collect();
    a.tap_in.send(payload.clone()).await.unwrap();
    assert_eq!(recv_frame(&mut b).await, payload);

    shutdown.send(()).unwrap();
    let (_, stats_b) = b.finish().await;
    assert_eq!(stats_b.bytes_payload_in as usize, payload.len());
    let (_, _) = a.finish().await;
}

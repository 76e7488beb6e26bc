//! Link layer behaviour over in-memory streams with paused time
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

mod support;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::time::Instant;

use iec104srv::{
    Asdu, CauseOfTransmission, ConnectionEvent, ConnectionState, Frame, Iec104Server,
    MasterConnection, ServerConfig, TypeId, UFunction,
};
use support::{interrogation, loopback_config, measurement, wait_until, TestMaster};

fn peer(port: u16) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 7], port))
}

async fn running_server(config: ServerConfig) -> Arc<Iec104Server> {
    let server = Arc::new(Iec104Server::new(config));
    server.start().await.unwrap();
    server
}

fn attach(server: &Iec104Server, port: u16) -> (TestMaster<DuplexStream>, MasterConnection) {
    attach_with_buffer(server, port, 64 * 1024)
}

fn attach_with_buffer(
    server: &Iec104Server,
    port: u16,
    buffer: usize,
) -> (TestMaster<DuplexStream>, MasterConnection) {
    let (client, stream) = tokio::io::duplex(buffer);
    let handle = server.attach_stream(stream, peer(port)).unwrap();
    (TestMaster::over(client), handle)
}

/// Accept every ASDU without answering
fn silent_handler(server: &Iec104Server) {
    server.set_asdu_handler(|_: &MasterConnection, _: &Asdu| true);
}

#[tokio::test(start_paused = true)]
async fn test_idle_link_sends_testfr_and_closes_without_con() {
    let server = running_server(loopback_config()).await;
    let (mut master, handle) = attach(&server, 1);
    master.start_dt().await;

    let started = Instant::now();
    let frame = master.recv_within(Duration::from_secs(30)).await.unwrap().unwrap();
    assert_eq!(frame, Frame::U(UFunction::TestFrAct));
    assert!(started.elapsed() >= Duration::from_secs(19));

    master.expect_closed_within(Duration::from_secs(20)).await;
    wait_until(|| server.open_connections() == 0).await;
    assert_eq!(handle.state(), ConnectionState::Closed);
    server.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_answered_testfr_keeps_link_open() {
    let server = running_server(loopback_config()).await;
    let (mut master, handle) = attach(&server, 1);
    master.start_dt().await;

    for _ in 0..3 {
        let frame = master.recv_within(Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(frame, Frame::U(UFunction::TestFrAct));
        master.send(Frame::U(UFunction::TestFrCon)).await;
    }
    assert_eq!(handle.state(), ConnectionState::Started);
    assert_eq!(server.open_connections(), 1);
    server.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_master_testfr_is_confirmed_in_any_state() {
    let server = running_server(loopback_config()).await;
    let (mut master, handle) = attach(&server, 1);

    master.send(Frame::U(UFunction::TestFrAct)).await;
    assert_eq!(master.recv().await, Frame::U(UFunction::TestFrCon));
    assert_eq!(handle.state(), ConnectionState::Unconfirmed);
    server.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_data_closes_after_t1() {
    let server = running_server(loopback_config()).await;
    let (mut master, _handle) = attach(&server, 1);
    master.start_dt().await;

    server.enqueue_asdu(measurement(1)).unwrap();
    let asdu = master.recv_asdu().await;
    assert_eq!(asdu.common_address(), 1);

    let sent = Instant::now();
    master.expect_closed_within(Duration::from_secs(20)).await;
    assert!(sent.elapsed() >= Duration::from_secs(15));
    wait_until(|| server.open_connections() == 0).await;
    server.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_received_frames_acknowledged_after_t2() {
    let server = running_server(loopback_config()).await;
    silent_handler(&server);
    let (mut master, _handle) = attach(&server, 1);
    master.start_dt().await;

    master.send_asdu(&measurement(1)).await;
    let sent = Instant::now();
    let frame = master.recv_within(Duration::from_secs(15)).await.unwrap().unwrap();
    assert_eq!(frame, Frame::S { recv_seq: 1 });
    assert!(sent.elapsed() >= Duration::from_secs(10));
    assert!(sent.elapsed() < Duration::from_secs(15));
    server.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_t1_closes_while_write_is_blocked() {
    let server = running_server(loopback_config()).await;
    let (mut master, handle) = attach_with_buffer(&server, 1, 64);
    master.start_dt().await;

    // The master never reads again, so the transport fills up mid-burst
    for ca in 0..12 {
        server.enqueue_asdu(measurement(ca)).unwrap();
    }
    tokio::time::sleep(Duration::from_secs(14)).await;
    assert_eq!(server.open_connections(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    wait_until(|| server.open_connections() == 0).await;
    assert_eq!(handle.state(), ConnectionState::Closed);
    drop(master);
    server.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_w_received_frames_acknowledged_immediately() {
    let server = running_server(loopback_config()).await;
    silent_handler(&server);
    let (mut master, _handle) = attach(&server, 1);
    master.start_dt().await;

    let sent = Instant::now();
    for ca in 0..8 {
        master.send_asdu(&measurement(ca)).await;
    }
    assert_eq!(master.recv().await, Frame::S { recv_seq: 8 });
    assert!(sent.elapsed() < Duration::from_secs(1));
    server.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_send_window_stops_at_k() {
    let server = running_server(loopback_config()).await;
    let (mut master, _handle) = attach(&server, 1);
    master.start_dt().await;

    for ca in 0..20 {
        server.enqueue_asdu(measurement(ca)).unwrap();
    }

    for expected_seq in 0..12u16 {
        match master.recv().await {
            Frame::I { send_seq, .. } => assert_eq!(send_seq, expected_seq),
            other => panic!("unexpected {}", other),
        }
    }
    assert!(master.recv_within(Duration::from_secs(1)).await.is_none());

    master.ack().await;
    for ca in 12..20 {
        let asdu = master.recv_asdu().await;
        assert_eq!(asdu.common_address(), ca);
    }
    assert_eq!(master.recv_seq(), 20);
    server.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_i_frame_before_startdt_closes() {
    let server = running_server(loopback_config()).await;
    let (mut master, _handle) = attach(&server, 1);

    master.send_asdu(&interrogation(1, 20)).await;
    master.expect_closed().await;
    wait_until(|| server.open_connections() == 0).await;
    server.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_wrong_send_sequence_closes_silently() {
    let server = running_server(loopback_config()).await;
    silent_handler(&server);
    let (mut master, _handle) = attach(&server, 1);
    master.start_dt().await;

    let payload = measurement(1).encode(&support::params()).unwrap();
    master.send(Frame::i_frame(5, 0, payload)).await;
    master.expect_closed().await;
    server.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_invalid_acknowledgment_closes() {
    let server = running_server(loopback_config()).await;
    let (mut master, _handle) = attach(&server, 1);
    master.start_dt().await;

    master.send(Frame::S { recv_seq: 3 }).await;
    master.expect_closed().await;
    server.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stopdt_acknowledges_and_holds_data() {
    let server = running_server(loopback_config()).await;
    silent_handler(&server);
    let (mut master, handle) = attach(&server, 1);
    master.start_dt().await;

    master.send_asdu(&measurement(1)).await;
    master.send(Frame::U(UFunction::StopDtAct)).await;
    assert_eq!(master.recv().await, Frame::S { recv_seq: 1 });
    assert_eq!(master.recv().await, Frame::U(UFunction::StopDtCon));
    assert_eq!(handle.state(), ConnectionState::Stopped);

    server.enqueue_asdu(measurement(9)).unwrap();
    assert!(master.recv_within(Duration::from_secs(1)).await.is_none());

    master.start_dt().await;
    assert_eq!(master.recv_asdu().await.common_address(), 9);
    server.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stopdt_before_start_is_confirmed() {
    let server = running_server(loopback_config()).await;
    let (mut master, handle) = attach(&server, 1);

    master.send(Frame::U(UFunction::StopDtAct)).await;
    assert_eq!(master.recv().await, Frame::U(UFunction::StopDtCon));
    assert_eq!(handle.state(), ConnectionState::Unconfirmed);
    server.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_close_from_handle() {
    let server = running_server(loopback_config()).await;
    let (mut master, handle) = attach(&server, 1);
    master.start_dt().await;

    handle.close();
    master.expect_closed().await;
    wait_until(|| server.open_connections() == 0).await;
    assert!(!handle.send_asdu(measurement(1)));
    server.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_events_follow_lifecycle() {
    let server = running_server(loopback_config()).await;
    let events = Arc::new(Mutex::new(Vec::new()));
    let recorded = events.clone();
    server.set_connection_event_handler(move |_: &MasterConnection, event: ConnectionEvent| {
        recorded.lock().push(event);
    });

    let (mut master, handle) = attach(&server, 1);
    master.start_dt().await;
    handle.deactivate();
    wait_until(|| handle.state() == ConnectionState::Stopped).await;
    handle.close();
    master.expect_closed().await;
    wait_until(|| events.lock().len() == 4).await;

    assert_eq!(
        *events.lock(),
        vec![
            ConnectionEvent::Opened,
            ConnectionEvent::Activated,
            ConnectionEvent::Deactivated,
            ConnectionEvent::Closed,
        ]
    );
    server.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_responses_drain_before_group_data() {
    let server = running_server(loopback_config()).await;
    for ca in 1..=3 {
        server.enqueue_asdu(measurement(ca)).unwrap();
    }
    server.set_interrogation_handler(|conn: &MasterConnection, asdu: &Asdu, _qoi: u8| {
        conn.send_act_con(asdu, false);
        conn.send_act_term(asdu);
        true
    });

    let (mut master, _handle) = attach(&server, 1);
    master.start_dt().await;
    // Buffered data flows as soon as the connection is started
    for ca in 1..=3 {
        assert_eq!(master.recv_asdu().await.common_address(), ca);
    }

    master.send_asdu(&interrogation(7, 20)).await;
    for ca in 10..=12 {
        server.enqueue_asdu(measurement(ca)).unwrap();
    }
    let con = master.recv_asdu().await;
    assert_eq!(con.cause(), Some(CauseOfTransmission::ActivationConfirmation));
    let term = master.recv_asdu().await;
    assert_eq!(term.cause(), Some(CauseOfTransmission::ActivationTermination));
    assert_eq!(term.type_id(), Some(TypeId::InterrogationCommand));
    for ca in 10..=12 {
        assert_eq!(master.recv_asdu().await.common_address(), ca);
    }
    server.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_response_overflow_is_counted() {
    let mut config = loopback_config();
    config.max_high_prio_queue_size = 2;
    let server = running_server(config).await;
    let (mut master, handle) = attach(&server, 1);
    master.start_dt().await;

    for ca in 1..=5 {
        assert!(handle.send_asdu(measurement(ca)));
    }
    assert_eq!(handle.response_evictions(), 3);
    let stats = server.queue_stats();
    assert_eq!(stats.response_evicted, 3);
    assert_eq!(stats.total_evicted(), 3);

    for ca in 4..=5 {
        assert_eq!(master.recv_asdu().await.common_address(), ca);
    }
    handle.close();
    wait_until(|| server.open_connections() == 0).await;
    assert_eq!(server.queue_stats().response_evicted, 3);
    server.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stop_closes_attached_connections() {
    let server = running_server(loopback_config()).await;
    let (mut first, _) = attach(&server, 1);
    let (mut second, _) = attach(&server, 2);
    first.start_dt().await;
    assert_eq!(server.connections().len(), 2);

    server.stop().await.unwrap();
    first.expect_closed().await;
    second.expect_closed().await;
    assert_eq!(server.open_connections(), 0);
    assert!(server.connections().is_empty());
}

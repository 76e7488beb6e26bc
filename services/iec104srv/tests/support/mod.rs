//! Minimal IEC 104 master used by the integration tests
#![allow(dead_code)]
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use iec104srv::{
    ApciCodec, AppLayerParameters, Asdu, CauseOfTransmission, Frame, IecError, ServerConfig,
    TypeId, UFunction,
};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Loopback configuration on an ephemeral port
pub fn loopback_config() -> ServerConfig {
    ServerConfig {
        bind_address: "127.0.0.1".to_string(),
        port: 0,
        ..ServerConfig::default()
    }
}

pub fn params() -> AppLayerParameters {
    AppLayerParameters::default()
}

pub fn interrogation(common_address: u16, qoi: u8) -> Asdu {
    command(TypeId::InterrogationCommand, CauseOfTransmission::Activation, common_address, &[qoi])
}

pub fn command(
    type_id: TypeId,
    cause: CauseOfTransmission,
    common_address: u16,
    element: &[u8],
) -> Asdu {
    let mut asdu = Asdu::new(type_id, cause, common_address);
    asdu.push_object(0, element, &params()).unwrap();
    asdu
}

/// Spontaneous float measurement tagged by its common address
pub fn measurement(common_address: u16) -> Asdu {
    let mut asdu = Asdu::new(
        TypeId::MeasuredFloat,
        CauseOfTransmission::Spontaneous,
        common_address,
    );
    let mut element = 1.5f32.to_le_bytes().to_vec();
    element.push(0);
    asdu.push_object(100, &element, &params()).unwrap();
    asdu
}

/// Poll `condition` until it holds, panicking after five seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub struct TestMaster<S> {
    framed: Framed<S, ApciCodec>,
    send_seq: u16,
    recv_seq: u16,
}

impl TestMaster<TcpStream> {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self::over(TcpStream::connect(addr).await.unwrap())
    }
}

impl<S> TestMaster<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn over(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, ApciCodec::new()),
            send_seq: 0,
            recv_seq: 0,
        }
    }

    pub fn recv_seq(&self) -> u16 {
        self.recv_seq
    }

    pub async fn send(&mut self, frame: Frame) {
        self.framed.send(frame).await.unwrap();
    }

    /// Next frame, `None` on timeout
    pub async fn recv_within(&mut self, timeout: Duration) -> Option<Result<Frame, IecError>> {
        tokio::time::timeout(timeout, self.framed.next())
            .await
            .ok()
            .flatten()
    }

    pub async fn recv(&mut self) -> Frame {
        let frame = tokio::time::timeout(RECV_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .unwrap();
        if let Frame::I { send_seq, .. } = &frame {
            self.recv_seq = (send_seq + 1) % 32768;
        }
        frame
    }

    pub async fn start_dt(&mut self) {
        self.send(Frame::U(UFunction::StartDtAct)).await;
        assert_eq!(self.recv().await, Frame::U(UFunction::StartDtCon));
    }

    pub async fn send_asdu(&mut self, asdu: &Asdu) {
        let payload = asdu.encode(&params()).unwrap();
        let frame = Frame::i_frame(self.send_seq, self.recv_seq, payload);
        self.send_seq = (self.send_seq + 1) % 32768;
        self.send(frame).await;
    }

    pub async fn ack(&mut self) {
        let recv_seq = self.recv_seq;
        self.send(Frame::S { recv_seq }).await;
    }

    pub async fn recv_asdu(&mut self) -> Asdu {
        match self.recv().await {
            Frame::I { asdu, .. } => Asdu::decode(&asdu, &params()).unwrap(),
            other => panic!("expected an I-frame, got {}", other),
        }
    }

    /// The peer closes without sending anything else
    pub async fn expect_closed(&mut self) {
        self.expect_closed_within(RECV_TIMEOUT).await;
    }

    pub async fn expect_closed_within(&mut self, timeout: Duration) {
        match tokio::time::timeout(timeout, self.framed.next()).await {
            Ok(None) | Ok(Some(Err(_))) => {},
            Ok(Some(Ok(frame))) => panic!("expected close, got {}", frame),
            Err(_) => panic!("connection still open"),
        }
    }
}

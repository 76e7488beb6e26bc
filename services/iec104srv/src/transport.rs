//! Byte-stream transports
//!
//! Accepted TCP sockets pass through a [`TransportAcceptor`] before the APCI
//! engine sees them. The default is plain TCP; a secure (TLS) acceptor can be
//! injected on the server and is run under the t0 timeout.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::{IecError, IecResult, TimeoutKind};

/// Anything the engine can frame APDUs over
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    Plain,
    Secure,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => write!(f, "plain"),
            Self::Secure => write!(f, "secure"),
        }
    }
}

/// Turns an accepted socket into the stream the engine uses
#[async_trait]
pub trait TransportAcceptor: Send + Sync {
    fn mode(&self) -> TransportMode;

    async fn accept(&self, stream: TcpStream, peer: SocketAddr) -> io::Result<BoxedStream>;
}

/// Plain TCP with Nagle disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTransport;

#[async_trait]
impl TransportAcceptor for PlainTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Plain
    }

    async fn accept(&self, stream: TcpStream, _peer: SocketAddr) -> io::Result<BoxedStream> {
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Run the acceptor, giving up after `t0`
pub(crate) async fn establish(
    acceptor: &dyn TransportAcceptor,
    stream: TcpStream,
    peer: SocketAddr,
    t0: Duration,
) -> IecResult<BoxedStream> {
    tokio::time::timeout(t0, acceptor.accept(stream, peer))
        .await
        .map_err(|_| IecError::TimeoutError(TimeoutKind::Establish))?
        .map_err(IecError::from)
}

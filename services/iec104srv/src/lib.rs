//! IEC 60870-5-104 Controlled Station (IEC104SRV)
//!
//! Protocol engine for the slave side of IEC 104: it accepts TCP connections
//! from masters, runs the APCI link layer (framing, N(S)/N(R) windows, t1-t3
//! timers, STARTDT/STOPDT/TESTFR), routes received ASDUs to application
//! handlers and drains application data to the active connection of each
//! redundancy group.
//!
//! ## Architecture
//!
//! ```text
//!  TcpListener ──► AdmissionController ──► TransportAcceptor (t0)
//!                                               │
//!                                               ▼
//!  Iec104Server ◄── MasterConnection ◄── Connection task ◄──► Framed<ApciCodec>
//!       │                ▲                  │      │
//!       │ enqueue        │ ACT_CON/TERM     │      └─► SequenceTracker
//!       ▼                │                  ▼
//!  RedundancyCoordinator ─► RedundancyGroup ─► PriorityQueuePair
//!                                           Dispatcher ─► handlers
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use iec104srv::{Asdu, Iec104Server, MasterConnection, ServerConfig};
//!
//! # async fn run() -> iec104srv::IecResult<()> {
//! let server = Iec104Server::new(ServerConfig::default());
//! server.set_interrogation_handler(|conn: &MasterConnection, asdu: &Asdu, _qoi: u8| {
//!     conn.send_act_con(asdu, false);
//!     conn.send_act_term(asdu);
//!     true
//! });
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod asdu;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod queue;
pub mod redundancy;
pub mod sequence;
pub mod server;
pub mod transport;

pub use admission::{AdmissionController, AdmissionPermit, ConnectionRequestHandler};
pub use asdu::{
    Asdu, CauseOfTransmission, CounterQualifier, Cp16Time2a, Cp56Time2a, TypeId,
    MAX_ASDU_LENGTH,
};
pub use codec::{ApciCodec, Frame, UFunction};
pub use config::{ApciParameters, AppLayerParameters, ServerConfig};
pub use connection::{ConnectionEvent, ConnectionId, ConnectionState, MasterConnection};
pub use dispatcher::{
    AsduHandler, Command, CommandHandler, ConnectionEventHandler, DispatchOutcome, Dispatcher,
};
pub use error::{AdmissionRejection, ErrorCategory, IecError, IecResult, TimeoutKind};
pub use queue::{Priority, QueueStats};
pub use redundancy::ServerMode;
pub use server::{log_connection_event, Iec104Server};
pub use transport::{BoxedStream, PlainTransport, TransportAcceptor, TransportMode};

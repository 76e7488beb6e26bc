//! One master connection
//!
//! Each accepted connection runs as a single task that owns the framed
//! transport, the [`SequenceTracker`] and the data transfer state, so reads,
//! writes and timer handling never race. Other threads talk to it through the
//! cloneable [`MasterConnection`] handle: they queue responses, request
//! deactivation or close it, and the task picks that up on its next wakeup.
//!
//! ```text
//! Unconfirmed --STARTDT--> Started <--STARTDT/STOPDT--> Stopped
//!      \________________________|__________________________/
//!                               v
//!                             Closed
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::admission::AdmissionPermit;
use crate::asdu::{Asdu, CauseOfTransmission};
use crate::codec::{ApciCodec, Frame, UFunction};
use crate::config::{ApciParameters, AppLayerParameters};
use crate::dispatcher::Dispatcher;
use crate::error::{IecError, IecResult};
use crate::queue::MessageQueue;
use crate::redundancy::{RedundancyCoordinator, RedundancyGroup};
use crate::sequence::SequenceTracker;
use crate::transport::TransportMode;

/// Server-unique connection number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Data transfer state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    /// Connected, STARTDT not yet received
    Unconfirmed = 0,
    Started = 1,
    Stopped = 2,
    Closed = 3,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unconfirmed => "unconfirmed",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> ConnectionState {
        match self.0.load(Ordering::Acquire) {
            0 => ConnectionState::Unconfirmed,
            1 => ConnectionState::Started,
            2 => ConnectionState::Stopped,
            _ => ConnectionState::Closed,
        }
    }

    fn store(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Lifecycle notification delivered to the event handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEvent {
    Opened,
    /// STARTDT received
    Activated,
    /// STOPDT received or deactivated locally
    Deactivated,
    Closed,
}

#[derive(Debug)]
struct ConnectionShared {
    id: ConnectionId,
    peer: SocketAddr,
    transport: TransportMode,
    connected_at: DateTime<Utc>,
    app_layer: AppLayerParameters,
    state: StateCell,
    /// Responses sent through this handle; drained before the group queues
    responses: Mutex<MessageQueue>,
    wakeup: Arc<Notify>,
    cancel: CancellationToken,
    deactivate_requested: AtomicBool,
}

/// Handle to a master connection, usable from any thread
#[derive(Debug, Clone)]
pub struct MasterConnection {
    shared: Arc<ConnectionShared>,
}

impl MasterConnection {
    fn new(
        id: ConnectionId,
        peer: SocketAddr,
        transport: TransportMode,
        connected_at: DateTime<Utc>,
        app_layer: AppLayerParameters,
        response_capacity: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(ConnectionShared {
                id,
                peer,
                transport,
                connected_at,
                app_layer,
                state: StateCell::new(ConnectionState::Unconfirmed),
                responses: Mutex::new(MessageQueue::new(response_capacity)),
                wakeup: Arc::new(Notify::new()),
                cancel,
                deactivate_requested: AtomicBool::new(false),
            }),
        }
    }

    /// A handle with no task behind it
    #[cfg(test)]
    pub(crate) fn detached(
        id: ConnectionId,
        app_layer: AppLayerParameters,
        response_capacity: usize,
    ) -> Self {
        Self::new(
            id,
            SocketAddr::from(([127, 0, 0, 1], 0)),
            TransportMode::Plain,
            Utc::now(),
            app_layer,
            response_capacity,
            CancellationToken::new(),
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer
    }

    pub fn transport_mode(&self) -> TransportMode {
        self.shared.transport
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.shared.connected_at
    }

    pub fn app_layer_parameters(&self) -> &AppLayerParameters {
        &self.shared.app_layer
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.load()
    }

    /// Data transfer is started
    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Started
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.shared.state.store(state);
    }

    /// Queue an ASDU for this connection ahead of group data
    ///
    /// Returns `false` if data transfer is not started. The queue is bounded
    /// by the high priority capacity and drops its oldest entry when full.
    pub fn send_asdu(&self, asdu: Asdu) -> bool {
        if !self.is_active() || self.shared.cancel.is_cancelled() {
            return false;
        }
        if let Some(dropped) = self.shared.responses.lock().push(asdu) {
            debug!(
                "Connection {}: response queue full, dropped {}",
                self.shared.id, dropped
            );
        }
        self.shared.wakeup.notify_one();
        true
    }

    /// Confirm an activation (or deactivation) request
    pub fn send_act_con(&self, request: &Asdu, negative: bool) -> bool {
        let mut response = request.clone();
        let cause = match request.cause() {
            Some(CauseOfTransmission::Deactivation) => {
                CauseOfTransmission::DeactivationConfirmation
            },
            _ => CauseOfTransmission::ActivationConfirmation,
        };
        response.set_cause(cause);
        response.set_negative(negative);
        self.send_asdu(response)
    }

    /// Signal that an activation has completed
    pub fn send_act_term(&self, request: &Asdu) -> bool {
        let mut response = request.clone();
        response.set_cause(CauseOfTransmission::ActivationTermination);
        response.set_negative(false);
        self.send_asdu(response)
    }

    /// Close the connection; frames not yet written are discarded
    pub fn close(&self) {
        self.shared.cancel.cancel();
    }

    /// Force the connection from `Started` to `Stopped`
    pub fn deactivate(&self) {
        self.shared
            .deactivate_requested
            .store(true, Ordering::Release);
        self.shared.wakeup.notify_one();
    }

    pub fn pending_responses(&self) -> usize {
        self.shared.responses.lock().len()
    }

    /// Responses dropped because the response queue was full
    pub fn response_evictions(&self) -> u64 {
        self.shared.responses.lock().evicted()
    }

    pub(crate) fn take_response(&self) -> Option<Asdu> {
        self.shared.responses.lock().pop()
    }

    /// Resolves once the connection is closed
    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await;
    }
}

impl fmt::Display for MasterConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.shared.id, self.shared.peer)
    }
}

/// Open connections of one server
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, MasterConnection>>,
    next_id: AtomicU64,
    /// Response evictions of connections that have already closed
    retired_evictions: AtomicU64,
}

impl ConnectionRegistry {
    fn allocate_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn insert(&self, connection: MasterConnection) {
        self.connections.lock().insert(connection.id(), connection);
    }

    fn remove(&self, id: ConnectionId) {
        if let Some(connection) = self.connections.lock().remove(&id) {
            self.retired_evictions
                .fetch_add(connection.response_evictions(), Ordering::Relaxed);
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<MasterConnection> {
        self.connections.lock().get(&id).cloned()
    }

    pub fn snapshot(&self) -> Vec<MasterConnection> {
        let mut connections: Vec<_> = self.connections.lock().values().cloned().collect();
        connections.sort_by_key(|c| c.id());
        connections
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// Responses dropped on full response queues, closed connections included
    pub fn response_evictions(&self) -> u64 {
        let live: u64 = self
            .snapshot()
            .iter()
            .map(MasterConnection::response_evictions)
            .sum();
        live + self.retired_evictions.load(Ordering::Relaxed)
    }

    pub fn close_all(&self) {
        for connection in self.snapshot() {
            connection.close();
        }
    }
}

/// Server-wide pieces every connection needs
#[derive(Clone)]
pub(crate) struct EngineContext {
    pub apci: ApciParameters,
    pub app_layer: AppLayerParameters,
    pub tick_interval: Duration,
    pub response_capacity: usize,
    pub dispatcher: Arc<Dispatcher>,
    pub coordinator: Arc<RedundancyCoordinator>,
    pub registry: Arc<ConnectionRegistry>,
}

/// Releases everything a connection holds, even if its task panics
struct ConnectionLease {
    handle: MasterConnection,
    coordinator: Arc<RedundancyCoordinator>,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<Dispatcher>,
    _permit: AdmissionPermit,
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        let id = self.handle.id();
        self.handle.set_state(ConnectionState::Closed);
        self.handle.shared.cancel.cancel();
        self.coordinator.leave(id);
        self.registry.remove(id);
        if !std::thread::panicking() {
            self.dispatcher
                .notify_event(&self.handle, ConnectionEvent::Closed);
        }
    }
}

pub(crate) struct Connection<S> {
    handle: MasterConnection,
    framed: Framed<S, ApciCodec>,
    tracker: SequenceTracker,
    group: Arc<RedundancyGroup>,
    dispatcher: Arc<Dispatcher>,
    app_layer: AppLayerParameters,
    tick_interval: Duration,
    /// w received I-frames are waiting for an S-frame
    ack_due: bool,
    _lease: ConnectionLease,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Register an admitted stream with the server and its redundancy group
    pub(crate) fn establish(
        stream: S,
        transport: TransportMode,
        permit: AdmissionPermit,
        parent: &CancellationToken,
        ctx: &EngineContext,
    ) -> (Self, MasterConnection) {
        let id = ctx.registry.allocate_id();
        let handle = MasterConnection::new(
            id,
            permit.peer(),
            transport,
            permit.admitted_at(),
            ctx.app_layer,
            ctx.response_capacity,
            parent.child_token(),
        );
        let group = ctx.coordinator.join(id, handle.shared.wakeup.clone());
        ctx.registry.insert(handle.clone());

        let connection = Self {
            handle: handle.clone(),
            framed: Framed::new(stream, ApciCodec::new()),
            tracker: SequenceTracker::new(&ctx.apci, Instant::now()),
            group,
            dispatcher: ctx.dispatcher.clone(),
            app_layer: ctx.app_layer,
            tick_interval: ctx.tick_interval,
            ack_due: false,
            _lease: ConnectionLease {
                handle: handle.clone(),
                coordinator: ctx.coordinator.clone(),
                registry: ctx.registry.clone(),
                dispatcher: ctx.dispatcher.clone(),
                _permit: permit,
            },
        };
        (connection, handle)
    }

    pub(crate) async fn run(mut self) {
        let handle = self.handle.clone();
        info!(
            "Connection {} opened ({}, group {})",
            handle,
            handle.transport_mode(),
            self.group.id()
        );
        self.dispatcher.notify_event(&handle, ConnectionEvent::Opened);

        match self.serve().await {
            Ok(()) | Err(IecError::ClosedLocally) => info!("Connection {} closed", handle),
            Err(IecError::ConnectionClosed) => info!("Connection {} closed by peer", handle),
            Err(e) => warn!(
                "Connection {} closed after {:?} error: {}",
                handle,
                e.category(),
                e
            ),
        }
    }

    async fn serve(&mut self) -> IecResult<()> {
        let cancel = self.handle.shared.cancel.clone();
        let wakeup = self.handle.shared.wakeup.clone();
        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                frame = self.framed.next() => match frame {
                    Some(Ok(frame)) => self.on_frame(frame).await?,
                    Some(Err(e)) => return Err(e),
                    None => return Err(IecError::ConnectionClosed),
                },
                _ = tick.tick() => self.on_tick().await?,
                _ = wakeup.notified() => {},
            }

            self.apply_deactivation();
            self.drain().await?;
        }
    }

    async fn on_frame(&mut self, frame: Frame) -> IecResult<()> {
        trace!("Connection {} RX {}", self.handle.id(), frame);
        let now = Instant::now();
        self.tracker.on_activity(now);

        match frame {
            Frame::I {
                send_seq,
                recv_seq,
                asdu,
            } => {
                let state = self.handle.state();
                if state != ConnectionState::Started {
                    return Err(IecError::ProtocolError(format!(
                        "I-frame received while {}",
                        state
                    )));
                }
                self.ack_due |= self.tracker.on_i_frame(send_seq, now)?;
                self.tracker.on_ack(recv_seq, now)?;

                let asdu = Asdu::decode(&asdu, &self.app_layer)?;
                debug!("Connection {} received ASDU {}", self.handle.id(), asdu);
                let outcome = self.dispatcher.dispatch(&self.handle, &asdu);
                trace!("Connection {} dispatch: {:?}", self.handle.id(), outcome);
            },
            Frame::S { recv_seq } => self.tracker.on_ack(recv_seq, now)?,
            Frame::U(function) => self.on_control(function).await?,
        }
        Ok(())
    }

    async fn on_control(&mut self, function: UFunction) -> IecResult<()> {
        match function {
            UFunction::StartDtAct => {
                if self.handle.state() != ConnectionState::Started {
                    self.handle.set_state(ConnectionState::Started);
                    self.group.mark_started(self.handle.id());
                    info!("Connection {} data transfer started", self.handle);
                    self.dispatcher
                        .notify_event(&self.handle, ConnectionEvent::Activated);
                }
                // Queued data follows the confirmation in drain()
                self.write(Frame::U(UFunction::StartDtCon)).await?;
            },
            UFunction::StopDtAct => {
                if self.tracker.unconfirmed_received() > 0 {
                    self.send_ack().await?;
                }
                if self.handle.state() == ConnectionState::Started {
                    self.enter_stopped();
                }
                self.write(Frame::U(UFunction::StopDtCon)).await?;
            },
            UFunction::TestFrAct => self.write(Frame::U(UFunction::TestFrCon)).await?,
            UFunction::TestFrCon => self.tracker.test_frame_confirmed(),
            UFunction::StartDtCon | UFunction::StopDtCon => {
                debug!(
                    "Connection {} ignoring unexpected {}",
                    self.handle.id(),
                    function
                );
            },
        }
        Ok(())
    }

    async fn on_tick(&mut self) -> IecResult<()> {
        let now = Instant::now();
        let actions = self.tracker.poll_timers(now)?;
        if actions.send_ack && self.tracker.unconfirmed_received() > 0 {
            self.send_ack().await?;
        }
        if actions.send_test_frame {
            debug!("Connection {} idle, sending TESTFR ACT", self.handle.id());
            self.write(Frame::U(UFunction::TestFrAct)).await?;
            self.tracker.test_frame_sent(now);
        }
        Ok(())
    }

    fn enter_stopped(&mut self) {
        self.handle.set_state(ConnectionState::Stopped);
        self.group.mark_stopped(self.handle.id());
        info!("Connection {} data transfer stopped", self.handle);
        self.dispatcher
            .notify_event(&self.handle, ConnectionEvent::Deactivated);
    }

    fn apply_deactivation(&mut self) {
        let requested = self
            .handle
            .shared
            .deactivate_requested
            .swap(false, Ordering::AcqRel);
        if requested && self.handle.state() == ConnectionState::Started {
            self.enter_stopped();
        }
    }

    /// Send queued ASDUs while the window allows, responses first
    async fn drain(&mut self) -> IecResult<()> {
        if self.handle.state() == ConnectionState::Started {
            while self.tracker.can_send() {
                let next = self
                    .handle
                    .take_response()
                    .or_else(|| self.group.next_for(self.handle.id()).map(|(asdu, _)| asdu));
                let Some(asdu) = next else {
                    break;
                };
                self.transmit(asdu).await?;
            }
        }

        if std::mem::take(&mut self.ack_due) && self.tracker.unconfirmed_received() > 0 {
            self.send_ack().await?;
        }
        Ok(())
    }

    async fn transmit(&mut self, asdu: Asdu) -> IecResult<()> {
        let payload = match asdu.encode(&self.app_layer) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Connection {} dropping ASDU {}: {}", self.handle.id(), asdu, e);
                return Ok(());
            },
        };
        let (send_seq, recv_seq) = self.tracker.next_send(Instant::now())?;
        self.write(Frame::i_frame(send_seq, recv_seq, payload)).await
    }

    async fn send_ack(&mut self) -> IecResult<()> {
        let recv_seq = self.tracker.recv_seq();
        self.write(Frame::S { recv_seq }).await?;
        self.tracker.ack_sent();
        Ok(())
    }

    /// Write one frame, giving up as soon as the connection is closed
    ///
    /// A peer that stops reading blocks the write; the pending t1 (or
    /// TESTFR) deadline still applies and closes the connection.
    async fn write(&mut self, frame: Frame) -> IecResult<()> {
        trace!("Connection {} TX {}", self.handle.id(), frame);
        let (deadline, kind) = self.tracker.write_deadline(Instant::now());
        let cancel = &self.handle.shared.cancel;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(IecError::ClosedLocally),
            result = self.framed.send(frame) => result,
            _ = tokio::time::sleep_until(deadline) => Err(IecError::TimeoutError(kind)),
        }
    }
}

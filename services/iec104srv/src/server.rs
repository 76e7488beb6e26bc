//! IEC 104 server: listener, admission and the management surface

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionController, AdmissionPermit, ConnectionRequestHandler};
use crate::asdu::{Asdu, Cp16Time2a, Cp56Time2a, MAX_ASDU_LENGTH};
use crate::config::ServerConfig;
use crate::connection::{
    Connection, ConnectionEvent, ConnectionRegistry, EngineContext, MasterConnection,
};
use crate::dispatcher::{AsduHandler, CommandHandler, ConnectionEventHandler, Dispatcher};
use crate::error::{AdmissionRejection, IecError, IecResult};
use crate::queue::{Priority, QueueStats};
use crate::redundancy::{RedundancyCoordinator, ServerMode};
use crate::transport::{self, PlainTransport, TransportAcceptor, TransportMode};

/// Pause after a failed `accept()` (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

struct RunningServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
    tasks: TaskTracker,
    ctx: EngineContext,
}

/// IEC 60870-5-104 controlled station
///
/// Configure handlers and parameters, then [`start`](Self::start). Handlers
/// may be replaced while running; listener and redundancy settings only while
/// stopped.
pub struct Iec104Server {
    config: RwLock<ServerConfig>,
    transport: Arc<dyn TransportAcceptor>,
    admission: Arc<AdmissionController>,
    dispatcher: Arc<Dispatcher>,
    coordinator: RwLock<Arc<RedundancyCoordinator>>,
    registry: Arc<ConnectionRegistry>,
    running: Mutex<Option<RunningServer>>,
}

impl Iec104Server {
    pub fn new(config: ServerConfig) -> Self {
        let coordinator = RedundancyCoordinator::new(
            config.server_mode,
            config.max_high_prio_queue_size,
            config.max_low_prio_queue_size,
        );
        Self {
            admission: Arc::new(AdmissionController::new(config.max_open_connections)),
            dispatcher: Arc::new(Dispatcher::new(config.app_layer)),
            coordinator: RwLock::new(Arc::new(coordinator)),
            registry: Arc::new(ConnectionRegistry::default()),
            transport: Arc::new(PlainTransport),
            running: Mutex::new(None),
            config: RwLock::new(config),
        }
    }

    /// Use another transport (e.g. TLS) for accepted sockets
    pub fn with_transport(mut self, transport: Arc<dyn TransportAcceptor>) -> Self {
        self.transport = transport;
        self
    }

    pub fn config(&self) -> ServerConfig {
        self.config.read().clone()
    }

    pub fn transport_mode(&self) -> TransportMode {
        self.transport.mode()
    }

    fn ensure_stopped(&self) -> IecResult<()> {
        if self.is_running() {
            return Err(IecError::AlreadyRunning);
        }
        Ok(())
    }

    pub fn set_local_address(&self, address: impl Into<String>) -> IecResult<()> {
        self.ensure_stopped()?;
        let address = address.into();
        if address.trim().is_empty() {
            return Err(IecError::ConfigError("bind_address must not be empty".into()));
        }
        self.config.write().bind_address = address;
        Ok(())
    }

    pub fn set_local_port(&self, port: u16) -> IecResult<()> {
        self.ensure_stopped()?;
        self.config.write().port = port;
        Ok(())
    }

    /// Switching mode discards anything queued under the previous mode
    pub fn set_server_mode(&self, mode: ServerMode) -> IecResult<()> {
        self.ensure_stopped()?;
        let mut config = self.config.write();
        if config.server_mode != mode {
            config.server_mode = mode;
            *self.coordinator.write() = Arc::new(RedundancyCoordinator::new(
                mode,
                config.max_high_prio_queue_size,
                config.max_low_prio_queue_size,
            ));
        }
        Ok(())
    }

    pub fn server_mode(&self) -> ServerMode {
        self.config.read().server_mode
    }

    /// Takes effect for the next admission; open connections are kept
    pub fn set_max_open_connections(&self, max_open: usize) -> IecResult<()> {
        self.admission.set_max_open_connections(max_open)?;
        self.config.write().max_open_connections = max_open;
        Ok(())
    }

    pub fn max_open_connections(&self) -> usize {
        self.admission.max_open_connections()
    }

    pub fn set_connection_request_handler<H>(&self, handler: H)
    where
        H: ConnectionRequestHandler + 'static,
    {
        self.admission.set_request_handler(Some(Arc::new(handler)));
    }

    pub fn clear_connection_request_handler(&self) {
        self.admission.set_request_handler(None);
    }

    pub fn set_interrogation_handler<H>(&self, handler: H)
    where
        H: CommandHandler<u8> + 'static,
    {
        self.dispatcher
            .set_interrogation_handler(Some(Arc::new(handler)));
    }

    pub fn set_counter_interrogation_handler<H>(&self, handler: H)
    where
        H: CommandHandler<crate::asdu::CounterQualifier> + 'static,
    {
        self.dispatcher
            .set_counter_interrogation_handler(Some(Arc::new(handler)));
    }

    pub fn set_read_handler<H>(&self, handler: H)
    where
        H: CommandHandler<u32> + 'static,
    {
        self.dispatcher.set_read_handler(Some(Arc::new(handler)));
    }

    pub fn set_clock_sync_handler<H>(&self, handler: H)
    where
        H: CommandHandler<Cp56Time2a> + 'static,
    {
        self.dispatcher
            .set_clock_sync_handler(Some(Arc::new(handler)));
    }

    pub fn set_reset_process_handler<H>(&self, handler: H)
    where
        H: CommandHandler<u8> + 'static,
    {
        self.dispatcher
            .set_reset_process_handler(Some(Arc::new(handler)));
    }

    pub fn set_delay_acquisition_handler<H>(&self, handler: H)
    where
        H: CommandHandler<Cp16Time2a> + 'static,
    {
        self.dispatcher
            .set_delay_acquisition_handler(Some(Arc::new(handler)));
    }

    pub fn set_asdu_handler<H>(&self, handler: H)
    where
        H: AsduHandler + 'static,
    {
        self.dispatcher.set_asdu_handler(Some(Arc::new(handler)));
    }

    pub fn set_connection_event_handler<H>(&self, handler: H)
    where
        H: ConnectionEventHandler + 'static,
    {
        self.dispatcher.set_event_handler(Some(Arc::new(handler)));
    }

    /// Direct access to all handler slots, including clearing them
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// Bind the listener and start accepting masters
    pub async fn start(&self) -> IecResult<SocketAddr> {
        self.ensure_stopped()?;
        let config = self.config();
        config.validate()?;

        let listen = config.listen_address();
        let listener = TcpListener::bind(&listen).await.map_err(|e| {
            IecError::ConfigError(format!("Failed to bind {}: {}", listen, e))
        })?;
        let local_addr = listener.local_addr()?;

        let mut running = self.running.lock();
        if running.is_some() {
            return Err(IecError::AlreadyRunning);
        }

        let ctx = EngineContext {
            apci: config.apci.clone(),
            app_layer: config.app_layer,
            tick_interval: config.tick_interval(),
            response_capacity: config.max_high_prio_queue_size,
            dispatcher: self.dispatcher.clone(),
            coordinator: self.coordinator.read().clone(),
            registry: self.registry.clone(),
        };
        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        self.admission.reopen();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            AcceptContext {
                engine: ctx.clone(),
                transport: self.transport.clone(),
                admission: self.admission.clone(),
                cancel: cancel.clone(),
                tasks: tasks.clone(),
            },
        ));

        info!(
            "IEC 104 server listening on {} ({}, {:?}, max {} connections)",
            local_addr,
            self.transport.mode(),
            config.server_mode,
            self.admission.max_open_connections()
        );
        *running = Some(RunningServer {
            local_addr,
            cancel,
            accept_task,
            tasks,
            ctx,
        });
        Ok(local_addr)
    }

    /// Stop accepting, close every connection and wait for their tasks
    pub async fn stop(&self) -> IecResult<()> {
        let Some(running) = self.running.lock().take() else {
            return Err(IecError::NotRunning);
        };
        info!("Stopping IEC 104 server on {}", running.local_addr);

        self.admission.close();
        running.cancel.cancel();
        if let Err(e) = running.accept_task.await {
            error!("Accept loop ended abnormally: {}", e);
        }
        running.tasks.close();
        running.tasks.wait().await;

        info!("IEC 104 server stopped");
        Ok(())
    }

    /// Queue an ASDU with low priority for the redundancy groups
    pub fn enqueue_asdu(&self, asdu: Asdu) -> IecResult<()> {
        self.enqueue_asdu_with_priority(asdu, Priority::Low)
    }

    /// Queue an ASDU; the oldest entry of a full queue is dropped
    pub fn enqueue_asdu_with_priority(&self, asdu: Asdu, priority: Priority) -> IecResult<()> {
        let len = asdu.encoded_len(&self.config.read().app_layer);
        if len > MAX_ASDU_LENGTH {
            return Err(IecError::MalformedAsdu(format!(
                "ASDU of {} octets exceeds {}",
                len, MAX_ASDU_LENGTH
            )));
        }
        let coordinator = self.coordinator.read().clone();
        let groups = coordinator.enqueue(asdu, priority);
        if groups == 0 {
            debug!("No redundancy group to receive ASDU, dropped");
        }
        Ok(())
    }

    pub fn open_connections(&self) -> usize {
        self.admission.open_connections()
    }

    pub fn queue_stats(&self) -> QueueStats {
        let mut stats = self.coordinator.read().stats();
        stats.response_evicted = self.registry.response_evictions();
        stats
    }

    pub fn connections(&self) -> Vec<MasterConnection> {
        self.registry.snapshot()
    }

    /// Run the engine over an already established stream
    ///
    /// The stream goes through admission like an accepted socket but skips
    /// the transport acceptor.
    pub fn attach_stream<S>(
        &self,
        stream: S,
        peer: SocketAddr,
    ) -> Result<MasterConnection, AdmissionRejection>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let running = self.running.lock();
        let Some(running) = running.as_ref() else {
            return Err(AdmissionRejection::ShuttingDown);
        };
        let permit = self.admission.try_admit(peer)?;
        let (connection, handle) = Connection::establish(
            stream,
            TransportMode::Plain,
            permit,
            &running.cancel,
            &running.ctx,
        );
        running.tasks.spawn(connection.run());
        Ok(handle)
    }
}

impl Drop for Iec104Server {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
            running.accept_task.abort();
        }
    }
}

struct AcceptContext {
    engine: EngineContext,
    transport: Arc<dyn TransportAcceptor>,
    admission: Arc<AdmissionController>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

async fn accept_loop(listener: TcpListener, ctx: AcceptContext) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                },
            },
        };

        let permit = match ctx.admission.try_admit(peer) {
            Ok(permit) => permit,
            Err(rejection) => {
                info!("Refused connection from {}: {}", peer, rejection);
                drop(stream);
                continue;
            },
        };

        ctx.tasks.spawn(serve_socket(
            stream,
            permit,
            ctx.transport.clone(),
            ctx.cancel.clone(),
            ctx.engine.clone(),
        ));
    }
    debug!("Accept loop finished");
}

async fn serve_socket(
    stream: TcpStream,
    permit: AdmissionPermit,
    acceptor: Arc<dyn TransportAcceptor>,
    cancel: CancellationToken,
    ctx: EngineContext,
) {
    let peer = permit.peer();
    let established = tokio::select! {
        _ = cancel.cancelled() => return,
        result = transport::establish(acceptor.as_ref(), stream, peer, ctx.apci.t0()) => result,
    };
    let stream = match established {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Transport setup with {} failed: {}", peer, e);
            return;
        },
    };

    let (connection, _) = Connection::establish(stream, acceptor.mode(), permit, &cancel, &ctx);
    connection.run().await;
}

/// Log every lifecycle event; handy as a default event handler
pub fn log_connection_event(connection: &MasterConnection, event: ConnectionEvent) {
    debug!("Connection {} event {:?}", connection, event);
}

//! Routing of received ASDUs to application handlers
//!
//! System commands go to their typed handler first. A missing or declining
//! typed handler falls through to the generic ASDU handler; if nobody accepts
//! the ASDU it is mirrored back negatively with cause 44 (unknown type).
//! Commands sent with a cause the command does not allow are mirrored back
//! with cause 45 and never reach a handler.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::asdu::{Asdu, CauseOfTransmission, CounterQualifier, Cp16Time2a, Cp56Time2a, TypeId};
use crate::config::AppLayerParameters;
use crate::connection::{ConnectionEvent, MasterConnection};

/// Handler for one command type, receiving its decoded parameter
///
/// Return `true` when the command was handled. The handler value itself is
/// the context: implement the trait on a struct to carry state, or register
/// a closure.
pub trait CommandHandler<P>: Send + Sync {
    fn handle(&self, connection: &MasterConnection, asdu: &Asdu, parameter: P) -> bool;
}

impl<P, F> CommandHandler<P> for F
where
    F: Fn(&MasterConnection, &Asdu, P) -> bool + Send + Sync,
{
    fn handle(&self, connection: &MasterConnection, asdu: &Asdu, parameter: P) -> bool {
        self(connection, asdu, parameter)
    }
}

/// Catch-all handler for ASDUs no typed handler accepted
pub trait AsduHandler: Send + Sync {
    fn handle(&self, connection: &MasterConnection, asdu: &Asdu) -> bool;
}

impl<F> AsduHandler for F
where
    F: Fn(&MasterConnection, &Asdu) -> bool + Send + Sync,
{
    fn handle(&self, connection: &MasterConnection, asdu: &Asdu) -> bool {
        self(connection, asdu)
    }
}

/// Lifecycle notifications (opened, activated, deactivated, closed)
pub trait ConnectionEventHandler: Send + Sync {
    fn on_event(&self, connection: &MasterConnection, event: ConnectionEvent);
}

impl<F> ConnectionEventHandler for F
where
    F: Fn(&MasterConnection, ConnectionEvent) + Send + Sync,
{
    fn on_event(&self, connection: &MasterConnection, event: ConnectionEvent) {
        self(connection, event)
    }
}

/// Decoded system command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Interrogation { qoi: u8 },
    CounterInterrogation { qcc: CounterQualifier },
    Read { ioa: u32 },
    ClockSync { time: Cp56Time2a },
    ResetProcess { qrp: u8 },
    DelayAcquisition { delay: Cp16Time2a },
}

impl Command {
    /// Causes of transmission a command may arrive with, `None` for other types
    pub fn accepted_causes(type_id: TypeId) -> Option<&'static [CauseOfTransmission]> {
        use CauseOfTransmission::*;
        match type_id {
            TypeId::InterrogationCommand => Some(&[Activation, Deactivation]),
            TypeId::CounterInterrogationCommand
            | TypeId::ClockSyncCommand
            | TypeId::ResetProcessCommand => Some(&[Activation]),
            TypeId::ReadCommand => Some(&[Request]),
            TypeId::DelayAcquisitionCommand => Some(&[Activation, Spontaneous]),
            _ => None,
        }
    }

    /// Decode the single information object of a system command
    pub fn decode(asdu: &Asdu, params: &AppLayerParameters) -> Option<Self> {
        let (ioa, element) = asdu.first_object(params)?;
        let command = match asdu.type_id()? {
            TypeId::InterrogationCommand => Self::Interrogation {
                qoi: *element.first()?,
            },
            TypeId::CounterInterrogationCommand => Self::CounterInterrogation {
                qcc: CounterQualifier::from_byte(*element.first()?),
            },
            TypeId::ReadCommand => Self::Read { ioa },
            TypeId::ClockSyncCommand => Self::ClockSync {
                time: Cp56Time2a::decode(element).ok()?,
            },
            TypeId::ResetProcessCommand => Self::ResetProcess {
                qrp: *element.first()?,
            },
            TypeId::DelayAcquisitionCommand => {
                let bytes = element.get(..2)?;
                Self::DelayAcquisition {
                    delay: Cp16Time2a(u16::from_le_bytes([bytes[0], bytes[1]])),
                }
            },
            _ => return None,
        };
        Some(command)
    }
}

/// Result of routing one ASDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler accepted the ASDU
    Handled,
    /// Cause not allowed for the command; answered with cause 45
    UnknownCause,
    /// Nobody accepted it; answered with cause 44
    Unhandled,
}

#[derive(Default, Clone)]
struct HandlerSet {
    interrogation: Option<Arc<dyn CommandHandler<u8>>>,
    counter_interrogation: Option<Arc<dyn CommandHandler<CounterQualifier>>>,
    read: Option<Arc<dyn CommandHandler<u32>>>,
    clock_sync: Option<Arc<dyn CommandHandler<Cp56Time2a>>>,
    reset_process: Option<Arc<dyn CommandHandler<u8>>>,
    delay_acquisition: Option<Arc<dyn CommandHandler<Cp16Time2a>>>,
    asdu: Option<Arc<dyn AsduHandler>>,
    events: Option<Arc<dyn ConnectionEventHandler>>,
}

impl HandlerSet {
    fn handle_command(&self, connection: &MasterConnection, asdu: &Asdu, command: Command) -> bool {
        match command {
            Command::Interrogation { qoi } => self
                .interrogation
                .as_ref()
                .is_some_and(|h| h.handle(connection, asdu, qoi)),
            Command::CounterInterrogation { qcc } => self
                .counter_interrogation
                .as_ref()
                .is_some_and(|h| h.handle(connection, asdu, qcc)),
            Command::Read { ioa } => self
                .read
                .as_ref()
                .is_some_and(|h| h.handle(connection, asdu, ioa)),
            Command::ClockSync { time } => self
                .clock_sync
                .as_ref()
                .is_some_and(|h| h.handle(connection, asdu, time)),
            Command::ResetProcess { qrp } => self
                .reset_process
                .as_ref()
                .is_some_and(|h| h.handle(connection, asdu, qrp)),
            Command::DelayAcquisition { delay } => self
                .delay_acquisition
                .as_ref()
                .is_some_and(|h| h.handle(connection, asdu, delay)),
        }
    }
}

/// Handler registry shared by all connections of a server
///
/// Handlers are invoked on the connection's task without any lock held, so
/// they may send on the connection or replace handlers.
pub struct Dispatcher {
    handlers: RwLock<HandlerSet>,
    app_layer: AppLayerParameters,
}

impl Dispatcher {
    pub fn new(app_layer: AppLayerParameters) -> Self {
        Self {
            handlers: RwLock::new(HandlerSet::default()),
            app_layer,
        }
    }

    pub fn app_layer(&self) -> &AppLayerParameters {
        &self.app_layer
    }

    pub fn set_interrogation_handler(&self, handler: Option<Arc<dyn CommandHandler<u8>>>) {
        self.handlers.write().interrogation = handler;
    }

    pub fn set_counter_interrogation_handler(
        &self,
        handler: Option<Arc<dyn CommandHandler<CounterQualifier>>>,
    ) {
        self.handlers.write().counter_interrogation = handler;
    }

    pub fn set_read_handler(&self, handler: Option<Arc<dyn CommandHandler<u32>>>) {
        self.handlers.write().read = handler;
    }

    pub fn set_clock_sync_handler(&self, handler: Option<Arc<dyn CommandHandler<Cp56Time2a>>>) {
        self.handlers.write().clock_sync = handler;
    }

    pub fn set_reset_process_handler(&self, handler: Option<Arc<dyn CommandHandler<u8>>>) {
        self.handlers.write().reset_process = handler;
    }

    pub fn set_delay_acquisition_handler(
        &self,
        handler: Option<Arc<dyn CommandHandler<Cp16Time2a>>>,
    ) {
        self.handlers.write().delay_acquisition = handler;
    }

    pub fn set_asdu_handler(&self, handler: Option<Arc<dyn AsduHandler>>) {
        self.handlers.write().asdu = handler;
    }

    pub fn set_event_handler(&self, handler: Option<Arc<dyn ConnectionEventHandler>>) {
        self.handlers.write().events = handler;
    }

    pub fn notify_event(&self, connection: &MasterConnection, event: ConnectionEvent) {
        let handler = self.handlers.read().events.clone();
        if let Some(handler) = handler {
            handler.on_event(connection, event);
        }
    }

    /// Route one received ASDU
    pub fn dispatch(&self, connection: &MasterConnection, asdu: &Asdu) -> DispatchOutcome {
        let handlers = self.handlers.read().clone();

        if let Some(type_id) = asdu.type_id() {
            if let Some(accepted) = Command::accepted_causes(type_id) {
                if !asdu.cause().is_some_and(|cause| accepted.contains(&cause)) {
                    debug!(
                        "Connection {}: {} with cause {} not allowed",
                        connection.id(),
                        type_id,
                        asdu.raw_cause()
                    );
                    self.reject(connection, asdu, CauseOfTransmission::UnknownCauseOfTransmission);
                    return DispatchOutcome::UnknownCause;
                }

                match Command::decode(asdu, &self.app_layer) {
                    Some(command) => {
                        if handlers.handle_command(connection, asdu, command) {
                            return DispatchOutcome::Handled;
                        }
                    },
                    None => warn!(
                        "Connection {}: cannot decode {} payload ({} octets)",
                        connection.id(),
                        type_id,
                        asdu.objects().len()
                    ),
                }
            }
        }

        if let Some(handler) = &handlers.asdu {
            if handler.handle(connection, asdu) {
                return DispatchOutcome::Handled;
            }
        }

        debug!(
            "Connection {}: no handler accepted ASDU {}",
            connection.id(),
            asdu
        );
        self.reject(connection, asdu, CauseOfTransmission::UnknownTypeIdentification);
        DispatchOutcome::Unhandled
    }

    fn reject(&self, connection: &MasterConnection, asdu: &Asdu, cause: CauseOfTransmission) {
        let mut response = asdu.clone();
        response.set_cause(cause);
        response.set_negative(true);
        if !connection.send_asdu(response) {
            debug!(
                "Connection {}: negative confirmation dropped, connection not active",
                connection.id()
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::connection::{ConnectionId, ConnectionState};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn params() -> AppLayerParameters {
        AppLayerParameters::default()
    }

    fn started_connection() -> MasterConnection {
        let connection = MasterConnection::detached(ConnectionId::new(1), params(), 16);
        connection.set_state(ConnectionState::Started);
        connection
    }

    fn command(type_id: TypeId, cause: CauseOfTransmission, element: &[u8]) -> Asdu {
        let mut asdu = Asdu::new(type_id, cause, 1);
        asdu.push_object(0, element, &params()).unwrap();
        asdu
    }

    #[test]
    fn test_command_decoding() {
        let asdu = command(
            TypeId::InterrogationCommand,
            CauseOfTransmission::Activation,
            &[20],
        );
        assert_eq!(
            Command::decode(&asdu, &params()),
            Some(Command::Interrogation { qoi: 20 })
        );

        let mut read = Asdu::new(TypeId::ReadCommand, CauseOfTransmission::Request, 1);
        read.push_object(4001, &[], &params()).unwrap();
        assert_eq!(
            Command::decode(&read, &params()),
            Some(Command::Read { ioa: 4001 })
        );

        let delay = command(
            TypeId::DelayAcquisitionCommand,
            CauseOfTransmission::Activation,
            &[0xE8, 0x03],
        );
        assert_eq!(
            Command::decode(&delay, &params()),
            Some(Command::DelayAcquisition {
                delay: Cp16Time2a(1000)
            })
        );

        // truncated clock sync element
        let clock = command(
            TypeId::ClockSyncCommand,
            CauseOfTransmission::Activation,
            &[0, 0, 0],
        );
        assert_eq!(Command::decode(&clock, &params()), None);
    }

    #[test]
    fn test_typed_handler_receives_qualifier() {
        let dispatcher = Dispatcher::new(params());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_handler = seen.clone();
        dispatcher.set_interrogation_handler(Some(Arc::new(
            move |_: &MasterConnection, _: &Asdu, qoi: u8| {
                seen_in_handler.store(usize::from(qoi), Ordering::SeqCst);
                true
            },
        )));

        let connection = started_connection();
        let asdu = command(
            TypeId::InterrogationCommand,
            CauseOfTransmission::Activation,
            &[20],
        );
        assert_eq!(dispatcher.dispatch(&connection, &asdu), DispatchOutcome::Handled);
        assert_eq!(seen.load(Ordering::SeqCst), 20);
        assert_eq!(connection.pending_responses(), 0);
    }

    #[test]
    fn test_declining_typed_handler_falls_through_to_generic() {
        let dispatcher = Dispatcher::new(params());
        let generic_calls = Arc::new(AtomicUsize::new(0));
        let counter = generic_calls.clone();
        dispatcher.set_interrogation_handler(Some(Arc::new(
            |_: &MasterConnection, _: &Asdu, _: u8| false,
        )));
        dispatcher.set_asdu_handler(Some(Arc::new(
            move |_: &MasterConnection, asdu: &Asdu| {
                counter.fetch_add(1, Ordering::SeqCst);
                asdu.type_id() == Some(TypeId::InterrogationCommand)
            },
        )));

        let connection = started_connection();
        let asdu = command(
            TypeId::InterrogationCommand,
            CauseOfTransmission::Activation,
            &[20],
        );
        assert_eq!(dispatcher.dispatch(&connection, &asdu), DispatchOutcome::Handled);
        assert_eq!(generic_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unhandled_gets_negative_unknown_type() {
        let dispatcher = Dispatcher::new(params());
        let connection = started_connection();
        let asdu = command(
            TypeId::SingleCommand,
            CauseOfTransmission::Activation,
            &[0x01],
        );

        assert_eq!(
            dispatcher.dispatch(&connection, &asdu),
            DispatchOutcome::Unhandled
        );
        let response = connection.take_response().unwrap();
        assert!(response.is_negative());
        assert_eq!(
            response.cause(),
            Some(CauseOfTransmission::UnknownTypeIdentification)
        );
        assert_eq!(response.type_id(), Some(TypeId::SingleCommand));
        assert_eq!(response.objects(), asdu.objects());
    }

    #[test]
    fn test_wrong_cause_is_rejected_before_handlers() {
        let dispatcher = Dispatcher::new(params());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        dispatcher.set_asdu_handler(Some(Arc::new(move |_: &MasterConnection, _: &Asdu| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        })));

        let connection = started_connection();
        let asdu = command(
            TypeId::ClockSyncCommand,
            CauseOfTransmission::Spontaneous,
            &[0; 7],
        );
        assert_eq!(
            dispatcher.dispatch(&connection, &asdu),
            DispatchOutcome::UnknownCause
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let response = connection.take_response().unwrap();
        assert_eq!(
            response.cause(),
            Some(CauseOfTransmission::UnknownCauseOfTransmission)
        );
        assert!(response.is_negative());
    }

    #[test]
    fn test_handler_can_replace_handlers_while_dispatching() {
        let dispatcher = Arc::new(Dispatcher::new(params()));
        let inner = dispatcher.clone();
        dispatcher.set_reset_process_handler(Some(Arc::new(
            move |_: &MasterConnection, _: &Asdu, _: u8| {
                inner.set_reset_process_handler(None);
                true
            },
        )));

        let connection = started_connection();
        let asdu = command(
            TypeId::ResetProcessCommand,
            CauseOfTransmission::Activation,
            &[1],
        );
        assert_eq!(dispatcher.dispatch(&connection, &asdu), DispatchOutcome::Handled);
        assert_eq!(
            dispatcher.dispatch(&connection, &asdu),
            DispatchOutcome::Unhandled
        );
    }
}

//! Connection admission
//!
//! Each accepted socket must obtain an [`AdmissionPermit`] before any APCI
//! traffic. The permit holds one slot of `max_open_connections` and gives it
//! back when dropped, whatever way the connection ends.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::config::validate_max_connections;
use crate::error::{AdmissionRejection, IecResult};

/// Predicate deciding whether a peer may connect
pub trait ConnectionRequestHandler: Send + Sync {
    fn accept(&self, peer: SocketAddr) -> bool;
}

impl<F> ConnectionRequestHandler for F
where
    F: Fn(SocketAddr) -> bool + Send + Sync,
{
    fn accept(&self, peer: SocketAddr) -> bool {
        self(peer)
    }
}

/// One reserved connection slot
#[derive(Debug)]
pub struct AdmissionPermit {
    open: Arc<AtomicUsize>,
    peer: SocketAddr,
    admitted_at: DateTime<Utc>,
}

impl AdmissionPermit {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn admitted_at(&self) -> DateTime<Utc> {
        self.admitted_at
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct AdmissionController {
    max_open: AtomicUsize,
    open: Arc<AtomicUsize>,
    closed: AtomicBool,
    request_handler: RwLock<Option<Arc<dyn ConnectionRequestHandler>>>,
}

impl AdmissionController {
    pub fn new(max_open: usize) -> Self {
        Self {
            max_open: AtomicUsize::new(max_open),
            open: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            request_handler: RwLock::new(None),
        }
    }

    pub fn max_open_connections(&self) -> usize {
        self.max_open.load(Ordering::Acquire)
    }

    /// Lowering the limit does not close connections that are already open
    pub fn set_max_open_connections(&self, max_open: usize) -> IecResult<()> {
        validate_max_connections(max_open)?;
        self.max_open.store(max_open, Ordering::Release);
        Ok(())
    }

    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    pub fn set_request_handler(&self, handler: Option<Arc<dyn ConnectionRequestHandler>>) {
        *self.request_handler.write() = handler;
    }

    /// Refuse everything until [`reopen`](Self::reopen)
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }

    pub fn try_admit(&self, peer: SocketAddr) -> Result<AdmissionPermit, AdmissionRejection> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AdmissionRejection::ShuttingDown);
        }

        let limit = self.max_open_connections();
        self.open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < limit).then_some(open + 1)
            })
            .map_err(|_| AdmissionRejection::LimitReached { limit })?;
        let permit = AdmissionPermit {
            open: self.open.clone(),
            peer,
            admitted_at: Utc::now(),
        };

        let handler = self.request_handler.read().clone();
        if let Some(handler) = handler {
            if !handler.accept(peer) {
                return Err(AdmissionRejection::Declined { peer });
            }
        }
        Ok(permit)
    }
}

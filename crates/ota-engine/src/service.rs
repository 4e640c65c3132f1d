//! Async front end
//!
//! [`OtaService`] shares one [`OtaUpgrade`] between tasks. Attempts run on
//! the blocking pool; their events are fanned out over a broadcast channel
//! so any number of observers can follow along.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ota_errors::OtaError;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::backend::TransportBackend;
use crate::event::OtaEvent;
use crate::upgrade::{OtaUpgrade, UpgradeStatus};

/// Events buffered per subscriber before the slowest one starts lagging.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Shared handle to an upgrade engine.
#[derive(Clone)]
pub struct OtaService {
    engine: Arc<Mutex<OtaUpgrade>>,
    events: broadcast::Sender<OtaEvent>,
    cancel: Arc<AtomicBool>,
}

impl std::fmt::Debug for OtaService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtaService")
            .field("subscribers", &self.events.receiver_count())
            .field("busy", &self.engine.is_locked())
            .finish()
    }
}

impl OtaService {
    /// Wrap `engine`, routing its events to the service channel.
    pub fn new(mut engine: OtaUpgrade) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        engine.set_event_sink(Arc::new(events.clone()));
        let cancel = engine.cancel_handle();
        Self {
            engine: Arc::new(Mutex::new(engine)),
            events,
            cancel,
        }
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<OtaEvent> {
        self.events.subscribe()
    }

    /// Bind a transport for the next attempt.
    ///
    /// # Errors
    ///
    /// Returns [`OtaError::BackendBusy`] while a different transport is bound.
    pub fn attach_backend(&self, backend: Box<dyn TransportBackend>) -> Result<(), OtaError> {
        self.engine.lock().attach_backend(backend)
    }

    /// Release the bound transport.
    pub fn detach_backend(&self) -> Option<Box<dyn TransportBackend>> {
        self.engine.lock().detach_backend()
    }

    /// Run one upgrade attempt on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns the attempt's error, or [`OtaError::Aborted`] if the worker
    /// task was lost.
    pub async fn check(&self) -> Result<(), OtaError> {
        let engine = Arc::clone(&self.engine);
        info!("upgrade attempt scheduled");
        let joined = tokio::task::spawn_blocking(move || engine.lock().check()).await;
        match joined {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "upgrade worker lost");
                Err(OtaError::Aborted)
            }
        }
    }

    /// Abort the running attempt at its next transport read, or the next
    /// attempt when none is running. Safe to call from any task.
    pub fn cancel(&self) {
        debug!("cancel requested");
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Whether an upgrade owns the inactive bank. An engine busy with an
    /// attempt counts as in progress.
    pub fn is_in_progress(&self) -> bool {
        self.engine
            .try_lock()
            .is_none_or(|engine| engine.is_in_progress())
    }

    /// Journal snapshot, or `None` while an attempt holds the engine.
    pub fn status(&self) -> Option<UpgradeStatus> {
        self.engine.try_lock().map(|engine| engine.status())
    }

    /// Run `f` with exclusive access to the engine, waiting for any attempt
    /// in flight to finish.
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut OtaUpgrade) -> R) -> R {
        f(&mut self.engine.lock())
    }
}

//! Single-slot callback bindings for connection lifecycle events.
//!
//! Every slot holds exactly one handler, defaulting to a no-op. Registering a handler replaces
//! the previous one; there is no fan-out to multiple subscribers. Handlers run synchronously on
//! whichever task raised the event, so they should not block.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::Result;
use crate::error::{Error, InvalidCallback};
use crate::transport::Connector;

/// Invoked with `true` when a connection opens and `false` when it closes.
pub type StatusHandler = Arc<dyn Fn(bool) + Send + Sync>;
/// Invoked with every inbound chunk that is not a pong, unmodified.
pub type DataHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;
/// Invoked with the failure and the number of consecutive failed attempts so far.
pub type RetryHandler = Arc<dyn Fn(&Error, u32) + Send + Sync>;

/// A bindable slot on a [`ConnectionManager`](crate::ConnectionManager).
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Open,
    Close,
    Data,
    Retry,
    /// The connect capability used by every attempt
    Connector,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Close => write!(f, "close"),
            Self::Data => write!(f, "data"),
            Self::Retry => write!(f, "retry"),
            Self::Connector => write!(f, "connector"),
        }
    }
}

/// A type-erased handler, for wiring code that picks the slot at runtime.
///
/// Variants are shaped by the arguments they accept. A handler is only invokable for the
/// slots whose arguments match:
///
/// | Variant     | Slots             |
/// |-------------|-------------------|
/// | `Status`    | `Open`, `Close`   |
/// | `Data`      | `Data`            |
/// | `Retry`     | `Retry`           |
/// | `Connector` | `Connector`       |
#[non_exhaustive]
#[derive(Clone)]
pub enum Handler {
    Status(StatusHandler),
    Data(DataHandler),
    Retry(RetryHandler),
    Connector(Arc<dyn Connector>),
}

impl Handler {
    pub fn status<F: Fn(bool) + Send + Sync + 'static>(f: F) -> Self {
        Self::Status(Arc::new(f))
    }

    pub fn data<F: Fn(&[u8]) + Send + Sync + 'static>(f: F) -> Self {
        Self::Data(Arc::new(f))
    }

    pub fn retry<F: Fn(&Error, u32) + Send + Sync + 'static>(f: F) -> Self {
        Self::Retry(Arc::new(f))
    }

    pub fn connector<C: Connector + 'static>(connector: C) -> Self {
        Self::Connector(Arc::new(connector))
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Status(_) => "Status",
            Self::Data(_) => "Data",
            Self::Retry(_) => "Retry",
            Self::Connector(_) => "Connector",
        };
        f.debug_tuple("Handler").field(&name).finish()
    }
}

/// The four event bindings owned by a connection manager.
pub struct EventRegistry {
    open: Mutex<StatusHandler>,
    close: Mutex<StatusHandler>,
    data: Mutex<DataHandler>,
    retry: Mutex<RetryHandler>,
}

impl Default for EventRegistry {
    fn default() -> Self {
        let data: DataHandler = Arc::new(|_: &[u8]| {});
        let retry: RetryHandler = Arc::new(|_: &Error, _: u32| {});
        Self {
            open: Mutex::new(noop_status()),
            close: Mutex::new(noop_status()),
            data: Mutex::new(data),
            retry: Mutex::new(retry),
        }
    }
}

fn noop_status() -> StatusHandler {
    Arc::new(|_: bool| {})
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistry").finish_non_exhaustive()
    }
}

// The slots hold a single Arc with no intermediate state, so a poisoned lock is recovered.
fn replace<T>(slot: &Mutex<T>, value: T) {
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = value;
}

fn current<T: Clone>(slot: &Mutex<T>) -> T {
    slot.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

impl EventRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_open(&self, handler: StatusHandler) {
        replace(&self.open, handler);
    }

    pub fn set_close(&self, handler: StatusHandler) {
        replace(&self.close, handler);
    }

    pub fn set_data(&self, handler: DataHandler) {
        replace(&self.data, handler);
    }

    pub fn set_retry(&self, handler: RetryHandler) {
        replace(&self.retry, handler);
    }

    /// Bind `handler` to an event `slot`.
    ///
    /// Fails with [`InvalidCallback`] when the handler cannot be invoked with the slot's
    /// arguments. The existing binding is left untouched in that case.
    pub fn register(&self, slot: Slot, handler: Handler) -> Result<()> {
        match (slot, handler) {
            (Slot::Open, Handler::Status(f)) => self.set_open(f),
            (Slot::Close, Handler::Status(f)) => self.set_close(f),
            (Slot::Data, Handler::Data(f)) => self.set_data(f),
            (Slot::Retry, Handler::Retry(f)) => self.set_retry(f),
            (slot, _) => return Err(InvalidCallback { slot }.into()),
        }
        Ok(())
    }

    // Handlers are cloned out of their slot first so they may re-register or call back into
    // the manager without deadlocking.

    pub(crate) fn emit_open(&self, connected: bool) {
        current(&self.open)(connected);
    }

    pub(crate) fn emit_close(&self, connected: bool) {
        current(&self.close)(connected);
    }

    pub(crate) fn emit_data(&self, chunk: &[u8]) {
        current(&self.data)(chunk);
    }

    pub(crate) fn emit_retry(&self, error: &Error, attempt: u32) {
        current(&self.retry)(error, attempt);
    }
}

use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::io;

use crate::events::Slot;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Error related to an invalid argument or registration; never alters the connection state
    Validation,
    /// Error related to the state of the underlying connection
    Connection,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> Kind {
        self.kind
    }

    #[must_use]
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    #[must_use]
    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    #[must_use]
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    /// Returns `true` if this error is a [`ConnectionDown`].
    #[must_use]
    pub fn is_connection_down(&self) -> bool {
        self.downcast_ref::<ConnectionDown>().is_some()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// `connect` was called without options and there were none stored from a previous call.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionsNotProvided;

impl fmt::Display for OptionsNotProvided {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connect options were not provided")
    }
}

impl StdError for OptionsNotProvided {}

/// The socket is closed or was never opened, the message was not delivered.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionDown;

impl fmt::Display for ConnectionDown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection is down, message not delivered")
    }
}

impl StdError for ConnectionDown {}

/// A handler was registered on an event slot whose arguments it cannot accept.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidCallback {
    pub slot: Slot,
}

impl fmt::Display for InvalidCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provided callback is not invokable for event {}", self.slot)
    }
}

impl StdError for InvalidCallback {}

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidConnectHandler;

impl fmt::Display for InvalidConnectHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provided connect handler is not a connector")
    }
}

impl StdError for InvalidConnectHandler {}

/// The configured maximum number of connect attempts was reached.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetriesExhausted {
    pub attempts: u32,
}

impl fmt::Display for RetriesExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gave up connecting after {} attempts", self.attempts)
    }
}

impl StdError for RetriesExhausted {}

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyBeating;

impl fmt::Display for AlreadyBeating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "heartbeat is already running")
    }
}

impl StdError for AlreadyBeating {}

impl From<OptionsNotProvided> for Error {
    fn from(err: OptionsNotProvided) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

impl From<ConnectionDown> for Error {
    fn from(err: ConnectionDown) -> Self {
        Error::with_source(Kind::Connection, err)
    }
}

impl From<InvalidCallback> for Error {
    fn from(err: InvalidCallback) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

impl From<InvalidConnectHandler> for Error {
    fn from(err: InvalidConnectHandler) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

impl From<RetriesExhausted> for Error {
    fn from(err: RetriesExhausted) -> Self {
        Error::with_source(Kind::Connection, err)
    }
}

impl From<AlreadyBeating> for Error {
    fn from(err: AlreadyBeating) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::with_source(Kind::Connection, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_down_display_should_succeed() {
        let error: Error = ConnectionDown.into();

        assert_eq!(error.kind(), Kind::Connection);
        assert_eq!(
            error.to_string(),
            "Connection: connection is down, message not delivered"
        );
        assert!(error.is_connection_down(), "should downcast to ConnectionDown");
    }

    #[test]
    fn invalid_callback_names_the_slot() {
        let error: Error = InvalidCallback { slot: Slot::Retry }.into();

        assert_eq!(error.kind(), Kind::Validation);
        assert!(error.to_string().contains("retry"), "got {error}");
        assert_eq!(
            error.downcast_ref::<InvalidCallback>(),
            Some(&InvalidCallback { slot: Slot::Retry })
        );
    }

    #[test]
    fn io_error_is_a_connection_error() {
        let error: Error = io::Error::from(io::ErrorKind::ConnectionRefused).into();

        assert_eq!(error.kind(), Kind::Connection);
        assert!(!error.is_connection_down(), "io errors are not ConnectionDown");
        assert!(error.downcast_ref::<io::Error>().is_some(), "source is io::Error");
    }

    #[test]
    fn each_error_reports_its_kind() {
        let cases: [(Error, Kind); 6] = [
            (OptionsNotProvided.into(), Kind::Validation),
            (InvalidCallback { slot: Slot::Data }.into(), Kind::Validation),
            (InvalidConnectHandler.into(), Kind::Validation),
            (AlreadyBeating.into(), Kind::Validation),
            (ConnectionDown.into(), Kind::Connection),
            (RetriesExhausted { attempts: 3 }.into(), Kind::Connection),
        ];

        for (error, kind) in cases {
            assert_eq!(error.kind(), kind, "{error}");
        }
    }
}

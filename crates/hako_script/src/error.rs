use crate::exception::GuestError;
use crate::ffi::{ClassId, ContextId, RawRef};
use hako_memory::MemoryError;
use std::thread::ThreadId;
use thiserror::Error;

/// Errors surfaced by the bridge.
///
/// `Guest` carries a thrown guest value and is an expected outcome callers
/// branch on. Every other variant except `Cancelled` and `Marshaling` points at
/// a host programming error or a bridge defect.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("guest exception: {0}")]
    Guest(GuestError),

    #[error("handle {raw:?} was used after it was released")]
    UseAfterRelease { raw: RawRef },

    #[error("cannot marshal value: {reason}")]
    Marshaling { reason: String },

    #[error("guest object violates the {protocol} protocol: {reason}")]
    ProtocolViolation {
        protocol: &'static str,
        reason: String,
    },

    #[error("value is not iterable")]
    NotIterable,

    #[error("value is not an instance of class {class}")]
    NotInstance { class: ClassId },

    #[error("bridge integrity violated: {0}")]
    BridgeIntegrity(String),

    #[error("guest accessed from thread {actual:?} but the runtime is bound to {expected:?}")]
    AffinityViolation { expected: ThreadId, actual: ThreadId },

    #[error("execution context {0} has been disposed")]
    ContextDisposed(ContextId),

    #[error("wait for a deferred value was cancelled")]
    Cancelled,

    #[error("engine thread has stopped")]
    EngineStopped,

    #[error("engine thread failed to start: {0}")]
    Startup(String),

    #[error("guest memory: {0}")]
    Memory(#[from] MemoryError),

    #[error("engine error: {0}")]
    Engine(#[from] rquickjs::Error),
}

impl BridgeError {
    pub(crate) fn marshaling(reason: impl Into<String>) -> Self {
        BridgeError::Marshaling {
            reason: reason.into(),
        }
    }

    pub(crate) fn integrity(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        tracing::error!(%reason, "bridge integrity violation");
        BridgeError::BridgeIntegrity(reason)
    }

    pub(crate) fn protocol(protocol: &'static str, reason: impl Into<String>) -> Self {
        BridgeError::ProtocolViolation {
            protocol,
            reason: reason.into(),
        }
    }

    /// Host programming errors and bridge defects, as opposed to guest
    /// misbehaviour or expected runtime conditions.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::UseAfterRelease { .. }
                | BridgeError::BridgeIntegrity(_)
                | BridgeError::AffinityViolation { .. }
                | BridgeError::ContextDisposed(_)
        )
    }

    pub fn as_guest(&self) -> Option<&GuestError> {
        match self {
            BridgeError::Guest(error) => Some(error),
            _ => None,
        }
    }

    pub fn into_guest(self) -> Option<GuestError> {
        match self {
            BridgeError::Guest(error) => Some(error),
            _ => None,
        }
    }
}

/// Failure reported by a host callback, rethrown into the guest.
#[derive(Debug, Error)]
pub enum HostError {
    /// Thrown as a fresh guest `Error` with the given name and message.
    #[error("{name}: {message}")]
    Message { name: String, message: String },

    /// Rethrows the original guest value.
    #[error(transparent)]
    Guest(GuestError),

    #[error(transparent)]
    Bridge(BridgeError),
}

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::named("Error", message)
    }

    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        HostError::Message {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::named("TypeError", message)
    }
}

impl From<BridgeError> for HostError {
    fn from(error: BridgeError) -> Self {
        match error {
            BridgeError::Guest(guest) => HostError::Guest(guest),
            other => HostError::Bridge(other),
        }
    }
}

impl From<GuestError> for HostError {
    fn from(error: GuestError) -> Self {
        HostError::Guest(error)
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

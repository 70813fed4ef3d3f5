//! Error/exception bridge
//!
//! Guest exceptions are captured as disposable failure handles. Their details
//! are dumped once, at capture time, so reading them later needs no further
//! guest calls. Host failures travel the other way as freshly built guest
//! `Error` objects.

use crate::context::ExecutionContext;
use crate::error::{BridgeError, HostError};
use crate::handle::ValueHandle;
use rquickjs::{Ctx, Function, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured view of a thrown guest value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub cause: Option<Box<ErrorDetails>>,
}

impl ErrorDetails {
    pub(crate) fn unavailable() -> Self {
        Self {
            name: "Error".to_string(),
            message: "<error details unavailable>".to_string(),
            stack: None,
            cause: None,
        }
    }
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

/// A thrown guest value together with its extracted details.
pub struct GuestError {
    handle: ValueHandle,
    details: ErrorDetails,
}

impl GuestError {
    /// Wrap an existing handle, dumping its details now.
    pub fn from_handle(handle: ValueHandle) -> Result<Self, BridgeError> {
        let details = handle.context().error_details(&handle)?;
        Ok(Self { handle, details })
    }

    pub fn handle(&self) -> &ValueHandle {
        &self.handle
    }

    pub fn into_handle(self) -> ValueHandle {
        self.handle
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn name(&self) -> &str {
        &self.details.name
    }

    pub fn message(&self) -> &str {
        &self.details.message
    }

    pub fn stack(&self) -> Option<&str> {
        self.details.stack.as_deref()
    }

    pub fn dispose(&self) {
        self.handle.dispose();
    }
}

impl fmt::Debug for GuestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestError")
            .field("raw", &self.handle.raw())
            .field("details", &self.details)
            .finish()
    }
}

impl fmt::Display for GuestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.details.fmt(f)
    }
}

impl std::error::Error for GuestError {}

/// Turn a thrown value into a failure handle.
pub(crate) fn capture<'js>(
    context: &ExecutionContext,
    ctx: &Ctx<'js>,
    thrown: Value<'js>,
) -> BridgeError {
    let details = dump(context, ctx, thrown.clone());
    match context.adopt(ctx, thrown) {
        Ok(handle) => BridgeError::Guest(GuestError { handle, details }),
        Err(error) => error,
    }
}

/// Produce details for a thrown value without ever failing.
///
/// The guest writes a JSON dump which is parsed on the host side.
pub(crate) fn dump<'js>(context: &ExecutionContext, ctx: &Ctx<'js>, thrown: Value<'js>) -> ErrorDetails {
    let json = context
        .intrinsic(ctx, "dump")
        .ok()
        .and_then(|dump| dump.call::<_, String>((thrown,)).ok());

    let Some(json) = json else {
        // Dumping threw (hostile getters); drop that secondary exception.
        let _ = ctx.catch();
        return ErrorDetails::unavailable();
    };

    match serde_json::from_str::<ErrorDetails>(&json) {
        Ok(details) => details,
        Err(error) => {
            tracing::warn!(%error, "malformed guest error dump");
            ErrorDetails::unavailable()
        }
    }
}

/// Convert engine results into bridge results, capturing pending exceptions.
pub(crate) trait GuestResultExt<T> {
    fn or_guest<'js>(self, context: &ExecutionContext, ctx: &Ctx<'js>) -> Result<T, BridgeError>;
}

impl<T> GuestResultExt<T> for rquickjs::Result<T> {
    fn or_guest<'js>(self, context: &ExecutionContext, ctx: &Ctx<'js>) -> Result<T, BridgeError> {
        match self {
            Ok(value) => Ok(value),
            Err(rquickjs::Error::Exception) => Err(capture(context, ctx, ctx.catch())),
            Err(error) => Err(BridgeError::Engine(error)),
        }
    }
}

/// Throw a host failure into the guest.
pub(crate) fn throw_host<'js>(
    context: &ExecutionContext,
    ctx: &Ctx<'js>,
    error: HostError,
) -> rquickjs::Error {
    let value = match error {
        HostError::Guest(guest) => context.value_of(ctx, guest.handle.raw()),
        HostError::Message { name, message } => new_error(context, ctx, &name, &message),
        HostError::Bridge(bridge) => new_error(context, ctx, "InternalError", &bridge.to_string()),
    };
    match value {
        Ok(value) => ctx.throw(value),
        Err(error) => {
            tracing::error!(%error, "could not build guest error for host failure");
            rquickjs::Error::Exception
        }
    }
}

pub(crate) fn new_error<'js>(
    context: &ExecutionContext,
    ctx: &Ctx<'js>,
    name: &str,
    message: &str,
) -> Result<Value<'js>, BridgeError> {
    let make: Function<'js> = context.intrinsic(ctx, "makeError")?;
    make.call::<_, Value>((name, message)).or_guest(context, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn details_parse_with_nested_cause() {
        let json = r#"{"name":"TypeError","message":"outer","stack":null,
            "cause":{"name":"Error","message":"inner","stack":"at f"}}"#;
        let details: ErrorDetails = serde_json::from_str(json).unwrap();
        assert_eq!(details.to_string(), "TypeError: outer");
        let cause = details.cause.unwrap();
        assert_eq!(cause.message, "inner");
        assert_eq!(cause.stack.as_deref(), Some("at f"));
    }

    #[test]
    fn empty_message_displays_name_only() {
        let details = ErrorDetails {
            name: "AbortError".into(),
            message: String::new(),
            stack: None,
            cause: None,
        };
        assert_eq!(details.to_string(), "AbortError");
    }
}

//! Hako Script Bridge
//!
//! Host-side bridge to an embedded JavaScript engine:
//! - Reference-counted value handles with explicit release
//! - Host value marshaling in both directions
//! - Guest exceptions as typed errors
//! - Host functions and host-defined classes callable from the guest
//! - Source and bytecode evaluation, ES modules with pluggable loaders
//! - Deferred values, promise awaiting and iterator protocols
//! - Thread affinity checks and a dedicated engine thread
//!
//! Everything except [`EngineThread`] is bound to the thread that created
//! its [`Runtime`].

pub mod affinity;
pub mod callbacks;
pub mod class;
pub mod config;
pub mod context;
pub mod deferred;
pub mod dispatch;
pub mod error;
pub mod eval;
pub mod exception;
pub mod factory;
pub mod ffi;
pub mod handle;
mod heap;
mod intrinsics;
pub mod iterator;
pub mod loader;
pub mod runtime;
mod scope;

pub use affinity::ThreadAffinity;
pub use callbacks::{CallFrame, HostFunction};
pub use class::{ClassConstructor, ClassDescriptor, ClassHook, ClassOptions, ConstructFrame};
pub use config::RuntimeConfig;
pub use context::{ContextOptions, ExecutionContext, Intrinsics};
pub use deferred::{DeferredValue, PromiseState};
pub use dispatch::EngineThread;
pub use error::{BridgeError, HostError, Result};
pub use eval::{strip_source_annotations, Bytecode, EvalOptions, EvalType};
pub use exception::{ErrorDetails, GuestError};
pub use factory::{Bytes, Conversion, Converted, FromGuest, GuestFunction, HostList, HostMap, HostValue};
pub use ffi::{ClassId, ContextId, OpaqueId, RawRef, RuntimeId};
pub use handle::{EqualityOp, Lifecycle, PropertyDescriptor, PropertyKey, TypedArrayKind, ValueHandle, ValueType};
pub use iterator::{AsyncGuestIterator, GuestIterator};
pub use loader::{normalize_module_name, ModuleLoader, ModuleRequest, ModuleSource, StaticModuleLoader};
pub use hako_memory::{Address, LinearMemory, MemoryError};
pub use runtime::{MemoryStats, Runtime};

/// Bridge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

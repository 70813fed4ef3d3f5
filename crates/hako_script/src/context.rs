//! Execution contexts
//!
//! One context is one guest global scope plus the host bookkeeping around it:
//! the value heap backing its handles, the captured intrinsics, the set of
//! tracked handles that are force-released at teardown, and an optional
//! piece of host data.

use crate::affinity::ThreadAffinity;
use crate::error::{BridgeError, Result};
use crate::exception::{self, ErrorDetails, GuestResultExt};
use crate::ffi::{ContextId, RawRef, RuntimeId};
use crate::handle::ValueHandle;
use crate::heap::ValueHeap;
use crate::intrinsics;
use crate::runtime::{RuntimeInner, Stats};
use crate::scope::{self, Lookup};
use hako_memory::{Address, LinearMemory, MemoryError};
use rquickjs::context::intrinsic;
use rquickjs::{Ctx, Function, Object, Persistent, Value};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::fmt;
use std::rc::{Rc, Weak};

/// Which built-in objects a new context receives.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intrinsics {
    /// Everything the engine offers.
    #[default]
    Full,
    /// Base objects plus what the bridge itself needs: eval, Date, JSON,
    /// Promise and typed arrays.
    Minimal,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContextOptions {
    #[serde(default)]
    pub intrinsics: Intrinsics,
}

pub(crate) struct ContextInner {
    id: ContextId,
    runtime_id: RuntimeId,
    runtime: Weak<RuntimeInner>,
    affinity: ThreadAffinity,
    disposed: Cell<bool>,
    heap: RefCell<ValueHeap>,
    tracked: RefCell<BTreeSet<RawRef>>,
    data: RefCell<Option<Box<dyn Any>>>,
    stats: Stats,
    intrinsics: RefCell<Option<Persistent<Object<'static>>>>,
    engine: RefCell<Option<rquickjs::Context>>,
}

/// Shared handle to one guest global scope.
///
/// Cloning is cheap; all clones refer to the same context. Contexts are owned
/// by their runtime and stay usable until [`ExecutionContext::dispose`] or
/// runtime teardown.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Rc<ContextInner>,
}

/// Non-owning reference used by guest closures so they do not keep a
/// context alive on their own.
#[derive(Clone)]
pub(crate) struct WeakContext {
    inner: Weak<ContextInner>,
}

impl WeakContext {
    pub fn upgrade(&self) -> Option<ExecutionContext> {
        self.inner.upgrade().map(|inner| ExecutionContext { inner })
    }
}

impl ExecutionContext {
    pub(crate) fn create(runtime: &Rc<RuntimeInner>, options: ContextOptions) -> Result<Self> {
        let engine = match options.intrinsics {
            Intrinsics::Full => rquickjs::Context::full(runtime.engine())?,
            Intrinsics::Minimal => rquickjs::Context::custom::<(
                intrinsic::Eval,
                intrinsic::Date,
                intrinsic::Json,
                intrinsic::Promise,
                intrinsic::TypedArrays,
            )>(runtime.engine())?,
        };

        let helpers = engine.with(|ctx| -> Result<Persistent<Object<'static>>> {
            let helpers: Object = ctx.eval(intrinsics::SOURCE).map_err(|error| {
                let _ = ctx.catch();
                BridgeError::integrity(format!("failed to install guest intrinsics: {error}"))
            })?;
            Ok(Persistent::save(&ctx, helpers))
        })?;

        let id = ContextId::next();
        tracing::debug!(context = %id, runtime = %runtime.id(), ?options, "context created");

        Ok(Self {
            inner: Rc::new(ContextInner {
                id,
                runtime_id: runtime.id(),
                runtime: Rc::downgrade(runtime),
                affinity: runtime.affinity(),
                disposed: Cell::new(false),
                heap: RefCell::new(ValueHeap::new()),
                tracked: RefCell::new(BTreeSet::new()),
                data: RefCell::new(None),
                stats: runtime.stats().clone(),
                intrinsics: RefCell::new(Some(helpers)),
                engine: RefCell::new(Some(engine)),
            }),
        })
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn runtime_id(&self) -> RuntimeId {
        self.inner.runtime_id
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    pub(crate) fn downgrade(&self) -> WeakContext {
        WeakContext {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub(crate) fn runtime(&self) -> Result<Rc<RuntimeInner>> {
        self.inner
            .runtime
            .upgrade()
            .ok_or(BridgeError::ContextDisposed(self.inner.id))
    }

    pub(crate) fn affinity(&self) -> ThreadAffinity {
        self.inner.affinity
    }

    pub(crate) fn stats(&self) -> &Stats {
        &self.inner.stats
    }

    /// Run `f` inside the engine lock for this context.
    ///
    /// When called from a guest→host callback of this context, the already
    /// entered engine handle is reused instead of locking again.
    pub(crate) fn enter<R>(&self, f: impl for<'js> FnOnce(&Ctx<'js>) -> Result<R>) -> Result<R> {
        self.inner.affinity.check()?;
        if self.inner.disposed.get() {
            return Err(BridgeError::ContextDisposed(self.inner.id));
        }

        match scope::lookup(self.inner.runtime_id, self.inner.id) {
            Lookup::Entered(ctx) => f(&ctx),
            Lookup::Locked => Err(BridgeError::integrity(format!(
                "context {} touched while another context of runtime {} is entered",
                self.inner.id, self.inner.runtime_id
            ))),
            Lookup::Free => {
                let engine = self
                    .inner
                    .engine
                    .borrow()
                    .clone()
                    .ok_or(BridgeError::ContextDisposed(self.inner.id))?;
                engine.with(|ctx| {
                    let _scope = scope::push(self.inner.runtime_id, self.inner.id, &ctx);
                    f(&ctx)
                })
            }
        }
    }

    pub(crate) fn owns_engine(&self, engine: &rquickjs::Context) -> bool {
        self.inner
            .engine
            .borrow()
            .as_ref()
            .is_some_and(|own| own.as_raw() == engine.as_raw())
    }

    pub(crate) fn intrinsic<'js>(&self, ctx: &Ctx<'js>, name: &str) -> Result<Function<'js>> {
        let helpers = self
            .inner
            .intrinsics
            .borrow()
            .clone()
            .ok_or(BridgeError::ContextDisposed(self.inner.id))?;
        let helpers = helpers.restore(ctx)?;
        helpers
            .get::<_, Function>(name)
            .map_err(|_| BridgeError::integrity(format!("missing guest intrinsic `{name}`")))
    }

    // ------------------------------------------------------------------
    // Raw reference bookkeeping
    // ------------------------------------------------------------------

    pub(crate) fn value_of<'js>(&self, ctx: &Ctx<'js>, raw: RawRef) -> Result<Value<'js>> {
        match raw {
            RawRef::UNDEFINED => Ok(Value::new_undefined(ctx.clone())),
            RawRef::NULL => Ok(Value::new_null(ctx.clone())),
            RawRef::FALSE => Ok(Value::new_bool(ctx.clone(), false)),
            RawRef::TRUE => Ok(Value::new_bool(ctx.clone(), true)),
            _ => {
                let slot = self.inner.heap.borrow().get(raw);
                match slot {
                    Some(slot) => Ok(slot.restore(ctx)?),
                    None => {
                        tracing::error!(context = %self.inner.id, ?raw, "raw reference has no live slot");
                        Err(BridgeError::UseAfterRelease { raw })
                    }
                }
            }
        }
    }

    /// Store a value and hand back its raw reference. Singletons map to
    /// their fixed references and never take a slot.
    pub(crate) fn store<'js>(&self, ctx: &Ctx<'js>, value: Value<'js>) -> Result<RawRef> {
        if value.is_undefined() {
            return Ok(RawRef::UNDEFINED);
        }
        if value.is_null() {
            return Ok(RawRef::NULL);
        }
        if let Some(flag) = value.as_bool() {
            return Ok(RawRef::boolean(flag));
        }
        let raw = self.inner.heap.borrow_mut().store(ctx, value)?;
        self.allocated(raw);
        Ok(raw)
    }

    pub(crate) fn adopt<'js>(&self, ctx: &Ctx<'js>, value: Value<'js>) -> Result<ValueHandle> {
        let raw = self.store(ctx, value)?;
        Ok(self.handle_for(raw))
    }

    pub(crate) fn handle_for(&self, raw: RawRef) -> ValueHandle {
        if raw.is_singleton() {
            ValueHandle::borrowed(self.clone(), raw)
        } else {
            ValueHandle::owned(self.clone(), raw)
        }
    }

    /// New Owned handle sharing the value behind `raw`.
    pub(crate) fn duplicate(&self, raw: RawRef) -> Result<ValueHandle> {
        if self.inner.disposed.get() {
            return Err(BridgeError::ContextDisposed(self.inner.id));
        }
        let slot = self
            .inner
            .heap
            .borrow()
            .get(raw)
            .ok_or(BridgeError::UseAfterRelease { raw })?;
        let copy = self.inner.heap.borrow_mut().insert(slot)?;
        self.allocated(copy);
        Ok(ValueHandle::owned(self.clone(), copy))
    }

    fn allocated(&self, raw: RawRef) {
        tracing::trace!(context = %self.inner.id, ?raw, "handle allocated");
        hako_metrics::metrics! {
            self.inner.stats.borrow_mut().increment("handles.allocated", 1);
        }
    }

    pub(crate) fn release(&self, raw: RawRef) {
        // The slot is dropped after the heap borrow ends: releasing the last
        // engine reference can run finalizers that come back here.
        let slot = self.inner.heap.borrow_mut().remove(raw);
        self.inner.tracked.borrow_mut().remove(&raw);
        if slot.is_some() {
            tracing::trace!(context = %self.inner.id, ?raw, "handle released");
            hako_metrics::metrics! {
                self.inner.stats.borrow_mut().increment("handles.released", 1);
            }
        }
        drop(slot);
    }

    pub(crate) fn same_context(&self, handle: &ValueHandle) -> Result<()> {
        if handle.context().id() == self.inner.id {
            Ok(())
        } else {
            Err(BridgeError::integrity(format!(
                "handle {:?} of context {} used with context {}",
                handle.raw(),
                handle.context().id(),
                self.inner.id
            )))
        }
    }

    pub(crate) fn error_details(&self, handle: &ValueHandle) -> Result<ErrorDetails> {
        self.same_context(handle)?;
        self.enter(|ctx| {
            let value = handle.value(ctx)?;
            Ok(exception::dump(self, ctx, value))
        })
    }

    pub(crate) fn with_memory<R>(
        &self,
        f: impl FnOnce(&mut LinearMemory) -> std::result::Result<R, MemoryError>,
    ) -> Result<R> {
        let runtime = self.runtime()?;
        runtime.with_memory(f)
    }

    /// Number of live heap slots, i.e. engine references held by the host.
    pub fn live_handle_count(&self) -> usize {
        self.inner.heap.borrow().len()
    }

    // ------------------------------------------------------------------
    // Primitive values
    // ------------------------------------------------------------------

    pub fn undefined(&self) -> ValueHandle {
        ValueHandle::borrowed(self.clone(), RawRef::UNDEFINED)
    }

    pub fn null(&self) -> ValueHandle {
        ValueHandle::borrowed(self.clone(), RawRef::NULL)
    }

    pub fn boolean(&self, value: bool) -> ValueHandle {
        ValueHandle::borrowed(self.clone(), RawRef::boolean(value))
    }

    pub fn new_number(&self, value: f64) -> Result<ValueHandle> {
        self.enter(|ctx| self.adopt(ctx, Value::new_number(ctx.clone(), value)))
    }

    pub fn new_string(&self, value: &str) -> Result<ValueHandle> {
        self.enter(|ctx| {
            let string = rquickjs::String::from_str(ctx.clone(), value)?;
            self.adopt(ctx, string.into_value())
        })
    }

    pub fn new_bigint(&self, value: i64) -> Result<ValueHandle> {
        self.enter(|ctx| {
            let bigint = rquickjs::BigInt::from_i64(ctx.clone(), value)?;
            self.adopt(ctx, bigint.into_value())
        })
    }

    pub fn new_biguint(&self, value: u64) -> Result<ValueHandle> {
        self.enter(|ctx| {
            let bigint = rquickjs::BigInt::from_u64(ctx.clone(), value)?;
            self.adopt(ctx, bigint.into_value())
        })
    }

    pub fn new_object(&self) -> Result<ValueHandle> {
        self.enter(|ctx| self.adopt(ctx, Object::new(ctx.clone())?.into_value()))
    }

    pub fn new_array(&self) -> Result<ValueHandle> {
        self.enter(|ctx| self.adopt(ctx, rquickjs::Array::new(ctx.clone())?.into_value()))
    }

    pub fn new_array_buffer(&self, bytes: &[u8]) -> Result<ValueHandle> {
        self.enter(|ctx| {
            let buffer = rquickjs::ArrayBuffer::new_copy(ctx.clone(), bytes)?;
            self.adopt(ctx, buffer.into_value())
        })
    }

    /// An `ArrayBuffer` holding a copy of `len` bytes of linear memory at
    /// `addr`.
    pub fn new_array_buffer_from_memory(&self, addr: Address, len: usize) -> Result<ValueHandle> {
        let bytes = self.with_memory(|memory| memory.slice(addr, len))?;
        self.new_array_buffer(&bytes)
    }

    /// A fresh symbol, or the registry symbol for `description` when
    /// `global` is set.
    pub fn new_symbol(&self, description: &str, global: bool) -> Result<ValueHandle> {
        self.enter(|ctx| {
            let helper = self.intrinsic(ctx, "symbol")?;
            let symbol: Value = helper.call((description, global)).or_guest(self, ctx)?;
            self.adopt(ctx, symbol)
        })
    }

    pub fn new_error(&self, name: &str, message: &str) -> Result<ValueHandle> {
        self.enter(|ctx| {
            let error = exception::new_error(self, ctx, name, message)?;
            self.adopt(ctx, error)
        })
    }

    /// A guest `Date` at `millis` since the epoch.
    pub fn new_date(&self, millis: f64) -> Result<ValueHandle> {
        self.enter(|ctx| {
            let helper = self.intrinsic(ctx, "makeDate")?;
            let date: Value = helper.call((millis,)).or_guest(self, ctx)?;
            self.adopt(ctx, date)
        })
    }

    // ------------------------------------------------------------------
    // Globals and host data
    // ------------------------------------------------------------------

    pub fn global_object(&self) -> Result<ValueHandle> {
        self.enter(|ctx| self.adopt(ctx, ctx.globals().into_value()))
    }

    pub fn get_global(&self, name: &str) -> Result<ValueHandle> {
        self.enter(|ctx| {
            let value: Value = ctx.globals().get(name).or_guest(self, ctx)?;
            self.adopt(ctx, value)
        })
    }

    pub fn set_global(&self, name: &str, value: &ValueHandle) -> Result<()> {
        self.same_context(value)?;
        self.enter(|ctx| {
            let value = value.value(ctx)?;
            ctx.globals().set(name, value).or_guest(self, ctx)
        })
    }

    /// Attach host data to this context, replacing any previous value. It is
    /// dropped at teardown.
    pub fn set_context_data<T: Any>(&self, data: T) {
        let previous = self.inner.data.borrow_mut().replace(Box::new(data));
        drop(previous);
    }

    pub fn context_data<T: Any, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let data = self.inner.data.borrow();
        data.as_ref()
            .and_then(|data| data.downcast_ref::<T>())
            .map(f)
    }

    pub fn take_context_data<T: Any>(&self) -> Option<T> {
        let data = self.inner.data.borrow_mut().take()?;
        match data.downcast::<T>() {
            Ok(data) => Some(*data),
            Err(other) => {
                *self.inner.data.borrow_mut() = Some(other);
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    /// Call `function`. A missing `this` becomes `undefined`.
    pub fn invoke(
        &self,
        function: &ValueHandle,
        this: Option<&ValueHandle>,
        args: &[&ValueHandle],
    ) -> Result<ValueHandle> {
        self.same_context(function)?;
        let undefined;
        let this = match this {
            Some(this) => {
                self.same_context(this)?;
                this
            }
            None => {
                undefined = self.undefined();
                &undefined
            }
        };
        for arg in args {
            self.same_context(arg)?;
        }

        self.enter(|ctx| {
            let function = function.value(ctx)?;
            let this = this.value(ctx)?;
            let list = self.argument_list(ctx, args)?;
            let apply = self.intrinsic(ctx, "apply")?;
            let result: Value = apply.call((function, this, list)).or_guest(self, ctx)?;
            self.adopt(ctx, result)
        })
    }

    /// `new constructor(...args)`
    pub fn construct(&self, constructor: &ValueHandle, args: &[&ValueHandle]) -> Result<ValueHandle> {
        self.same_context(constructor)?;
        for arg in args {
            self.same_context(arg)?;
        }
        self.enter(|ctx| {
            let constructor = constructor.value(ctx)?;
            let list = self.argument_list(ctx, args)?;
            let construct = self.intrinsic(ctx, "construct")?;
            let result: Value = construct.call((constructor, list)).or_guest(self, ctx)?;
            self.adopt(ctx, result)
        })
    }

    fn argument_list<'js>(&self, ctx: &Ctx<'js>, args: &[&ValueHandle]) -> Result<rquickjs::Array<'js>> {
        let list = rquickjs::Array::new(ctx.clone())?;
        for (index, arg) in args.iter().enumerate() {
            list.set(index, arg.value(ctx)?)?;
        }
        Ok(list)
    }

    // ------------------------------------------------------------------
    // Tracking and teardown
    // ------------------------------------------------------------------

    /// Register `handle` for forced release at teardown.
    pub fn track(&self, handle: &ValueHandle) -> Result<()> {
        self.same_context(handle)?;
        if handle.raw().is_singleton() || handle.lifecycle() == crate::Lifecycle::Borrowed {
            return Err(BridgeError::integrity(format!(
                "borrowed handle {:?} cannot be tracked",
                handle.raw()
            )));
        }
        if !handle.is_alive() {
            return Err(BridgeError::UseAfterRelease { raw: handle.raw() });
        }
        if !self.inner.tracked.borrow_mut().insert(handle.raw()) {
            return Err(BridgeError::integrity(format!(
                "handle {:?} is already tracked",
                handle.raw()
            )));
        }
        Ok(())
    }

    pub fn untrack(&self, handle: &ValueHandle) -> Result<()> {
        self.same_context(handle)?;
        if !self.inner.tracked.borrow_mut().remove(&handle.raw()) {
            return Err(BridgeError::integrity(format!(
                "handle {:?} is not tracked",
                handle.raw()
            )));
        }
        Ok(())
    }

    pub fn is_tracked(&self, handle: &ValueHandle) -> bool {
        self.inner.tracked.borrow().contains(&handle.raw())
    }

    /// Run pending guest jobs of this context's runtime.
    pub fn execute_pending_jobs(&self, max: Option<usize>) -> Result<usize> {
        self.runtime()?.execute_pending_jobs(max)
    }

    /// Tear the context down: release tracked and leaked handles, drop host
    /// callbacks and context data, and free the guest context. Idempotent.
    pub fn dispose(&self) -> Result<()> {
        if self.inner.disposed.get() {
            return Ok(());
        }
        self.inner.affinity.check()?;
        if scope::is_locked(self.inner.runtime_id) {
            return Err(BridgeError::integrity(format!(
                "context {} cannot be disposed from inside a guest callback",
                self.inner.id
            )));
        }
        self.teardown(self.inner.runtime.upgrade().as_deref());
        Ok(())
    }

    /// Release everything. `runtime` is `None` while the runtime itself is
    /// being dropped.
    pub(crate) fn teardown(&self, runtime: Option<&RuntimeInner>) {
        if self.inner.disposed.replace(true) {
            return;
        }
        let id = self.inner.id;

        let tracked = std::mem::take(&mut *self.inner.tracked.borrow_mut());
        let slots = self.inner.heap.borrow_mut().drain();
        let forced = slots.iter().filter(|(raw, _)| tracked.contains(raw)).count();
        let leaked = slots.len() - forced;
        if forced > 0 {
            tracing::warn!(context = %id, count = forced, "force-releasing tracked handles");
        }
        if leaked > 0 {
            tracing::warn!(context = %id, count = leaked, "releasing handles still held at teardown");
        }
        hako_metrics::metrics! {
            self.inner.stats.borrow_mut().increment("handles.released", slots.len());
        }

        let callbacks = runtime.map(|runtime| runtime.forget_context(id));
        let data = self.inner.data.borrow_mut().take();
        let helpers = self.inner.intrinsics.borrow_mut().take();

        drop(callbacks);
        drop(data);
        drop(slots);
        drop(helpers);

        let engine = self.inner.engine.borrow_mut().take();
        drop(engine);
        tracing::debug!(context = %id, "context disposed");
    }
}

impl PartialEq for ExecutionContext {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ExecutionContext {}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.inner.id)
            .field("runtime", &self.inner.runtime_id)
            .field("disposed", &self.inner.disposed.get())
            .field("live_handles", &self.live_handle_count())
            .finish()
    }
}

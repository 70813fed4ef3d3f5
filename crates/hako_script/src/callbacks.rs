//! Host callback registry
//!
//! Host functions never cross the boundary. The guest sees a trampoline
//! that carries only a `CallbackKey`; dispatch looks the key up in a flat
//! table owned by the runtime. Keys are built from the process-unique
//! context id, so two live runtimes can never route a call to each other.

use crate::context::ExecutionContext;
use crate::error::{BridgeError, HostError, Result};
use crate::exception::{self, GuestError, GuestResultExt};
use crate::factory::HostValue;
use crate::ffi::{CallbackKey, ContextId, FunctionId};
use crate::handle::ValueHandle;
use crate::runtime::RuntimeInner;
use crate::scope;
use rquickjs::function::{Rest, This};
use rquickjs::{Ctx, Function, Value};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

/// A host function callable from the guest.
pub type HostFunction = Rc<dyn Fn(&CallFrame<'_>) -> std::result::Result<ValueHandle, HostError>>;

/// Arguments of one guest→host call.
///
/// `this` and the arguments are Owned handles released when the call
/// returns; `dup` them to keep a value past the call.
pub struct CallFrame<'a> {
    context: &'a ExecutionContext,
    this: ValueHandle,
    args: Vec<ValueHandle>,
}

impl<'a> CallFrame<'a> {
    pub fn context(&self) -> &'a ExecutionContext {
        self.context
    }

    pub fn this(&self) -> &ValueHandle {
        &self.this
    }

    pub fn args(&self) -> &[ValueHandle] {
        &self.args
    }

    pub fn arg(&self, index: usize) -> Option<&ValueHandle> {
        self.args.get(index)
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Argument `index`, or a borrowed `undefined` when it was not passed.
    pub fn arg_or_undefined(&self, index: usize) -> ValueHandle {
        match self.args.get(index).map(ValueHandle::dup) {
            Some(Ok(handle)) => handle,
            _ => self.context.undefined(),
        }
    }

    /// Marshal a host value as the call's return value.
    pub fn returning(&self, value: impl Into<HostValue>) -> std::result::Result<ValueHandle, HostError> {
        Ok(self.context.to_guest(value.into())?)
    }

    pub fn undefined(&self) -> std::result::Result<ValueHandle, HostError> {
        Ok(self.context.undefined())
    }

    /// Throw `value` into the guest unchanged, e.g. `return frame.throw(error)`.
    pub fn throw(&self, value: impl Into<HostValue>) -> std::result::Result<ValueHandle, HostError> {
        let thrown = self.context.to_guest(value.into())?;
        Err(HostError::Guest(GuestError::from_handle(thrown)?))
    }
}

pub struct CallbackRegistry {
    entries: HashMap<CallbackKey, HostFunction>,
    next: u32,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next: 1,
        }
    }

    pub fn register(&mut self, context: ContextId, function: HostFunction) -> CallbackKey {
        let key = CallbackKey {
            context,
            function: FunctionId(self.next),
        };
        self.next += 1;
        self.entries.insert(key, function);
        key
    }

    pub fn get(&self, key: CallbackKey) -> Option<HostFunction> {
        self.entries.get(&key).cloned()
    }

    pub fn unregister(&mut self, key: CallbackKey) -> Option<HostFunction> {
        self.entries.remove(&key)
    }

    /// Detach every callback of `context`.
    pub fn remove_context(&mut self, context: ContextId) -> Vec<HostFunction> {
        let keys: Vec<_> = self
            .entries
            .keys()
            .filter(|key| key.context == context)
            .copied()
            .collect();
        keys.into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Owned by the guest trampoline; unregisters its callback once the guest
/// collects the function.
struct Registration {
    runtime: Weak<RuntimeInner>,
    key: CallbackKey,
}

impl Registration {
    fn dispatch<'js>(
        &self,
        ctx: Ctx<'js>,
        this: Value<'js>,
        args: Vec<Value<'js>>,
    ) -> rquickjs::Result<Value<'js>> {
        let Some(runtime) = self.runtime.upgrade() else {
            return Err(throw_message(&ctx, "host runtime is gone"));
        };
        let callback = runtime.callbacks().borrow().get(self.key);
        let (Some(callback), Some(context)) = (callback, runtime.context(self.key.context)) else {
            return Err(throw_message(&ctx, "host callback is no longer registered"));
        };

        let _scope = scope::push(runtime.id(), context.id(), &ctx);
        tracing::trace!(key = self.key.to_bits(), args = args.len(), "dispatching host callback");
        hako_metrics::metrics! {
            context.stats().borrow_mut().increment("callbacks.dispatched", 1);
        }

        let frame = match build_frame(&context, &ctx, this, args) {
            Ok(frame) => frame,
            Err(error) => return Err(exception::throw_host(&context, &ctx, error.into())),
        };
        let outcome = callback(&frame);
        drop(frame);

        match outcome.and_then(|handle| {
            context.same_context(&handle)?;
            Ok(context.value_of(&ctx, handle.raw())?)
        }) {
            Ok(value) => Ok(value),
            Err(error) => Err(exception::throw_host(&context, &ctx, error)),
        }
    }
}

fn build_frame<'a, 'js>(
    context: &'a ExecutionContext,
    ctx: &Ctx<'js>,
    this: Value<'js>,
    args: Vec<Value<'js>>,
) -> Result<CallFrame<'a>> {
    let this = context.adopt(ctx, this)?;
    let args = args
        .into_iter()
        .map(|arg| context.adopt(ctx, arg))
        .collect::<Result<Vec<_>>>()?;
    Ok(CallFrame { context, this, args })
}

fn throw_message(ctx: &Ctx<'_>, message: &str) -> rquickjs::Error {
    tracing::error!(reason = message, "guest called a dead host callback");
    match rquickjs::String::from_str(ctx.clone(), message) {
        Ok(message) => ctx.throw(message.into_value()),
        Err(error) => error,
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let Some(runtime) = self.runtime.upgrade() else {
            return;
        };
        // Collection can run while the registry is borrowed; the entry is
        // then left for context teardown.
        let removed = match runtime.callbacks().try_borrow_mut() {
            Ok(mut registry) => registry.unregister(self.key),
            Err(_) => None,
        };
        drop(removed);
    }
}

impl ExecutionContext {
    /// Expose a host function to the guest.
    pub fn new_function<F>(&self, name: &str, callback: F) -> Result<ValueHandle>
    where
        F: Fn(&CallFrame<'_>) -> std::result::Result<ValueHandle, HostError> + 'static,
    {
        self.new_host_function(name, Rc::new(callback))
    }

    pub fn new_host_function(&self, name: &str, callback: HostFunction) -> Result<ValueHandle> {
        self.enter(|ctx| {
            let function = self.function_value(ctx, name, callback)?;
            self.adopt(ctx, function)
        })
    }

    /// Like [`new_host_function`](Self::new_host_function), also returning
    /// the registry key so the caller can drop the callback early.
    pub(crate) fn new_keyed_function(&self, callback: HostFunction) -> Result<(ValueHandle, CallbackKey)> {
        self.enter(|ctx| {
            let (function, key) = self.keyed_function_value(ctx, "", callback)?;
            Ok((self.adopt(ctx, function)?, key))
        })
    }

    /// Remove callbacks from the registry ahead of collection. The guest
    /// functions stay callable but throw once dispatched.
    pub(crate) fn forget_callbacks(&self, keys: &[CallbackKey]) {
        let Ok(runtime) = self.runtime() else {
            return;
        };
        let removed: Vec<_> = match runtime.callbacks().try_borrow_mut() {
            Ok(mut registry) => keys.iter().filter_map(|key| registry.unregister(*key)).collect(),
            Err(_) => Vec::new(),
        };
        drop(removed);
    }

    pub(crate) fn function_value<'js>(
        &self,
        ctx: &Ctx<'js>,
        name: &str,
        callback: HostFunction,
    ) -> Result<Value<'js>> {
        self.keyed_function_value(ctx, name, callback)
            .map(|(function, _)| function)
    }

    fn keyed_function_value<'js>(
        &self,
        ctx: &Ctx<'js>,
        name: &str,
        callback: HostFunction,
    ) -> Result<(Value<'js>, CallbackKey)> {
        let runtime = self.runtime()?;
        let key = runtime.callbacks().borrow_mut().register(self.id(), callback);
        let registration = Registration {
            runtime: Rc::downgrade(&runtime),
            key,
        };
        let trampoline = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, this: This<Value<'js>>, args: Rest<Value<'js>>| {
                registration.dispatch(ctx, this.0, args.0)
            },
        )
        .map_err(|error| {
            drop(runtime.callbacks().borrow_mut().unregister(key));
            BridgeError::from(error)
        })?;

        if !name.is_empty() {
            let set_name = self.intrinsic(ctx, "setName")?;
            set_name
                .call::<_, ()>((trampoline.clone(), name))
                .or_guest(self, ctx)?;
        }
        tracing::trace!(key = key.to_bits(), name, "host function registered");
        Ok((trampoline.into_value(), key))
    }

    /// Number of host callbacks currently registered for this context.
    pub fn callback_count(&self) -> usize {
        match self.runtime() {
            Ok(runtime) => {
                let id = self.id();
                runtime
                    .callbacks()
                    .borrow()
                    .entries
                    .keys()
                    .filter(|key| key.context == id)
                    .count()
            }
            Err(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Runtime;
    use std::cell::Cell;

    #[test]
    fn registry_keys_are_scoped_by_context() {
        let mut registry = CallbackRegistry::new();
        let noop: HostFunction = Rc::new(|frame: &CallFrame<'_>| frame.undefined());
        let a = registry.register(ContextId(1), noop.clone());
        let b = registry.register(ContextId(2), noop.clone());
        let c = registry.register(ContextId(1), noop);
        assert_ne!(a, c);
        assert_eq!(registry.len(), 3);

        assert_eq!(registry.remove_context(ContextId(1)).len(), 2);
        assert!(registry.get(a).is_none());
        assert!(registry.get(b).is_some());
    }

    #[test]
    fn guest_calls_reach_host_functions() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let add = context
            .new_function("add", |frame| {
                let a = frame.arg_or_undefined(0).to_number()?;
                let b = frame.arg_or_undefined(1).to_number()?;
                frame.returning(a + b)
            })
            .unwrap();
        context.set_global("add", &add).unwrap();

        assert_eq!(context.eval("add(2, 3)").unwrap().to_number().unwrap(), 5.0);
        assert_eq!(context.eval("add.name").unwrap().to_string().unwrap(), "add");
    }

    #[test]
    fn callback_arguments_are_released_after_the_call() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let seen = Rc::new(Cell::new(0));
        let counter = seen.clone();
        let inspect = context
            .new_function("inspect", move |frame| {
                counter.set(frame.context().live_handle_count());
                frame.undefined()
            })
            .unwrap();
        context.set_global("inspect", &inspect).unwrap();
        let before = context.live_handle_count();

        context.eval("inspect({}, [], 'text')").unwrap();
        // this is undefined, so only the three arguments took slots.
        assert_eq!(seen.get(), before + 3);
        assert_eq!(context.live_handle_count(), before);
    }

    #[test]
    fn host_errors_become_guest_exceptions() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let fail = context
            .new_function("fail", |_| Err(HostError::type_error("bad input")))
            .unwrap();
        context.set_global("fail", &fail).unwrap();

        let caught = context
            .eval("try { fail(); 'no' } catch (e) { `${e.name}|${e.message}|${e instanceof TypeError}` }")
            .unwrap();
        assert_eq!(caught.to_string().unwrap(), "TypeError|bad input|true");

        let error = context.eval("fail()").unwrap_err().into_guest().unwrap();
        assert_eq!(error.name(), "TypeError");
        assert_eq!(error.message(), "bad input");
    }

    #[test]
    fn callbacks_can_reenter_the_context() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let twice = context
            .new_function("twice", |frame| {
                let function = frame.arg(0).ok_or_else(|| HostError::type_error("missing callback"))?;
                let first = frame.context().invoke(function, None, &[])?.to_number()?;
                let second = frame.context().invoke(function, None, &[])?.to_number()?;
                frame.returning(first + second)
            })
            .unwrap();
        context.set_global("twice", &twice).unwrap();
        let result = context.eval("let n = 0; twice(() => ++n)").unwrap();
        assert_eq!(result.to_number().unwrap(), 3.0);
    }

    #[test]
    fn thrown_values_reach_guest_catch_blocks() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let raise = context.new_function("raise", |frame| frame.throw(42)).unwrap();
        context.set_global("raise", &raise).unwrap();
        let caught = context.eval("try { raise(); 0 } catch (e) { e }").unwrap();
        assert_eq!(caught.to_number().unwrap(), 42.0);
    }

    #[test]
    fn teardown_drops_registered_callbacks() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let _function = context.new_function("noop", |frame| frame.undefined()).unwrap();
        assert_eq!(context.callback_count(), 1);
        context.dispose().unwrap();
        assert_eq!(context.callback_count(), 0);
    }
}

//! Entered engine scopes
//!
//! Guest→host callbacks run while the engine lock is held. Host code reached
//! from such a callback has to reuse the entered context instead of locking
//! the runtime again, so every entered context is pushed onto a thread-local
//! stack for the duration of the lock.

use crate::ffi::{ContextId, RuntimeId};
use rquickjs::Ctx;
use std::cell::RefCell;
use std::marker::PhantomData;

struct ActiveScope {
    runtime: RuntimeId,
    context: ContextId,
    ctx: Ctx<'static>,
}

thread_local! {
    static ACTIVE: RefCell<Vec<ActiveScope>> = const { RefCell::new(Vec::new()) };
}

pub(crate) enum Lookup {
    /// The context is already entered; reuse its engine handle.
    Entered(Ctx<'static>),
    /// Another context of the same runtime holds the engine lock.
    Locked,
    Free,
}

pub(crate) fn lookup(runtime: RuntimeId, context: ContextId) -> Lookup {
    ACTIVE.with(|stack| {
        let stack = stack.borrow();
        if let Some(scope) = stack.iter().rev().find(|scope| scope.context == context) {
            return Lookup::Entered(scope.ctx.clone());
        }
        if stack.iter().any(|scope| scope.runtime == runtime) {
            Lookup::Locked
        } else {
            Lookup::Free
        }
    })
}

pub(crate) fn is_locked(runtime: RuntimeId) -> bool {
    ACTIVE.with(|stack| stack.borrow().iter().any(|scope| scope.runtime == runtime))
}

/// Innermost entered context of `runtime`.
pub(crate) fn current(runtime: RuntimeId) -> Option<ContextId> {
    ACTIVE.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .find(|scope| scope.runtime == runtime)
            .map(|scope| scope.context)
    })
}

/// Pops its scope when dropped.
pub(crate) struct ScopeGuard {
    _not_send: PhantomData<*const ()>,
}

pub(crate) fn push<'js>(runtime: RuntimeId, context: ContextId, ctx: &Ctx<'js>) -> ScopeGuard {
    // SAFETY: `'static` is never observable. The erased handle is only read
    // back through `lookup`, whose callers pass it to closures generic over
    // `'js`, so no value derived from it can outlive the closure. The entry
    // is popped when the returned guard drops, and both call sites bind the
    // guard inside the `Context::with` or trampoline frame that produced
    // `ctx`, so the stack never holds a handle past the engine lock. The
    // guard is `!Send`, which keeps push and pop on the same thread-local
    // stack.
    let ctx = unsafe { std::mem::transmute::<Ctx<'js>, Ctx<'static>>(ctx.clone()) };
    ACTIVE.with(|stack| {
        stack.borrow_mut().push(ActiveScope {
            runtime,
            context,
            ctx,
        })
    });
    ScopeGuard {
        _not_send: PhantomData,
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let popped = ACTIVE.with(|stack| stack.borrow_mut().pop());
        drop(popped);
    }
}

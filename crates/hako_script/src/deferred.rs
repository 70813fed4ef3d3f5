//! Deferred values
//!
//! Host-settled promises ([`DeferredValue`]) and host waits on guest promises
//! ([`ExecutionContext::await_value`]).
//!
//! Waiting never blocks the thread. The wait loop pumps pending guest jobs
//! and yields to the local task set between pumps, so other tasks on the
//! engine thread (including whichever one settles the promise) keep running.

use crate::callbacks::{CallFrame, HostFunction};
use crate::context::ExecutionContext;
use crate::error::{BridgeError, Result};
use crate::exception::{GuestError, GuestResultExt};
use crate::factory::HostValue;
use crate::ffi::CallbackKey;
use crate::handle::ValueHandle;
use rquickjs::promise::PromiseState as EngineState;
use rquickjs::{Function, Value};
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::watch;

/// Idle delay between pumps when no guest job is queued.
const IDLE_POLL: Duration = Duration::from_millis(1);

/// Settlement state of a guest promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

/// A guest promise the host settles.
///
/// Exactly one of [`resolve`](Self::resolve) and [`reject`](Self::reject)
/// takes effect. Both guest settle functions are released by the first call,
/// so later calls find nothing to invoke and return without effect.
pub struct DeferredValue {
    promise: ValueHandle,
    resolve: RefCell<Option<ValueHandle>>,
    reject: RefCell<Option<ValueHandle>>,
    settled: watch::Sender<bool>,
}

#[derive(Clone, Copy)]
enum Outcome {
    Resolve,
    Reject,
}

impl DeferredValue {
    /// The guest promise.
    pub fn handle(&self) -> &ValueHandle {
        &self.promise
    }

    pub fn context(&self) -> &ExecutionContext {
        self.promise.context()
    }

    /// Resolve with `value`, or `undefined` when `None`.
    pub fn resolve(&self, value: Option<&ValueHandle>) -> Result<()> {
        self.settle(Outcome::Resolve, value)
    }

    pub fn reject(&self, value: Option<&ValueHandle>) -> Result<()> {
        self.settle(Outcome::Reject, value)
    }

    pub fn resolve_with(&self, value: impl Into<HostValue>) -> Result<()> {
        let value = self.context().to_guest(value.into())?;
        self.resolve(Some(&value))
    }

    pub fn reject_with(&self, value: impl Into<HostValue>) -> Result<()> {
        let value = self.context().to_guest(value.into())?;
        self.reject(Some(&value))
    }

    pub fn is_settled(&self) -> bool {
        *self.settled.borrow()
    }

    /// Completes once the host has settled this value.
    pub async fn settled(&self) {
        let mut watcher = self.settled.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = watcher.wait_for(|settled| *settled).await;
    }

    /// Release the promise and both settle functions. An unsettled guest
    /// promise stays pending.
    pub fn dispose(&self) {
        drop(self.resolve.borrow_mut().take());
        drop(self.reject.borrow_mut().take());
        self.promise.dispose();
    }

    fn settle(&self, outcome: Outcome, value: Option<&ValueHandle>) -> Result<()> {
        let resolve = self.resolve.borrow_mut().take();
        let reject = self.reject.borrow_mut().take();
        let (Some(resolve), Some(reject)) = (resolve, reject) else {
            tracing::trace!(promise = ?self.promise.raw(), "deferred value already settled");
            return Ok(());
        };

        let context = self.context();
        let undefined = context.undefined();
        let value = value.unwrap_or(&undefined);
        let function = match outcome {
            Outcome::Resolve => &resolve,
            Outcome::Reject => &reject,
        };
        let result = context.invoke(function, None, &[value]).map(drop);

        resolve.dispose();
        reject.dispose();
        self.settled.send_replace(true);
        result
    }
}

impl std::fmt::Debug for DeferredValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredValue")
            .field("promise", &self.promise.raw())
            .field("settled", &self.is_settled())
            .finish()
    }
}

enum Settlement {
    Waiting,
    Done(Result<ValueHandle>),
    Abandoned,
}

type SettlementSlot = Rc<RefCell<Settlement>>;

/// Marks the slot abandoned when the wait ends, whatever ended it.
struct WaitGuard(SettlementSlot);

impl Drop for WaitGuard {
    fn drop(&mut self) {
        let previous = std::mem::replace(&mut *self.0.borrow_mut(), Settlement::Abandoned);
        drop(previous);
    }
}

impl ExecutionContext {
    /// A fresh guest promise with host-side settle functions.
    pub fn create_deferred(&self) -> Result<DeferredValue> {
        let (promise, resolve, reject) = self.enter(|ctx| {
            let helper = self.intrinsic(ctx, "deferred")?;
            let parts: rquickjs::Array = helper.call(()).or_guest(self, ctx)?;
            let promise: Value = parts.get(0)?;
            let resolve: Value = parts.get(1)?;
            let reject: Value = parts.get(2)?;
            Ok((
                self.adopt(ctx, promise)?,
                self.adopt(ctx, resolve)?,
                self.adopt(ctx, reject)?,
            ))
        })?;
        let (settled, _) = watch::channel(false);
        Ok(DeferredValue {
            promise,
            resolve: RefCell::new(Some(resolve)),
            reject: RefCell::new(Some(reject)),
            settled,
        })
    }

    pub fn promise_state(&self, promise: &ValueHandle) -> Result<PromiseState> {
        self.same_context(promise)?;
        promise.with(|_, value| {
            let promise = value
                .into_promise()
                .ok_or_else(|| BridgeError::protocol("promise", "value is not a promise"))?;
            Ok(match promise.state() {
                EngineState::Pending => PromiseState::Pending,
                EngineState::Resolved => PromiseState::Fulfilled,
                EngineState::Rejected => PromiseState::Rejected,
            })
        })
    }

    /// The settled result of a promise. A rejection comes back as
    /// `Err(BridgeError::Guest)` carrying the rejection reason.
    pub fn promise_result(&self, promise: &ValueHandle) -> Result<ValueHandle> {
        self.same_context(promise)?;
        promise.with(|ctx, value| {
            let promise = value
                .into_promise()
                .ok_or_else(|| BridgeError::protocol("promise", "value is not a promise"))?;
            match promise.result::<Value>() {
                None => Err(BridgeError::protocol("promise", "promise is still pending")),
                Some(result) => {
                    let value = result.or_guest(self, ctx)?;
                    self.adopt(ctx, value)
                }
            }
        })
    }

    /// Wait for a guest value to settle.
    ///
    /// Non-thenables are returned as a duplicate. Must run on the thread
    /// that owns the context, inside a `LocalSet` or current-thread runtime.
    pub async fn await_value(&self, value: &ValueHandle) -> Result<ValueHandle> {
        self.await_value_until(value, std::future::pending::<()>()).await
    }

    /// Like [`await_value`](Self::await_value), but gives up with
    /// [`BridgeError::Cancelled`] once `cancel` completes. Cancelling leaves
    /// the guest promise untouched.
    pub async fn await_value_until(
        &self,
        value: &ValueHandle,
        cancel: impl Future<Output = ()>,
    ) -> Result<ValueHandle> {
        self.same_context(value)?;
        if value.is_promise()? {
            match self.promise_state(value)? {
                PromiseState::Pending => {}
                PromiseState::Fulfilled | PromiseState::Rejected => return self.promise_result(value),
            }
        } else if !is_thenable(value)? {
            return value.dup();
        }

        let slot: SettlementSlot = Rc::new(RefCell::new(Settlement::Waiting));
        let guard = WaitGuard(slot.clone());
        self.attach_settlement(value, &slot)?;

        let mut cancel = std::pin::pin!(cancel);
        loop {
            let finished = {
                let mut state = slot.borrow_mut();
                match std::mem::replace(&mut *state, Settlement::Waiting) {
                    Settlement::Done(result) => Some(result),
                    other => {
                        *state = other;
                        None
                    }
                }
            };
            if let Some(result) = finished {
                drop(guard);
                return result;
            }

            let runtime = self.runtime()?;
            let pending = runtime.engine().is_job_pending();
            if pending {
                if let Err(error) = runtime.execute_pending_jobs(None) {
                    if error.is_fatal() {
                        return Err(error);
                    }
                    tracing::warn!(context = %self.id(), %error, "pending guest job failed while awaiting");
                }
            }
            drop(runtime);

            if pending {
                tokio::select! {
                    biased;
                    _ = &mut cancel => return Err(BridgeError::Cancelled),
                    _ = tokio::task::yield_now() => {}
                }
            } else {
                tokio::select! {
                    biased;
                    _ = &mut cancel => return Err(BridgeError::Cancelled),
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                }
            }
        }
    }

    /// Subscribe to `value` with a pair of one-shot callbacks. Whichever
    /// fires first unregisters both, so repeated waits do not grow the
    /// callback registry.
    fn attach_settlement(&self, value: &ValueHandle, slot: &SettlementSlot) -> Result<()> {
        let keys: Rc<RefCell<Vec<CallbackKey>>> = Rc::new(RefCell::new(Vec::with_capacity(2)));

        let fulfilled: HostFunction = {
            let slot = slot.clone();
            let keys = keys.clone();
            Rc::new(move |frame: &CallFrame<'_>| {
                settle_slot(&slot, Ok(frame.arg_or_undefined(0)));
                frame.context().forget_callbacks(&keys.borrow());
                frame.undefined()
            })
        };
        let rejected: HostFunction = {
            let slot = slot.clone();
            let keys = keys.clone();
            Rc::new(move |frame: &CallFrame<'_>| {
                let reason = frame.arg_or_undefined(0);
                let error = match GuestError::from_handle(reason) {
                    Ok(error) => BridgeError::Guest(error),
                    Err(error) => error,
                };
                settle_slot(&slot, Err(error));
                frame.context().forget_callbacks(&keys.borrow());
                frame.undefined()
            })
        };

        let (fulfilled, fulfilled_key) = self.new_keyed_function(fulfilled)?;
        keys.borrow_mut().push(fulfilled_key);
        let (rejected, rejected_key) = match self.new_keyed_function(rejected) {
            Ok(pair) => pair,
            Err(error) => {
                self.forget_callbacks(&keys.borrow());
                return Err(error);
            }
        };
        keys.borrow_mut().push(rejected_key);

        let attached = self.enter(|ctx| {
            let then: Function = self.intrinsic(ctx, "then")?;
            then.call::<_, ()>((value.value(ctx)?, fulfilled.value(ctx)?, rejected.value(ctx)?))
                .or_guest(self, ctx)
        });
        if attached.is_err() {
            self.forget_callbacks(&keys.borrow());
        }
        attached
    }
}

fn settle_slot(slot: &SettlementSlot, result: Result<ValueHandle>) {
    let mut state = slot.borrow_mut();
    if matches!(*state, Settlement::Waiting) {
        *state = Settlement::Done(result);
    }
}

fn is_thenable(value: &ValueHandle) -> Result<bool> {
    if !value.is_object()? || value.is_null()? {
        return Ok(false);
    }
    value.get("then")?.is_function()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Runtime;
    use tokio::task::LocalSet;

    #[test]
    fn settling_twice_is_a_no_op() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let deferred = context.create_deferred().unwrap();
        let before = context.live_handle_count();

        deferred.reject_with(HostValue::error("Error", "first")).unwrap();
        assert!(deferred.is_settled());
        assert_eq!(context.live_handle_count(), before - 2);

        deferred.resolve_with("second").unwrap();
        assert_eq!(
            context.promise_state(deferred.handle()).unwrap(),
            PromiseState::Rejected
        );
        let error = context.promise_result(deferred.handle()).unwrap_err();
        assert_eq!(error.as_guest().unwrap().message(), "first");
    }

    #[test]
    fn resolving_without_a_value_yields_undefined() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let deferred = context.create_deferred().unwrap();
        deferred.resolve(None).unwrap();
        let value = context.promise_result(deferred.handle()).unwrap();
        assert!(value.is_undefined().unwrap());
    }

    #[test]
    fn disposal_leaves_the_guest_promise_pending() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let deferred = context.create_deferred().unwrap();
        let promise = deferred.handle().dup().unwrap();
        deferred.dispose();
        assert!(!deferred.is_settled());
        assert_eq!(context.promise_state(&promise).unwrap(), PromiseState::Pending);
        assert!(deferred.resolve(None).is_ok());
        assert_eq!(context.promise_state(&promise).unwrap(), PromiseState::Pending);
    }

    #[test]
    fn promise_state_rejects_plain_values() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let number = context.new_number(1.0).unwrap();
        assert!(matches!(
            context.promise_state(&number),
            Err(BridgeError::ProtocolViolation { protocol: "promise", .. })
        ));
    }

    #[tokio::test]
    async fn settled_future_completes_once() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let runtime = Runtime::new().unwrap();
                let context = runtime.create_context().unwrap();
                let deferred = Rc::new(context.create_deferred().unwrap());
                let settler = deferred.clone();
                tokio::task::spawn_local(async move {
                    tokio::task::yield_now().await;
                    settler.resolve_with(7).unwrap();
                });
                deferred.settled().await;
                deferred.settled().await;
                assert!(deferred.is_settled());
            })
            .await;
    }

    #[tokio::test]
    async fn awaiting_runs_guest_reactions() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let runtime = Runtime::new().unwrap();
                let context = runtime.create_context().unwrap();
                let promise = context
                    .eval("Promise.resolve(20).then((n) => n + 1).then((n) => n * 2)")
                    .unwrap();
                let value = context.await_value(&promise).await.unwrap();
                assert_eq!(value.to_number().unwrap(), 42.0);

                let rejected = context
                    .eval("(async () => { throw new RangeError('late') })()")
                    .unwrap();
                let error = context.await_value(&rejected).await.unwrap_err();
                assert_eq!(error.as_guest().unwrap().name(), "RangeError");
            })
            .await;
    }

    #[tokio::test]
    async fn plain_values_and_thenables_are_awaitable() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let runtime = Runtime::new().unwrap();
                let context = runtime.create_context().unwrap();
                let plain = context.new_string("now").unwrap();
                let value = context.await_value(&plain).await.unwrap();
                assert_eq!(value.to_string().unwrap(), "now");

                let thenable = context.eval("({ then(ok) { ok('later') } })").unwrap();
                let value = context.await_value(&thenable).await.unwrap();
                assert_eq!(value.to_string().unwrap(), "later");
            })
            .await;
    }

    #[tokio::test]
    async fn cancellation_only_stops_the_host_wait() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let runtime = Runtime::new().unwrap();
                let context = runtime.create_context().unwrap();
                let baseline = context.callback_count();
                let deferred = context.create_deferred().unwrap();
                let result = context
                    .await_value_until(deferred.handle(), tokio::time::sleep(Duration::from_millis(5)))
                    .await;
                assert!(matches!(result, Err(BridgeError::Cancelled)));
                assert_eq!(
                    context.promise_state(deferred.handle()).unwrap(),
                    PromiseState::Pending
                );

                deferred.resolve_with("still works").unwrap();
                let value = context.await_value(deferred.handle()).await.unwrap();
                assert_eq!(value.to_string().unwrap(), "still works");
                assert_eq!(context.callback_count(), baseline);
            })
            .await;
    }

    #[tokio::test]
    async fn repeated_waits_do_not_grow_the_callback_registry() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let runtime = Runtime::new().unwrap();
                let context = runtime.create_context().unwrap();
                let baseline = context.callback_count();

                for round in 0..16 {
                    let deferred = Rc::new(context.create_deferred().unwrap());
                    let settler = deferred.clone();
                    tokio::task::spawn_local(async move {
                        tokio::task::yield_now().await;
                        if round % 2 == 0 {
                            settler.resolve_with(round).unwrap();
                        } else {
                            settler.reject_with(HostValue::error("Error", "odd")).unwrap();
                        }
                    });
                    let result = context.await_value(deferred.handle()).await;
                    assert_eq!(result.is_ok(), round % 2 == 0);
                    assert_eq!(context.callback_count(), baseline, "round {round}");
                }

                let thenable = context.eval("({ then(ok) { ok('later') } })").unwrap();
                for _ in 0..4 {
                    context.await_value(&thenable).await.unwrap();
                }
                assert_eq!(context.callback_count(), baseline);
            })
            .await;
    }
}

//! Iteration bridges
//!
//! A session wraps one guest iterator. It is forward-only and turns
//! terminal on the first `done`, on an explicit close or throw, or on the
//! first failure. Terminal sessions hold no guest references.

use crate::context::ExecutionContext;
use crate::error::{BridgeError, Result};
use crate::exception::GuestResultExt;
use crate::handle::ValueHandle;
use rquickjs::Function;

struct Session {
    context: ExecutionContext,
    iterator: Option<ValueHandle>,
    next: Option<ValueHandle>,
    current: Option<ValueHandle>,
    steps: usize,
}

impl Session {
    fn new(iterator: ValueHandle) -> Self {
        Self {
            context: iterator.context().clone(),
            iterator: Some(iterator),
            next: None,
            current: None,
            steps: 0,
        }
    }

    fn is_done(&self) -> bool {
        self.iterator.is_none()
    }

    fn terminate(&mut self) {
        if let Some(iterator) = self.iterator.take() {
            tracing::trace!(iterator = ?iterator.raw(), steps = self.steps, "iterator session closed");
        }
        self.next = None;
        self.current = None;
    }

    /// Run `step`, closing the session if it fails.
    fn guarded<T>(&mut self, step: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let outcome = step(self);
        if outcome.is_err() {
            self.terminate();
        }
        outcome
    }

    /// Invoke `next`, resolving and caching it on first use. `None` once the
    /// session is terminal.
    fn call_next(&mut self) -> Result<Option<ValueHandle>> {
        if self.is_done() {
            return Ok(None);
        }
        self.current = None;
        self.guarded(|session| {
            let Some(iterator) = session.iterator.as_ref() else {
                return Ok(None);
            };
            if session.next.is_none() {
                let next = iterator.get("next")?;
                if !next.is_function()? {
                    return Err(BridgeError::protocol("iterator", "`next` is not a function"));
                }
                session.next = Some(next);
            }
            let Some(next) = session.next.as_ref() else {
                return Ok(None);
            };
            session.steps += 1;
            session.context.invoke(next, Some(iterator), &[]).map(Some)
        })
    }

    /// Read `done` and `value` from an iterator result object.
    fn inspect(&mut self, result: &ValueHandle) -> Result<bool> {
        self.guarded(|session| {
            if !result.is_object()? || result.is_null()? {
                return Err(BridgeError::protocol(
                    "iterator",
                    "iterator result is not an object",
                ));
            }
            if result.get("done")?.to_boolean()? {
                session.terminate();
                return Ok(false);
            }
            session.current = Some(result.get("value")?);
            Ok(true)
        })
    }

    /// Call an optional member such as `return` or `throw`. `None` when the
    /// iterator does not provide it.
    fn call_member(&mut self, name: &str, arg: Option<&ValueHandle>) -> Result<Option<ValueHandle>> {
        let Some(iterator) = self.iterator.as_ref() else {
            return Ok(None);
        };
        let member = iterator.get(name)?;
        if member.is_undefined()? || member.is_null()? {
            return Ok(None);
        }
        if !member.is_function()? {
            return Err(BridgeError::protocol(
                "iterator",
                format!("`{name}` is not a function"),
            ));
        }
        let args: Vec<&ValueHandle> = arg.into_iter().collect();
        self.context.invoke(&member, Some(iterator), &args).map(Some)
    }
}

/// Host view of a guest synchronous iterator.
pub struct GuestIterator {
    session: Session,
}

impl GuestIterator {
    /// Advance. `Ok(false)` once the guest reports `done`; later calls
    /// return `Ok(false)` without calling `next` again. A failure closes the
    /// session.
    pub fn move_next(&mut self) -> Result<bool> {
        let Some(result) = self.session.call_next()? else {
            return Ok(false);
        };
        self.session.inspect(&result)
    }

    /// Value produced by the last successful `move_next`.
    pub fn current(&self) -> Option<&ValueHandle> {
        self.session.current.as_ref()
    }

    /// Take ownership of the current value.
    pub fn take_current(&mut self) -> Option<ValueHandle> {
        self.session.current.take()
    }

    pub fn is_done(&self) -> bool {
        self.session.is_done()
    }

    /// Close early through the iterator's `return` member, if any.
    pub fn close(&mut self, value: Option<&ValueHandle>) -> Result<()> {
        let outcome = self.session.call_member("return", value).map(drop);
        self.session.terminate();
        outcome
    }

    /// Hand `error` to the iterator's `throw` member so a generator can
    /// observe it. Without a `throw` member the iterator is closed instead.
    pub fn throw(&mut self, error: &ValueHandle) -> Result<()> {
        let outcome = match self.session.call_member("throw", Some(error)) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => self.session.call_member("return", None).map(drop),
            Err(error) => Err(error),
        };
        self.session.terminate();
        outcome
    }

    /// Release the session without notifying the guest.
    pub fn dispose(&mut self) {
        self.session.terminate();
    }
}

impl Iterator for GuestIterator {
    type Item = Result<ValueHandle>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.move_next() {
            Ok(true) => self.take_current().map(Ok),
            Ok(false) => None,
            Err(error) => Some(Err(error)),
        }
    }
}

/// Host view of a guest asynchronous iterator. Each step awaits the promise
/// returned by `next` before inspecting it.
pub struct AsyncGuestIterator {
    session: Session,
}

impl AsyncGuestIterator {
    pub async fn move_next(&mut self) -> Result<bool> {
        let Some(pending) = self.session.call_next()? else {
            return Ok(false);
        };
        let settled = self.session.context.await_value(&pending).await;
        drop(pending);
        let result = match settled {
            Ok(result) => result,
            Err(error) => {
                self.session.terminate();
                return Err(error);
            }
        };
        if !self.session.inspect(&result)? {
            return Ok(false);
        }

        // Sync iterators driven asynchronously may yield promises.
        let Some(current) = self.session.current.take() else {
            return Ok(true);
        };
        if !current.is_promise()? {
            self.session.current = Some(current);
            return Ok(true);
        }
        match self.session.context.await_value(&current).await {
            Ok(value) => {
                self.session.current = Some(value);
                Ok(true)
            }
            Err(error) => {
                self.session.terminate();
                Err(error)
            }
        }
    }

    /// Advance and take the next value. `None` once finished.
    pub async fn next_value(&mut self) -> Option<Result<ValueHandle>> {
        match self.move_next().await {
            Ok(true) => self.take_current().map(Ok),
            Ok(false) => None,
            Err(error) => Some(Err(error)),
        }
    }

    pub fn current(&self) -> Option<&ValueHandle> {
        self.session.current.as_ref()
    }

    pub fn take_current(&mut self) -> Option<ValueHandle> {
        self.session.current.take()
    }

    pub fn is_done(&self) -> bool {
        self.session.is_done()
    }

    pub async fn close(&mut self, value: Option<&ValueHandle>) -> Result<()> {
        let outcome = match self.session.call_member("return", value) {
            Ok(Some(pending)) => self.session.context.await_value(&pending).await.map(drop),
            Ok(None) => Ok(()),
            Err(error) => Err(error),
        };
        self.session.terminate();
        outcome
    }

    pub async fn throw(&mut self, error: &ValueHandle) -> Result<()> {
        let outcome = match self.session.call_member("throw", Some(error)) {
            Ok(Some(pending)) => self.session.context.await_value(&pending).await.map(drop),
            Ok(None) => match self.session.call_member("return", None) {
                Ok(Some(pending)) => self.session.context.await_value(&pending).await.map(drop),
                Ok(None) => Ok(()),
                Err(error) => Err(error),
            },
            Err(error) => Err(error),
        };
        self.session.terminate();
        outcome
    }

    pub fn dispose(&mut self) {
        self.session.terminate();
    }
}

impl ExecutionContext {
    /// Start iterating `iterable` through `Symbol.iterator`.
    pub fn get_iterator(&self, iterable: &ValueHandle) -> Result<GuestIterator> {
        let iterator = self.open_iterator(iterable, "iterator")?;
        Ok(GuestIterator {
            session: Session::new(iterator),
        })
    }

    /// Start iterating through `Symbol.asyncIterator`, falling back to
    /// `Symbol.iterator`.
    pub fn get_async_iterator(&self, iterable: &ValueHandle) -> Result<AsyncGuestIterator> {
        let iterator = self.open_iterator(iterable, "asyncIterator")?;
        Ok(AsyncGuestIterator {
            session: Session::new(iterator),
        })
    }

    fn open_iterator(&self, iterable: &ValueHandle, helper: &'static str) -> Result<ValueHandle> {
        self.same_context(iterable)?;
        let iterator = self.enter(|ctx| {
            let open: Function = self.intrinsic(ctx, helper)?;
            let iterator = open
                .call::<_, rquickjs::Value>((iterable.value(ctx)?,))
                .or_guest(self, ctx)?;
            self.adopt(ctx, iterator)
        })?;
        if iterator.is_undefined()? {
            return Err(BridgeError::NotIterable);
        }
        if !iterator.is_object()? || iterator.is_null()? {
            return Err(BridgeError::protocol("iterator", "iterator is not an object"));
        }
        Ok(iterator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Runtime;
    use tokio::task::LocalSet;

    fn numbers(iterator: &mut GuestIterator) -> Vec<f64> {
        iterator
            .map(|item| item.unwrap().to_number().unwrap())
            .collect()
    }

    #[test]
    fn arrays_iterate_in_order() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let array = context.eval("[10, 20, 30]").unwrap();
        let mut iterator = context.get_iterator(&array).unwrap();

        let mut seen = Vec::new();
        while iterator.move_next().unwrap() {
            seen.push(iterator.current().unwrap().to_number().unwrap());
        }
        assert_eq!(seen, vec![10.0, 20.0, 30.0]);
        assert!(iterator.is_done());
        assert!(!iterator.move_next().unwrap());
    }

    #[test]
    fn done_sessions_never_call_next_again() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let iterable = context
            .eval(
                "globalThis.calls = 0; ({ [Symbol.iterator]() { return { next() { calls++; return { done: true }; } }; } })",
            )
            .unwrap();
        let mut iterator = context.get_iterator(&iterable).unwrap();
        assert!(!iterator.move_next().unwrap());
        assert!(!iterator.move_next().unwrap());
        assert!(!iterator.move_next().unwrap());
        assert_eq!(context.get_global("calls").unwrap().to_number().unwrap(), 1.0);
    }

    #[test]
    fn close_runs_generator_cleanup() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let generator = context
            .eval("globalThis.cleaned = false; (function* () { try { yield 1; yield 2; } finally { cleaned = true; } })()")
            .unwrap();
        let mut iterator = context.get_iterator(&generator).unwrap();
        assert!(iterator.move_next().unwrap());
        iterator.close(None).unwrap();
        assert!(iterator.is_done());
        assert!(iterator.current().is_none());
        assert!(context.get_global("cleaned").unwrap().to_boolean().unwrap());
        assert!(!iterator.move_next().unwrap());
    }

    #[test]
    fn throw_lets_the_generator_observe_the_error() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let generator = context
            .eval("globalThis.caught = null; (function* () { try { yield 1; } catch (e) { caught = e.message; yield 2; } })()")
            .unwrap();
        let mut iterator = context.get_iterator(&generator).unwrap();
        assert!(iterator.move_next().unwrap());
        let error = context.new_error("Error", "stop").unwrap();
        iterator.throw(&error).unwrap();
        assert!(iterator.is_done());
        assert_eq!(context.get_global("caught").unwrap().to_string().unwrap(), "stop");
    }

    #[test]
    fn uncaught_throw_is_reported_after_closing() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let generator = context.eval("(function* () { yield 1; yield 2; })()").unwrap();
        let mut iterator = context.get_iterator(&generator).unwrap();
        assert!(iterator.move_next().unwrap());
        let error = context.new_error("TypeError", "rethrown").unwrap();
        let failure = iterator.throw(&error).unwrap_err();
        assert_eq!(failure.as_guest().unwrap().name(), "TypeError");
        assert!(iterator.is_done());
    }

    #[test]
    fn plain_objects_are_not_iterable() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let object = context.eval("({ a: 1 })").unwrap();
        assert!(matches!(context.get_iterator(&object), Err(BridgeError::NotIterable)));
        let undefined = context.undefined();
        assert!(matches!(context.get_iterator(&undefined), Err(BridgeError::NotIterable)));
    }

    #[test]
    fn malformed_iterators_are_protocol_violations() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let no_next = context.eval("({ [Symbol.iterator]() { return {}; } })").unwrap();
        let mut iterator = context.get_iterator(&no_next).unwrap();
        assert!(matches!(
            iterator.move_next(),
            Err(BridgeError::ProtocolViolation { protocol: "iterator", .. })
        ));
        assert!(iterator.is_done());

        let bad_result = context
            .eval("({ [Symbol.iterator]() { return { next: () => 5 }; } })")
            .unwrap();
        let mut iterator = context.get_iterator(&bad_result).unwrap();
        assert!(matches!(iterator.move_next(), Err(BridgeError::ProtocolViolation { .. })));
        assert!(!iterator.move_next().unwrap());
    }

    #[test]
    fn failures_inside_next_end_the_session() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let generator = context
            .eval("(function* () { yield 1; throw new Error('broken'); })()")
            .unwrap();
        let mut iterator = context.get_iterator(&generator).unwrap();
        let items: Vec<_> = iterator.by_ref().collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().to_number().unwrap(), 1.0);
        assert_eq!(items[1].as_ref().unwrap_err().as_guest().unwrap().message(), "broken");
        assert!(iterator.is_done());
    }

    #[test]
    fn iterator_adapters_compose() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let set = context.eval("new Set([3, 1, 2])").unwrap();
        let mut iterator = context.get_iterator(&set).unwrap();
        assert_eq!(numbers(&mut iterator), vec![3.0, 1.0, 2.0]);
    }

    #[tokio::test]
    async fn async_generators_are_awaited_step_by_step() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let runtime = Runtime::new().unwrap();
                let context = runtime.create_context().unwrap();
                let generator = context
                    .eval("(async function* () { yield 'a'; await null; yield 'b'; })()")
                    .unwrap();
                let mut iterator = context.get_async_iterator(&generator).unwrap();
                let mut seen = Vec::new();
                while let Some(item) = iterator.next_value().await {
                    seen.push(item.unwrap().to_string().unwrap());
                }
                assert_eq!(seen, vec!["a", "b"]);
                assert!(!iterator.move_next().await.unwrap());
            })
            .await;
    }

    #[tokio::test]
    async fn sync_iterables_work_through_the_async_path() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let runtime = Runtime::new().unwrap();
                let context = runtime.create_context().unwrap();
                let array = context.eval("[Promise.resolve(1), 2]").unwrap();
                let mut iterator = context.get_async_iterator(&array).unwrap();
                assert!(iterator.move_next().await.unwrap());
                assert_eq!(iterator.current().unwrap().to_number().unwrap(), 1.0);
                assert!(iterator.move_next().await.unwrap());
                assert_eq!(iterator.current().unwrap().to_number().unwrap(), 2.0);
                assert!(!iterator.move_next().await.unwrap());
            })
            .await;
    }

    #[tokio::test]
    async fn async_close_awaits_cleanup() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let runtime = Runtime::new().unwrap();
                let context = runtime.create_context().unwrap();
                let generator = context
                    .eval("globalThis.closed = false; (async function* () { try { yield 1; yield 2; } finally { await null; closed = true; } })()")
                    .unwrap();
                let mut iterator = context.get_async_iterator(&generator).unwrap();
                assert!(iterator.move_next().await.unwrap());
                iterator.close(None).await.unwrap();
                assert!(iterator.is_done());
                assert!(context.get_global("closed").unwrap().to_boolean().unwrap());
            })
            .await;
    }
}

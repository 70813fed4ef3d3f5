//! Runtime management
//!
//! A `Runtime` owns the guest engine together with everything shared by its
//! contexts: the callback registry, the class-id allocator, the module
//! loader chain and the linear memory used by the error bridge.

use crate::affinity::ThreadAffinity;
use crate::callbacks::{CallbackRegistry, HostFunction};
use crate::config::RuntimeConfig;
use crate::context::{ContextOptions, ExecutionContext};
use crate::error::{BridgeError, Result};
use crate::exception;
use crate::ffi::{ClassId, ContextId, RuntimeId};
use crate::loader::{LoaderChain, ModuleLoader};
use crate::scope;
use hako_memory::{LinearMemory, MemoryError};
use hako_metrics::Counter;
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

pub(crate) type Stats = Rc<RefCell<Counter>>;

/// Snapshot of engine memory accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MemoryStats {
    pub malloc_size: i64,
    pub malloc_count: i64,
    pub memory_used_size: i64,
    pub object_count: i64,
    pub atom_count: i64,
    pub string_count: i64,
    pub function_count: i64,
}

// Fields drop in declaration order; the engine has to go last.
pub(crate) struct RuntimeInner {
    id: RuntimeId,
    affinity: ThreadAffinity,
    config: RuntimeConfig,
    contexts: RefCell<Vec<ExecutionContext>>,
    callbacks: RefCell<CallbackRegistry>,
    next_class: Cell<u32>,
    loaders: LoaderChain,
    memory: RefCell<LinearMemory>,
    stats: Stats,
    engine: rquickjs::Runtime,
}

impl RuntimeInner {
    pub fn id(&self) -> RuntimeId {
        self.id
    }

    pub fn engine(&self) -> &rquickjs::Runtime {
        &self.engine
    }

    pub fn affinity(&self) -> ThreadAffinity {
        self.affinity
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn callbacks(&self) -> &RefCell<CallbackRegistry> {
        &self.callbacks
    }

    pub fn context(&self, id: ContextId) -> Option<ExecutionContext> {
        self.contexts
            .borrow()
            .iter()
            .find(|context| context.id() == id)
            .cloned()
    }

    pub fn next_class_id(&self) -> Result<ClassId> {
        let id = self.next_class.get();
        let next = id
            .checked_add(1)
            .ok_or_else(|| BridgeError::integrity("class ids exhausted"))?;
        self.next_class.set(next);
        Ok(ClassId(id))
    }

    pub fn with_memory<R>(
        &self,
        f: impl FnOnce(&mut LinearMemory) -> std::result::Result<R, MemoryError>,
    ) -> Result<R> {
        let mut memory = self.memory.borrow_mut();
        Ok(f(&mut memory)?)
    }

    /// Detach a context's callbacks and its registry entry. The caller
    /// drops the returned values outside of any borrow.
    pub fn forget_context(&self, id: ContextId) -> (Vec<HostFunction>, Option<ExecutionContext>) {
        let callbacks = self.callbacks.borrow_mut().remove_context(id);
        let mut contexts = self.contexts.borrow_mut();
        let context = contexts
            .iter()
            .position(|context| context.id() == id)
            .map(|index| contexts.remove(index));
        (callbacks, context)
    }

    pub fn execute_pending_jobs(&self, max: Option<usize>) -> Result<usize> {
        self.affinity.check()?;
        if scope::is_locked(self.id) {
            return Err(BridgeError::integrity(
                "pending jobs cannot be pumped from inside a guest callback",
            ));
        }

        let limit = max.unwrap_or(self.config.max_jobs_per_pump);
        let mut executed = 0;
        let mut failure = None;
        while executed < limit {
            match self.engine.execute_pending_job() {
                Ok(true) => executed += 1,
                Ok(false) => break,
                Err(job) => {
                    executed += 1;
                    failure = Some(self.job_failure(job.0));
                    break;
                }
            }
        }

        hako_metrics::metrics! {
            self.stats.borrow_mut().increment("jobs.executed", executed);
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(executed),
        }
    }

    fn job_failure(&self, engine: rquickjs::Context) -> BridgeError {
        let owner = self
            .contexts
            .borrow()
            .iter()
            .find(|context| context.owns_engine(&engine))
            .cloned();
        match owner {
            Some(context) => {
                let captured = context.enter(|ctx| -> Result<()> {
                    Err(exception::capture(&context, ctx, ctx.catch()))
                });
                match captured {
                    Err(error) => error,
                    Ok(()) => BridgeError::integrity("failed job left no exception behind"),
                }
            }
            None => {
                engine.with(|ctx| drop(ctx.catch()));
                BridgeError::integrity("pending job failed in a context unknown to this runtime")
            }
        }
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        let contexts = std::mem::take(self.contexts.get_mut());
        for context in &contexts {
            context.teardown(Some(self));
        }
        drop(contexts);
        tracing::debug!(runtime = %self.id, "runtime disposed");
    }
}

/// Owner of one guest engine instance and all of its contexts.
///
/// Everything created from a runtime is bound to the thread that created
/// it. Use [`EngineThread`](crate::EngineThread) to reach a runtime from
/// other threads.
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

impl Runtime {
    pub fn new() -> Result<Self> {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Result<Self> {
        let engine = rquickjs::Runtime::new()?;
        if let Some(limit) = config.memory_limit {
            engine.set_memory_limit(limit);
        }
        if let Some(size) = config.max_stack_size {
            engine.set_max_stack_size(size);
        }
        if let Some(threshold) = config.gc_threshold {
            engine.set_gc_threshold(threshold);
        }

        let id = RuntimeId::next();
        let loaders = LoaderChain::new(id);
        engine.set_loader(loaders.clone(), loaders.clone());

        tracing::debug!(runtime = %id, ?config, "runtime created");

        Ok(Self {
            inner: Rc::new(RuntimeInner {
                id,
                affinity: ThreadAffinity::current(),
                memory: RefCell::new(LinearMemory::new(config.linear_memory_limit)),
                config,
                contexts: RefCell::new(Vec::new()),
                callbacks: RefCell::new(CallbackRegistry::new()),
                next_class: Cell::new(1),
                loaders,
                stats: Rc::new(RefCell::new(Counter::new())),
                engine,
            }),
        })
    }

    pub fn id(&self) -> RuntimeId {
        self.inner.id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn affinity(&self) -> ThreadAffinity {
        self.inner.affinity
    }

    pub fn create_context(&self) -> Result<ExecutionContext> {
        self.create_context_with(ContextOptions::default())
    }

    pub fn create_context_with(&self, options: ContextOptions) -> Result<ExecutionContext> {
        self.inner.affinity.check()?;
        if scope::is_locked(self.inner.id) {
            return Err(BridgeError::integrity(
                "contexts cannot be created from inside a guest callback",
            ));
        }
        let context = ExecutionContext::create(&self.inner, options)?;
        self.inner.contexts.borrow_mut().push(context.clone());
        Ok(context)
    }

    pub fn context(&self, id: ContextId) -> Option<ExecutionContext> {
        self.inner.context(id)
    }

    pub fn contexts(&self) -> Vec<ExecutionContext> {
        self.inner.contexts.borrow().clone()
    }

    // ------------------------------------------------------------------
    // Engine limits
    // ------------------------------------------------------------------

    pub fn set_memory_limit(&self, limit: usize) {
        self.inner.engine.set_memory_limit(limit);
    }

    pub fn set_max_stack_size(&self, size: usize) {
        self.inner.engine.set_max_stack_size(size);
    }

    pub fn set_gc_threshold(&self, threshold: usize) {
        self.inner.engine.set_gc_threshold(threshold);
    }

    pub fn run_gc(&self) {
        self.inner.engine.run_gc();
    }

    pub fn memory_usage(&self) -> MemoryStats {
        let usage = self.inner.engine.memory_usage();
        MemoryStats {
            malloc_size: usage.malloc_size as i64,
            malloc_count: usage.malloc_count as i64,
            memory_used_size: usage.memory_used_size as i64,
            object_count: usage.obj_count as i64,
            atom_count: usage.atom_count as i64,
            string_count: usage.str_count as i64,
            function_count: usage.js_func_count as i64,
        }
    }

    /// Install a predicate polled while guest code runs. Returning `true`
    /// aborts execution with an uncatchable interrupt.
    pub fn set_interrupt_handler(&self, handler: Option<Box<dyn FnMut() -> bool + 'static>>) {
        self.inner.engine.set_interrupt_handler(handler);
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    pub fn is_job_pending(&self) -> bool {
        self.inner.engine.is_job_pending()
    }

    /// Run up to `max` pending jobs (the configured pump size when `None`).
    ///
    /// Returns the number of jobs run, or the guest error of the first job
    /// that threw.
    pub fn execute_pending_jobs(&self, max: Option<usize>) -> Result<usize> {
        self.inner.execute_pending_jobs(max)
    }

    // ------------------------------------------------------------------
    // Collaborators
    // ------------------------------------------------------------------

    /// Append a module loader. Loaders are tried in registration order.
    pub fn add_loader(&self, loader: impl ModuleLoader + 'static) {
        self.inner.loaders.push(Box::new(loader));
    }

    /// Run `f` against the linear memory shared by this runtime's contexts.
    pub fn with_memory<R>(
        &self,
        f: impl FnOnce(&mut LinearMemory) -> std::result::Result<R, MemoryError>,
    ) -> Result<R> {
        self.inner.with_memory(f)
    }

    /// Bridge counters, sorted by name. Empty without the `metrics` feature.
    pub fn stats(&self) -> Vec<(String, usize)> {
        self.inner.stats.borrow().snapshot()
    }

    /// Tear down every context and the engine.
    pub fn dispose(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_contexts_and_tears_them_down() {
        let runtime = Runtime::new().unwrap();
        let first = runtime.create_context().unwrap();
        let second = runtime.create_context().unwrap();
        assert_eq!(runtime.contexts().len(), 2);

        first.dispose().unwrap();
        assert_eq!(runtime.contexts().len(), 1);
        assert!(runtime.context(first.id()).is_none());
        assert_eq!(runtime.context(second.id()), Some(second.clone()));

        let value = second.new_object().unwrap();
        runtime.dispose();
        assert!(second.is_disposed());
        assert!(matches!(value.to_boolean(), Err(BridgeError::ContextDisposed(_))));
    }

    #[test]
    fn class_ids_refuse_to_wrap() {
        let runtime = Runtime::new().unwrap();
        let first = runtime.inner.next_class_id().unwrap();
        assert_eq!(runtime.inner.next_class_id().unwrap(), ClassId(first.0 + 1));

        runtime.inner.next_class.set(u32::MAX);
        assert!(matches!(runtime.inner.next_class_id(), Err(BridgeError::BridgeIntegrity(_))));
        assert_eq!(runtime.inner.next_class.get(), u32::MAX);
    }

    #[test]
    fn pending_jobs_are_pumped_on_request() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        context
            .eval("globalThis.order = []; Promise.resolve().then(() => order.push('job'));")
            .unwrap();
        assert!(runtime.is_job_pending());
        assert_eq!(runtime.execute_pending_jobs(None).unwrap(), 1);
        assert!(!runtime.is_job_pending());
        let order = context.eval("order.join(',')").unwrap();
        assert_eq!(order.to_string().unwrap(), "job");
    }

    #[test]
    fn pump_respects_the_job_limit() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        context
            .eval("for (let i = 0; i < 5; i++) Promise.resolve().then(() => {});")
            .unwrap();
        assert_eq!(runtime.execute_pending_jobs(Some(2)).unwrap(), 2);
        assert_eq!(runtime.execute_pending_jobs(None).unwrap(), 3);
    }

    #[test]
    fn interrupt_handler_aborts_runaway_scripts() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        runtime.set_interrupt_handler(Some(Box::new(|| true)));
        let result = context.eval("for (;;) {}");
        assert!(result.is_err());
        runtime.set_interrupt_handler(None);
        assert_eq!(context.eval("1 + 1").unwrap().to_number().unwrap(), 2.0);
    }

    #[test]
    fn memory_usage_reports_live_objects() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let _object = context.new_object().unwrap();
        runtime.run_gc();
        let usage = runtime.memory_usage();
        assert!(usage.object_count > 0);
        assert!(usage.memory_used_size > 0);
    }

    #[test]
    #[cfg(feature = "metrics")]
    fn stats_count_handle_traffic() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let object = context.new_object().unwrap();
        object.dispose();
        let stats = runtime.stats();
        assert!(stats.contains(&("handles.allocated".to_string(), 1)));
        assert!(stats.contains(&("handles.released".to_string(), 1)));
    }
}

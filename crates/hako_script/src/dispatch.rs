//! Engine thread
//!
//! A [`Runtime`] and everything created from it are bound to one thread.
//! `EngineThread` owns such a thread: a current-thread tokio runtime driving
//! a `LocalSet`, with the guest runtime living inside it. Work submitted from
//! any thread is queued onto it and the caller suspends until it completes.

use crate::config::RuntimeConfig;
use crate::error::{BridgeError, Result};
use crate::runtime::Runtime;
use std::future::Future;
use std::rc::Rc;
use std::thread::{JoinHandle, ThreadId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;

type Command = Box<dyn FnOnce(&Rc<Runtime>) + Send>;

/// Handle to a dedicated guest engine thread.
pub struct EngineThread {
    commands: Option<mpsc::UnboundedSender<Command>>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl EngineThread {
    /// Spawn the thread and create its runtime. Fails if either the tokio
    /// runtime or the guest runtime cannot be built.
    pub fn start(config: RuntimeConfig) -> Result<Self> {
        let (commands, mut inbox) = mpsc::unbounded_channel::<Command>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<std::result::Result<(), String>>();

        let thread = std::thread::Builder::new()
            .name("hako-engine".to_string())
            .spawn(move || {
                let tokio_rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(error) => {
                        let _ = ready_tx.send(Err(format!("tokio runtime: {error}")));
                        return;
                    }
                };
                let runtime = match Runtime::with_config(config) {
                    Ok(runtime) => Rc::new(runtime),
                    Err(error) => {
                        let _ = ready_tx.send(Err(error.to_string()));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                tracing::debug!(runtime = %runtime.id(), "engine thread started");

                let local = LocalSet::new();
                local.block_on(&tokio_rt, async move {
                    while let Some(command) = inbox.recv().await {
                        command(&runtime);
                    }
                    tracing::debug!(runtime = %runtime.id(), "engine thread draining");
                });
                // Unfinished local tasks may still hold the runtime; they
                // are dropped here, on the engine thread.
                drop(local);
                tracing::debug!("engine thread stopped");
            })
            .map_err(|error| BridgeError::Startup(error.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                let _ = thread.join();
                return Err(BridgeError::Startup(reason));
            }
            Err(_) => {
                let _ = thread.join();
                return Err(BridgeError::Startup("engine thread exited during startup".to_string()));
            }
        }

        Ok(Self {
            commands: Some(commands),
            thread_id: thread.thread().id(),
            thread: Some(thread),
        })
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn is_running(&self) -> bool {
        self.commands.as_ref().is_some_and(|commands| !commands.is_closed())
    }

    /// Run `f` on the engine thread and wait for its result.
    pub async fn invoke<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Runtime) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        self.send(Box::new(move |runtime| {
            let _ = reply.send(f(runtime));
        }))?;
        result.await.map_err(|_| BridgeError::EngineStopped)
    }

    /// Blocking form of [`invoke`](Self::invoke) for callers outside any
    /// async runtime. Calling it from the engine thread itself is refused.
    pub fn invoke_blocking<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Runtime) -> R + Send + 'static,
        R: Send + 'static,
    {
        if std::thread::current().id() == self.thread_id {
            return Err(BridgeError::integrity(
                "invoke_blocking called from the engine thread",
            ));
        }
        let (reply, result) = oneshot::channel();
        self.send(Box::new(move |runtime| {
            let _ = reply.send(f(runtime));
        }))?;
        result.blocking_recv().map_err(|_| BridgeError::EngineStopped)
    }

    /// Run a future on the engine thread. The future itself need not be
    /// `Send`, which is what awaiting guest promises requires.
    pub async fn invoke_async<F, Fut, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(Rc<Runtime>) -> Fut + Send + 'static,
        Fut: Future<Output = R> + 'static,
        R: Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        self.send(Box::new(move |runtime| {
            let runtime = runtime.clone();
            tokio::task::spawn_local(async move {
                let _ = reply.send(f(runtime).await);
            });
        }))?;
        result.await.map_err(|_| BridgeError::EngineStopped)
    }

    /// Stop accepting work, let queued commands finish and join the thread.
    /// The runtime is torn down on the engine thread.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn send(&self, command: Command) -> Result<()> {
        let commands = self.commands.as_ref().ok_or(BridgeError::EngineStopped)?;
        commands.send(command).map_err(|_| BridgeError::EngineStopped)
    }

    fn stop(&mut self) -> Result<()> {
        drop(self.commands.take());
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        if std::thread::current().id() == self.thread_id {
            // Dropped from inside one of its own commands; the loop ends
            // on its own once the channel is closed.
            return Ok(());
        }
        thread.join().map_err(|_| {
            tracing::error!("engine thread panicked");
            BridgeError::EngineStopped
        })
    }
}

impl Drop for EngineThread {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl std::fmt::Debug for EngineThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineThread")
            .field("thread_id", &self.thread_id)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ContextId;
    use std::sync::Arc;

    fn evaluate_number(runtime: &Runtime, code: &str) -> std::result::Result<f64, String> {
        let context = runtime.create_context().map_err(|e| e.to_string())?;
        let value = context.eval(code).map_err(|e| e.to_string())?;
        value.to_number().map_err(|e| e.to_string())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invoke_runs_on_the_engine_thread() {
        let engine = EngineThread::start(RuntimeConfig::default()).unwrap();
        let engine_thread = engine.thread_id();
        let (thread, number) = engine
            .invoke(|runtime| (std::thread::current().id(), evaluate_number(runtime, "1+1")))
            .await
            .unwrap();
        assert_eq!(thread, engine_thread);
        assert_ne!(thread, std::thread::current().id());
        assert_eq!(number.unwrap(), 2.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn state_persists_between_invocations() {
        let engine = EngineThread::start(RuntimeConfig::default()).unwrap();
        let context: ContextId = engine
            .invoke(|runtime| {
                let context = runtime.create_context().unwrap();
                context.eval("globalThis.counter = 41").unwrap();
                context.id()
            })
            .await
            .unwrap();
        let value = engine
            .invoke(move |runtime| {
                let context = runtime.context(context).unwrap();
                context.eval("++counter").unwrap().to_number().unwrap()
            })
            .await
            .unwrap();
        assert_eq!(value, 42.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_invocations_can_await_guest_promises() {
        let engine = EngineThread::start(RuntimeConfig::default()).unwrap();
        let text = engine
            .invoke_async(|runtime| async move {
                let context = runtime.create_context().unwrap();
                let deferred = Rc::new(context.create_deferred().unwrap());
                let settler = deferred.clone();
                tokio::task::spawn_local(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                    settler.resolve_with("done").unwrap();
                });
                let value = context.await_value(deferred.handle()).await.unwrap();
                value.to_string().unwrap()
            })
            .await
            .unwrap();
        assert_eq!(text, "done");
    }

    #[test]
    fn blocking_invocation_from_a_plain_thread() {
        let engine = EngineThread::start(RuntimeConfig::default()).unwrap();
        let number = engine
            .invoke_blocking(|runtime| evaluate_number(runtime, "6 * 7"))
            .unwrap()
            .unwrap();
        assert_eq!(number, 42.0);
        engine.shutdown().unwrap();
    }

    #[test]
    fn blocking_invocation_on_the_engine_thread_is_refused() {
        let engine = Arc::new(EngineThread::start(RuntimeConfig::default()).unwrap());
        let inner = engine.clone();
        let refused = engine
            .invoke_blocking(move |_| matches!(inner.invoke_blocking(|_| ()), Err(BridgeError::BridgeIntegrity(_))))
            .unwrap();
        assert!(refused);
    }

    #[test]
    fn shutdown_stops_accepting_work() {
        let engine = EngineThread::start(RuntimeConfig::default()).unwrap();
        assert!(engine.is_running());
        engine.shutdown().unwrap();
    }
}

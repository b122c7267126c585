//! Single-worker task queue in front of an [`EngineContext`].
//!
//! Any number of threads may submit work; one dedicated thread runs it, in
//! submission order, one task at a time. Each submission returns a
//! [`TaskHandle`] future.

mod task;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use futures::channel::oneshot;
use sh_core::{DispatcherOptions, HostError, Value};
use sh_runtime::EngineContext;
use tracing::{debug, trace, warn};

pub use task::{TaskHandle, TaskStatus};
use task::{AbandonGuard, TaskShared};

type Job = Box<dyn FnOnce(&EngineContext) + Send + 'static>;

struct QueuedJob {
    id: u64,
    run: Job,
}

pub struct Dispatcher {
    context: Arc<EngineContext>,
    sender: Option<Sender<QueuedJob>>,
    worker: Option<JoinHandle<()>>,
    next_id: AtomicU64,
    pending: Arc<AtomicUsize>,
    name: String,
}

impl Dispatcher {
    pub fn spawn(
        context: Arc<EngineContext>,
        options: DispatcherOptions,
    ) -> Result<Self, HostError> {
        let name = options.thread_name().to_string();
        let (sender, receiver) = channel::unbounded::<QueuedJob>();
        let pending = Arc::new(AtomicUsize::new(0));

        let mut builder = thread::Builder::new().name(name.clone());
        if let Some(stack_size) = options.stack_size {
            builder = builder.stack_size(stack_size);
        }
        let worker_context = Arc::clone(&context);
        let worker_name = name.clone();
        let worker = builder
            .spawn(move || run_worker(&worker_name, &worker_context, receiver))
            .map_err(|error| {
                HostError::state(
                    "DISPATCH_SPAWN_FAILED",
                    format!("Failed to spawn dispatcher thread \"{}\": {}", name, error),
                )
            })?;

        debug!(dispatcher = %name, context = context.id(), "dispatcher started");
        Ok(Self {
            context,
            sender: Some(sender),
            worker: Some(worker),
            next_id: AtomicU64::new(1),
            pending,
            name,
        })
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tasks still waiting to start. Cancelled tasks leave the count as soon
    /// as they are cancelled, not when the worker skips them.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Queues `operation` to run on the worker thread against the context.
    pub fn submit<T, F>(&self, operation: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&EngineContext) -> Result<T, HostError> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (result_tx, result_rx) = oneshot::channel();
        let shared = Arc::new(TaskShared::new(result_tx, Arc::clone(&self.pending)));
        let guard = AbandonGuard(Arc::clone(&shared));

        let run: Job = Box::new(move |context: &EngineContext| {
            let task = &guard.0;
            if !task.begin() {
                trace!(task = id, "skipping cancelled task");
                return;
            }
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| operation(context)))
                .unwrap_or_else(|payload| Err(panic_error(id, payload)));
            task.complete(outcome);
        });

        let handle = TaskHandle::new(id, shared, result_rx);
        match &self.sender {
            Some(sender) => {
                if sender.send(QueuedJob { id, run }).is_err() {
                    // The rejected job is dropped here and resolves the handle.
                    warn!(dispatcher = %self.name, task = id, "worker stopped; task rejected");
                } else {
                    trace!(dispatcher = %self.name, task = id, "task queued");
                }
            }
            None => drop(run),
        }
        handle
    }

    pub fn submit_eval(&self, code: impl Into<String>) -> TaskHandle<Value> {
        let code = code.into();
        self.submit(move |context| context.eval(&code))
    }

    /// By-reference changes to `args` are not observable here; use
    /// [`submit`](Self::submit) to read them back.
    pub fn submit_function_invocation(
        &self,
        name: impl Into<String>,
        mut args: Vec<Value>,
    ) -> TaskHandle<Value> {
        let name = name.into();
        self.submit(move |context| context.invoke_function(&name, &mut args))
    }

    pub fn submit_method_invocation(
        &self,
        target: Value,
        name: impl Into<String>,
        mut args: Vec<Value>,
    ) -> TaskHandle<Value> {
        let name = name.into();
        self.submit(move |context| context.invoke_method(&target, &name, &mut args))
    }

    pub fn submit_load_persistent(
        &self,
        name: impl Into<String>,
        code: impl Into<String>,
    ) -> TaskHandle<()> {
        let name = name.into();
        let code = code.into();
        self.submit(move |context| context.load_persistent(&name, &code))
    }

    pub fn submit_load_modules(&self, targets: Vec<(String, String)>) -> TaskHandle<()> {
        self.submit(move |context| context.load_modules(targets))
    }

    /// Stops accepting work, lets the worker finish everything already
    /// queued, and joins it.
    pub fn shutdown(mut self) -> Result<(), HostError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), HostError> {
        drop(self.sender.take());
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        worker.join().map_err(|_| {
            HostError::state(
                "DISPATCH_WORKER_PANICKED",
                format!("Dispatcher thread \"{}\" panicked.", self.name),
            )
        })?;
        debug!(dispatcher = %self.name, "dispatcher stopped");
        Ok(())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Err(error) = self.stop() {
            warn!(dispatcher = %self.name, %error, "dispatcher stop failed");
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.name)
            .field("context", &self.context.id())
            .field("pending", &self.pending())
            .finish()
    }
}

fn run_worker(name: &str, context: &EngineContext, receiver: Receiver<QueuedJob>) {
    trace!(dispatcher = name, "worker loop started");
    for job in receiver {
        trace!(dispatcher = name, task = job.id, "running task");
        (job.run)(context);
    }
    trace!(dispatcher = name, "worker loop finished");
}

fn panic_error(id: u64, payload: Box<dyn Any + Send>) -> HostError {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    warn!(task = id, detail = %detail, "task panicked");
    HostError::engine(
        "DISPATCH_TASK_PANICKED",
        format!("Task {} panicked: {}", id, detail),
    )
}

#[cfg(test)]
mod dispatcher_tests {
    use super::*;

    #[test]
    fn spawn_uses_configured_thread_name() {
        let dispatcher = Dispatcher::spawn(
            Arc::new(EngineContext::new()),
            DispatcherOptions {
                thread_name: Some("reports-worker".to_string()),
                stack_size: None,
            },
        )
        .expect("spawn");
        assert_eq!(dispatcher.name(), "reports-worker");
        let seen = dispatcher
            .submit(|_| Ok(thread::current().name().map(str::to_string)))
            .wait()
            .expect("thread name");
        assert_eq!(seen.as_deref(), Some("reports-worker"));
        dispatcher.shutdown().expect("shutdown");
    }

    #[test]
    fn panic_payloads_become_messages() {
        let error = panic_error(3, Box::new("boom"));
        assert_eq!(error.code, "DISPATCH_TASK_PANICKED");
        assert!(error.message.contains("boom"));
        let error = panic_error(4, Box::new(String::from("owned")));
        assert!(error.message.contains("owned"));
        let error = panic_error(5, Box::new(17_u8));
        assert!(error.message.contains("unknown panic"));
    }
}

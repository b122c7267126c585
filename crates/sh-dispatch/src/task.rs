use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use parking_lot::Mutex;
use sh_core::HostError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    fn as_u8(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Running => 1,
            Self::Completed => 2,
            Self::Failed => 3,
            Self::Cancelled => 4,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Queued,
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Failed,
            _ => Self::Cancelled,
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

pub(crate) type TaskOutcome<T> = Result<T, HostError>;

/// State shared between a queued job and its handle.
///
/// `queued` counts the dispatcher's tasks still in `Queued`; every task adds
/// one on creation and removes it on its single transition out of `Queued`.
pub(crate) struct TaskShared<T> {
    status: AtomicU8,
    sender: Mutex<Option<oneshot::Sender<TaskOutcome<T>>>>,
    queued: Arc<AtomicUsize>,
}

impl<T> TaskShared<T> {
    pub(crate) fn new(sender: oneshot::Sender<TaskOutcome<T>>, queued: Arc<AtomicUsize>) -> Self {
        queued.fetch_add(1, Ordering::AcqRel);
        Self {
            status: AtomicU8::new(TaskStatus::Queued.as_u8()),
            sender: Mutex::new(Some(sender)),
            queued,
        }
    }

    pub(crate) fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn leave_queue(&self, to: TaskStatus) -> bool {
        let left = self
            .status
            .compare_exchange(
                TaskStatus::Queued.as_u8(),
                to.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if left {
            self.queued.fetch_sub(1, Ordering::AcqRel);
        }
        left
    }

    /// Claims the task for the worker. Fails if it was cancelled first.
    pub(crate) fn begin(&self) -> bool {
        self.leave_queue(TaskStatus::Running)
    }

    pub(crate) fn cancel(&self) -> bool {
        if !self.leave_queue(TaskStatus::Cancelled) {
            return false;
        }
        self.send(Err(HostError::cancelled(
            "DISPATCH_TASK_CANCELLED",
            "Task was cancelled before it started.",
        )));
        true
    }

    pub(crate) fn complete(&self, outcome: TaskOutcome<T>) {
        let status = if outcome.is_ok() {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        self.status.store(status.as_u8(), Ordering::Release);
        self.send(outcome);
    }

    /// Resolves a task that will never run because the worker is gone.
    pub(crate) fn abandon(&self) {
        if self.leave_queue(TaskStatus::Failed) {
            self.send(Err(HostError::state(
                "DISPATCH_WORKER_STOPPED",
                "Dispatcher worker is not running.",
            )));
        }
    }

    fn send(&self, outcome: TaskOutcome<T>) {
        if let Some(sender) = self.sender.lock().take() {
            // The handle may have been dropped; the result is discarded then.
            let _ = sender.send(outcome);
        }
    }
}

/// Resolves the task as abandoned if the job is dropped without running.
pub(crate) struct AbandonGuard<T>(pub(crate) Arc<TaskShared<T>>);

impl<T> Drop for AbandonGuard<T> {
    fn drop(&mut self) {
        self.0.abandon();
    }
}

/// Future for a submitted task.
///
/// Resolves with the task's result, its error, or a cancellation error.
/// Dropping the handle does not stop the task.
pub struct TaskHandle<T> {
    id: u64,
    shared: Arc<TaskShared<T>>,
    receiver: oneshot::Receiver<TaskOutcome<T>>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(
        id: u64,
        shared: Arc<TaskShared<T>>,
        receiver: oneshot::Receiver<TaskOutcome<T>>,
    ) -> Self {
        Self {
            id,
            shared,
            receiver,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> TaskStatus {
        self.shared.status()
    }

    /// Cancels the task if it has not started. Returns whether it did.
    pub fn cancel(&self) -> bool {
        self.shared.cancel()
    }

    /// Blocks the calling thread until the task resolves.
    pub fn wait(self) -> Result<T, HostError> {
        futures::executor::block_on(self)
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, HostError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(HostError::state(
                "DISPATCH_WORKER_STOPPED",
                "Task was dropped without a result.",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod task_tests {
    use super::*;
    use sh_core::ErrorKind;

    fn task<T>() -> (Arc<TaskShared<T>>, TaskHandle<T>) {
        queued_task(Arc::new(AtomicUsize::new(0)))
    }

    fn queued_task<T>(queued: Arc<AtomicUsize>) -> (Arc<TaskShared<T>>, TaskHandle<T>) {
        let (sender, receiver) = oneshot::channel();
        let shared = Arc::new(TaskShared::new(sender, queued));
        let handle = TaskHandle::new(1, Arc::clone(&shared), receiver);
        (shared, handle)
    }

    #[test]
    fn completed_task_resolves_with_value() {
        let (shared, handle) = task::<u32>();
        assert_eq!(handle.status(), TaskStatus::Queued);
        assert!(shared.begin());
        shared.complete(Ok(7));
        assert_eq!(handle.status(), TaskStatus::Completed);
        assert_eq!(handle.wait().expect("value"), 7);
    }

    #[test]
    fn cancel_only_wins_before_start() {
        let (shared, handle) = task::<()>();
        assert!(handle.cancel());
        assert!(!shared.begin());
        assert!(!handle.cancel());
        assert_eq!(handle.status(), TaskStatus::Cancelled);
        let error = handle.wait().expect_err("cancelled");
        assert_eq!(error.kind, ErrorKind::Cancelled);
        assert_eq!(error.code, "DISPATCH_TASK_CANCELLED");

        let (shared, handle) = task::<()>();
        assert!(shared.begin());
        assert!(!handle.cancel());
        assert_eq!(handle.status(), TaskStatus::Running);
    }

    #[test]
    fn dropped_job_resolves_as_worker_stopped() {
        let (shared, handle) = task::<()>();
        drop(AbandonGuard(shared));
        let error = handle.wait().expect_err("abandoned");
        assert_eq!(error.code, "DISPATCH_WORKER_STOPPED");
        assert_eq!(error.kind, ErrorKind::State);
    }

    #[test]
    fn abandon_after_completion_is_ignored() {
        let (shared, handle) = task::<u8>();
        assert!(shared.begin());
        shared.complete(Err(HostError::engine("ENGINE_EVAL_ERROR", "bad")));
        drop(AbandonGuard(shared));
        assert_eq!(handle.status(), TaskStatus::Failed);
        assert_eq!(handle.wait().expect_err("failed").code, "ENGINE_EVAL_ERROR");
    }

    #[test]
    fn queued_count_drops_once_per_task() {
        let queued = Arc::new(AtomicUsize::new(0));
        let (started, _started_handle) = queued_task::<()>(Arc::clone(&queued));
        let (cancelled, cancelled_handle) = queued_task::<()>(Arc::clone(&queued));
        let (dropped, _dropped_handle) = queued_task::<()>(Arc::clone(&queued));
        assert_eq!(queued.load(Ordering::Acquire), 3);

        assert!(cancelled_handle.cancel());
        assert_eq!(queued.load(Ordering::Acquire), 2);
        assert!(!cancelled.begin());
        drop(AbandonGuard(cancelled));
        assert_eq!(queued.load(Ordering::Acquire), 2);

        assert!(started.begin());
        started.complete(Ok(()));
        drop(AbandonGuard(started));
        assert_eq!(queued.load(Ordering::Acquire), 1);

        drop(AbandonGuard(dropped));
        assert_eq!(queued.load(Ordering::Acquire), 0);
    }

    #[test]
    fn finished_statuses() {
        assert!(TaskStatus::Completed.is_finished());
        assert!(TaskStatus::Cancelled.is_finished());
        assert!(!TaskStatus::Running.is_finished());
    }
}

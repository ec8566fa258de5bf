//! Task actors: asynchronous work invoked by a machine.
//!
//! A task runs once on the ambient tokio runtime and reports exactly one
//! outcome to its parent. Stopping aborts the task; a result that arrives
//! after stop is dropped.

use crate::actor::{ActorCell, ActorStatus};
use crate::error::{ActorError, RuntimeError};
use crate::logic::{TaskFn, TaskOutcome};
use crate::snapshot::Snapshot;
use crate::subscription::{SnapshotCallback, Subscription};
use parking_lot::Mutex;
use rstate_core::Event;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;

struct TaskInner {
    status: ActorStatus,
    input: Option<Value>,
    handle: Option<JoinHandle<()>>,
}

pub(crate) struct TaskActor {
    id: String,
    session_id: String,
    task: TaskFn,
    parent: Option<Weak<dyn ActorCell>>,
    this: Weak<TaskActor>,
    inner: Mutex<TaskInner>,
}

impl TaskActor {
    pub(crate) fn spawn(
        id: String,
        task: TaskFn,
        input: Value,
        parent: Option<Weak<dyn ActorCell>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id,
            session_id: uuid::Uuid::new_v4().to_string(),
            task,
            parent,
            this: this.clone(),
            inner: Mutex::new(TaskInner {
                status: ActorStatus::NotStarted,
                input: Some(input),
                handle: None,
            }),
        })
    }

    fn fail_without_runtime(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.status != ActorStatus::NotStarted {
                return;
            }
            inner.status = ActorStatus::Errored;
            inner.input = None;
        }
        let error = RuntimeError::NoAsyncRuntime {
            actor_id: self.id.clone(),
        };
        tracing::warn!(actor = %self.id, error = %error, "Task actor failed to start");
        self.report(Err(ActorError::new(&self.id, error.to_string())));
    }

    fn complete(&self, result: Result<TaskOutcome, ActorError>) {
        {
            let mut inner = self.inner.lock();
            if inner.status != ActorStatus::Active {
                tracing::debug!(actor = %self.id, "Task result ignored after stop");
                return;
            }
            inner.status = if result.is_ok() {
                ActorStatus::Stopped
            } else {
                ActorStatus::Errored
            };
            inner.handle = None;
        }
        self.report(result);
    }

    fn report(&self, result: Result<TaskOutcome, ActorError>) {
        let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) else {
            tracing::debug!(actor = %self.id, "Task finished without a parent");
            return;
        };

        let event = match result {
            Ok(TaskOutcome::Done(output)) => {
                tracing::debug!(actor = %self.id, "Task done");
                Event::done_invoke(&self.id, output)
            }
            Ok(TaskOutcome::Emit(event)) => event,
            Err(error) => {
                let error = error.for_actor(&self.id);
                tracing::warn!(actor = %self.id, error = %error, "Task failed");
                Event::error_platform(&self.id, error.to_value())
            }
        };
        parent.send(event);
    }
}

impl ActorCell for TaskActor {
    fn id(&self) -> &str {
        &self.id
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn status(&self) -> ActorStatus {
        self.inner.lock().status
    }

    fn send(&self, event: Event) {
        tracing::debug!(
            actor = %self.id,
            event = %event.event_type,
            "Task actors do not accept events"
        );
    }

    fn start(&self) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                self.fail_without_runtime();
                return;
            }
        };

        let input = {
            let mut inner = self.inner.lock();
            if inner.status != ActorStatus::NotStarted {
                return;
            }
            inner.status = ActorStatus::Active;
            inner.input.take().unwrap_or(Value::Null)
        };

        let future = (self.task)(input);
        let this = self.this.clone();
        let handle = runtime.spawn(async move {
            let result = future.await;
            if let Some(actor) = this.upgrade() {
                actor.complete(result);
            }
        });

        let mut inner = self.inner.lock();
        if inner.status == ActorStatus::Active {
            inner.handle = Some(handle);
        } else {
            handle.abort();
        }
    }

    fn stop(&self) {
        let handle = {
            let mut inner = self.inner.lock();
            if inner.status.is_terminal() {
                return;
            }
            inner.status = ActorStatus::Stopped;
            inner.input = None;
            inner.handle.take()
        };
        if let Some(handle) = handle {
            handle.abort();
        }
        tracing::debug!(actor = %self.id, "Task stopped");
    }

    fn snapshot(&self) -> Option<Arc<Snapshot>> {
        None
    }

    fn subscribe(&self, _callback: SnapshotCallback) -> Option<Subscription> {
        None
    }
}

//! Shared background scheduler for I/O workers, reconnects and heartbeats.
//!
//! Backed by a dedicated multi-thread tokio runtime with a fixed number of
//! workers, so resource use stays bounded no matter how many connections
//! churn. Every task comes back as a cancelable [`TaskHandle`].

use crate::error::{RealtimeError, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Cancelable handle to a scheduled task.
#[derive(Debug)]
pub struct TaskHandle {
    abort: AbortHandle,
}

impl TaskHandle {
    /// Cancel the task. No-op if it already finished.
    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// Cheaply cloneable handle on the shared scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    shut_down: AtomicBool,
}

impl Scheduler {
    /// Start a scheduler with `threads` worker threads.
    pub fn new(threads: usize) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads)
            .max_blocking_threads(threads * 8)
            .thread_name("realtime-scheduler")
            .enable_all()
            .build()
            .map_err(|e| RealtimeError::Configuration(format!("failed to start scheduler: {e}")))?;
        let handle = runtime.handle().clone();
        debug!(threads, "scheduler started");

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                runtime: Mutex::new(Some(runtime)),
                handle,
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Run `future` on a worker.
    pub fn spawn<F>(&self, future: F) -> Result<TaskHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shut_down() {
            return Err(RealtimeError::Shutdown);
        }
        let task = self.inner.handle.spawn(future);
        Ok(TaskHandle {
            abort: task.abort_handle(),
        })
    }

    /// Run `future` once after `delay`.
    pub fn schedule_once<F>(&self, delay: Duration, future: F) -> Result<TaskHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            future.await;
        })
    }

    /// Call `tick` every `period`, first after one full period, until it
    /// returns `ControlFlow::Break` or the task is cancelled.
    pub fn schedule_every<F>(&self, period: Duration, mut tick: F) -> Result<TaskHandle>
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        self.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if tick().is_break() {
                    break;
                }
            }
        })
    }

    /// Block the calling thread until `future` completes on the scheduler
    /// or `timeout` passes. Returns false on timeout, and without waiting
    /// when called from async context or after shutdown.
    pub fn block_on_timeout<F>(&self, timeout: Duration, future: F) -> bool
    where
        F: Future<Output = ()>,
    {
        if self.is_shut_down() {
            return false;
        }
        if Handle::try_current().is_ok() {
            warn!("cannot block on the scheduler from async context");
            return false;
        }
        self.inner
            .handle
            .block_on(async { tokio::time::timeout(timeout, future).await.is_ok() })
    }

    /// Stop accepting work and tear the runtime down. Async tasks are
    /// dropped at their next yield point; blocking sections (handlers)
    /// get up to `timeout` to finish. Callers that need in-flight async
    /// work to complete wait on it first with
    /// [`block_on_timeout`](Self::block_on_timeout). Idempotent.
    pub fn shutdown(&self, timeout: Duration) {
        self.inner.shut_down.store(true, Ordering::Release);
        let Some(runtime) = self.inner.runtime.lock().take() else {
            return;
        };
        if Handle::try_current().is_ok() {
            // Blocking waits are not allowed inside an async context.
            warn!("scheduler shut down from async context; not waiting for tasks");
            runtime.shutdown_background();
        } else {
            runtime.shutdown_timeout(timeout);
        }
        info!("scheduler stopped");
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

/*
 * Copyright (C) 2024 The Annotator Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Delayed task execution with cancellation, used to requeue workloads after
//! a transient failure.

use crate::annotator::logger::log_error;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::future::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "scheduler";

pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Clone)]
pub struct ScheduleContext {
    task_id: TaskId,
    label: &'static str,
    scheduled_for: Option<DateTime<Utc>>,
}

impl ScheduleContext {
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn scheduled_for(&self) -> Option<DateTime<Utc>> {
        self.scheduled_for
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TaskId(u64);

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    next_id: AtomicU64,
}

#[derive(Clone, Debug)]
pub enum ScheduleSpec {
    Immediate { label: &'static str },
    After { label: &'static str, delay: Duration },
}

type JobFn = dyn FnOnce(ScheduleContext) -> JobFuture + Send + 'static;

/// Handle to a scheduled task. Dropping it leaves the task running.
pub struct ScheduledTaskHandle {
    cancellation: CancellationToken,
    join: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Scheduler {
    pub fn global() -> Scheduler {
        static INSTANCE: OnceLock<Scheduler> = OnceLock::new();
        INSTANCE
            .get_or_init(|| Scheduler {
                inner: Arc::new(SchedulerInner {
                    next_id: AtomicU64::new(1),
                }),
            })
            .clone()
    }

    /// Schedules `job` per `spec`. The task is also abandoned when `parent` is
    /// cancelled before it starts.
    pub fn schedule<F>(
        &self,
        spec: ScheduleSpec,
        parent: &CancellationToken,
        job: F,
    ) -> ScheduledTaskHandle
    where
        F: FnOnce(ScheduleContext) -> JobFuture + Send + 'static,
    {
        let job = Box::new(job) as Box<JobFn>;
        let task_id = TaskId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let cancellation = parent.child_token();
        let (label, delay) = match spec {
            ScheduleSpec::Immediate { label } => (label, Duration::ZERO),
            ScheduleSpec::After { label, delay } => (label, delay),
        };
        let ctx = ScheduleContext {
            task_id,
            label,
            scheduled_for: compute_scheduled_time(delay),
        };
        let join_handle = spawn_after(cancellation.clone(), delay, ctx, job);
        ScheduledTaskHandle {
            cancellation,
            join: Arc::new(Mutex::new(Some(join_handle))),
        }
    }
}

fn spawn_after(
    cancellation: CancellationToken,
    delay: Duration,
    ctx: ScheduleContext,
    job: Box<JobFn>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if !delay.is_zero() {
            tokio::select! {
                _ = cancellation.cancelled() => return,
                _ = time::sleep(delay) => {}
            }
        }
        if cancellation.is_cancelled() {
            return;
        }
        run_job(job, ctx).await;
    })
}

async fn run_job(job: Box<JobFn>, ctx: ScheduleContext) {
    let task_label = format!("{:?}", ctx.task_id);
    let label = ctx.label;
    if AssertUnwindSafe(job(ctx)).catch_unwind().await.is_err() {
        log_error(
            COMPONENT,
            "Scheduled task panicked",
            &[("task", task_label.as_str()), ("label", label)],
        );
    }
}

fn compute_scheduled_time(delay: Duration) -> Option<DateTime<Utc>> {
    ChronoDuration::from_std(delay)
        .ok()
        .map(|delta| Utc::now() + delta)
}

impl ScheduledTaskHandle {
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub async fn join(&self) -> Result<(), tokio::task::JoinError> {
        let maybe_handle = self
            .join
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match maybe_handle {
            Some(handle) => handle.await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn immediate_task_executes() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let handle = Scheduler::global().schedule(
            ScheduleSpec::Immediate { label: "immediate" },
            &CancellationToken::new(),
            move |ctx| {
                Box::pin(async move {
                    assert_eq!(ctx.label(), "immediate");
                    counter_clone.fetch_add(1, Ordering::SeqCst);
                })
            },
        );

        handle.join().await.expect("join should succeed");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_task_waits_for_delay() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let handle = Scheduler::global().schedule(
            ScheduleSpec::After {
                label: "delayed",
                delay: Duration::from_secs(60),
            },
            &CancellationToken::new(),
            move |ctx| {
                Box::pin(async move {
                    assert!(ctx.scheduled_for().is_some());
                    counter_clone.fetch_add(1, Ordering::SeqCst);
                })
            },
        );

        time::sleep(Duration::from_secs(59)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        handle.join().await.expect("join should succeed");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_abandons_pending_task() {
        let parent = CancellationToken::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let handle = Scheduler::global().schedule(
            ScheduleSpec::After {
                label: "cancelled",
                delay: Duration::from_secs(5),
            },
            &parent,
            move |_| {
                Box::pin(async move {
                    counter_clone.fetch_add(1, Ordering::SeqCst);
                })
            },
        );

        parent.cancel();
        handle.join().await.expect("join should succeed");
        assert!(handle.is_cancelled());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}

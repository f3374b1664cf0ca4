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

use super::reconcile::{DependencyHandle, ReconcileContext, ReconcileOutcome};
use crate::annotator::annotation::AnnotationSink;
use crate::annotator::k8s::{WorkloadKey, WorkloadKind};
use crate::annotator::scheduler::{ScheduleSpec, ScheduledTaskHandle, Scheduler};
use crate::annotator::store::MetadataStore;
use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Controller runtime: one keyed work queue per workload kind plus shared
/// dependencies.
pub struct ControllerRuntime {
    dependencies: DependencyRegistry,
    queues: HashMap<WorkloadKind, WorkQueue<WorkloadKey>>,
}

impl ControllerRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dependencies: DependencyRegistry::new(),
            queues: WorkloadKind::ALL
                .iter()
                .map(|kind| (*kind, WorkQueue::new()))
                .collect(),
        })
    }

    pub fn register_dependency<T>(&self, dependency: Arc<T>) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.dependencies.insert(dependency)
    }

    pub fn dependency<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.dependencies.get::<T>()
    }

    pub fn register_store(&self, store: Arc<dyn MetadataStore>) {
        let _ = self.register_dependency(Arc::new(DependencyHandle::new(store)));
    }

    pub fn register_sink(&self, sink: Arc<dyn AnnotationSink>) {
        let _ = self.register_dependency(Arc::new(DependencyHandle::new(sink)));
    }

    pub fn context(&self) -> ReconcileContext<'_> {
        ReconcileContext::new(self)
    }

    pub fn work_queue(&self, kind: WorkloadKind) -> WorkQueue<WorkloadKey> {
        self.queues
            .get(&kind)
            .cloned()
            .unwrap_or_else(WorkQueue::new)
    }

    pub fn enqueue(&self, key: WorkloadKey) -> bool {
        match self.queues.get(&key.kind) {
            Some(queue) => queue.enqueue(key),
            None => false,
        }
    }

    /// Re-adds `key` once `delay` elapses unless `shutdown` fires first.
    pub fn requeue_after(
        &self,
        key: WorkloadKey,
        delay: Duration,
        shutdown: &CancellationToken,
    ) -> ScheduledTaskHandle {
        let queue = self.work_queue(key.kind);
        Scheduler::global().schedule(
            ScheduleSpec::After {
                label: "requeue",
                delay,
            },
            shutdown,
            move |_| {
                Box::pin(async move {
                    queue.enqueue(key);
                })
            },
        )
    }

    /// Spawns `concurrency` workers draining the queue of `kind`. Each key is
    /// marked done once its handler returns, and requeued when the handler
    /// asks for it. Workers stop when `shutdown` is cancelled, abandoning any
    /// in-flight handler.
    pub fn spawn_workers<H, Fut>(
        self: &Arc<Self>,
        kind: WorkloadKind,
        concurrency: usize,
        shutdown: CancellationToken,
        handler: H,
    ) -> Vec<JoinHandle<()>>
    where
        H: Fn(WorkloadKey) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ReconcileOutcome> + Send + 'static,
    {
        let handler = Arc::new(handler);
        (0..concurrency.max(1))
            .map(|_| {
                let runtime = Arc::clone(self);
                let queue = self.work_queue(kind);
                let handler = Arc::clone(&handler);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        let key = tokio::select! {
                            _ = shutdown.cancelled() => break,
                            next = queue.next() => match next {
                                Some(key) => key,
                                None => break,
                            },
                        };

                        let outcome = tokio::select! {
                            _ = shutdown.cancelled() => {
                                queue.done(&key);
                                break;
                            }
                            outcome = (handler.as_ref())(key.clone()) => outcome,
                        };
                        queue.done(&key);

                        if let ReconcileOutcome::RequeueAfter(delay) = outcome {
                            let _ = runtime.requeue_after(key, delay, &shutdown);
                        }
                    }
                })
            })
            .collect()
    }

    pub fn close_queues(&self) {
        for queue in self.queues.values() {
            queue.close();
        }
    }
}

#[derive(Default)]
struct DependencyRegistry {
    values: StdRwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl DependencyRegistry {
    fn new() -> Self {
        Self::default()
    }

    fn insert<T>(&self, dependency: Arc<T>) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let mut guard = self
            .values
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let existing = guard.insert(TypeId::of::<T>(), dependency as Arc<dyn Any + Send + Sync>);
        existing.and_then(|arc| arc.downcast::<T>().ok())
    }

    fn get<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let guard = self
            .values
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard
            .get(&TypeId::of::<T>())
            .and_then(|arc| arc.clone().downcast::<T>().ok())
    }
}

/// FIFO work queue that holds each key at most once and never hands the same
/// key to two consumers at a time. A key enqueued while being processed is
/// parked and handed out again after [`WorkQueue::done`].
pub struct WorkQueue<K> {
    inner: Arc<WorkQueueInner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct WorkQueueInner<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

struct QueueState<K> {
    pending: VecDeque<K>,
    queued: HashSet<K>,
    active: HashSet<K>,
    dirty: HashSet<K>,
    closed: bool,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(WorkQueueInner {
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    queued: HashSet::new(),
                    active: HashSet::new(),
                    dirty: HashSet::new(),
                    closed: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds `key`; returns `false` when it was already waiting or is being
    /// processed (in which case it is re-delivered after `done`).
    pub fn enqueue(&self, key: K) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        if state.active.contains(&key) {
            state.dirty.insert(key);
            return false;
        }
        if !state.queued.insert(key.clone()) {
            return false;
        }
        state.pending.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
        true
    }

    /// Waits for the next key and leases it to the caller. `None` once the
    /// queue is closed.
    pub async fn next(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(key) = state.pending.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    let more = !state.pending.is_empty();
                    drop(state);
                    if more {
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Releases the lease on `key`.
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.active.remove(key);
        if state.dirty.remove(key) && !state.closed && state.queued.insert(key.clone()) {
            state.pending.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.inner.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_active(&self, key: &K) -> bool {
        self.lock().active.contains(key)
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

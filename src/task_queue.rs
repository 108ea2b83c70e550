// Task queue
// Bounded priority queue feeding the agent worker pools. Dequeue order is
// highest priority first, ties broken FIFO by sequence number. Enqueue
// either blocks until space frees or rejects immediately, per caller
// choice. Every task carries a cancellation token that handlers check at
// their suspension points; tasks whose deadline has already passed are
// dropped at dequeue.

use anyhow::Result;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::CodeGraphError;
use crate::observability::{record, Counter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    ParseBatch,
    RemoveFiles,
    Query,
    Analyze,
}

#[derive(Debug, Clone)]
pub enum TaskPayload {
    ParseBatch {
        files: Vec<PathBuf>,
        incremental: bool,
    },
    RemoveFiles {
        files: Vec<PathBuf>,
    },
}

/// Priorities are plain integers; higher runs first.
pub mod priority {
    pub const INTERACTIVE: i32 = 100;
    pub const INDEXING: i32 = 50;
    pub const BACKGROUND: i32 = 10;
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub kind: TaskKind,
    pub priority: i32,
    pub payload: TaskPayload,
    pub deadline: Option<Instant>,
    pub cancel: CancellationToken,
}

impl Task {
    pub fn new(kind: TaskKind, priority: i32, payload: TaskPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            priority,
            payload,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.map_or(false, |d| Instant::now() >= d)
    }
}

/// Behaviour when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueuePolicy {
    Block,
    Reject,
}

struct QueuedTask {
    priority: i32,
    seq: u64,
    task: Task,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueuedTask {}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority wins; among equals the earlier sequence
        // number (FIFO) wins.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct QueueInner {
    heap: BinaryHeap<QueuedTask>,
    seq: u64,
}

/// Bounded, thread-safe priority queue.
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
    closed: AtomicBool,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                seq: 0,
            }),
            capacity: capacity.max(1),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a task. With `EnqueuePolicy::Reject` a full queue fails with
    /// `QueueFull`; with `Block` the caller waits for space.
    pub async fn enqueue(&self, task: Task, policy: EnqueuePolicy) -> Result<()> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(CodeGraphError::Cancelled.into());
            }
            {
                let mut inner = self.inner.lock();
                if inner.heap.len() < self.capacity {
                    let seq = inner.seq;
                    inner.seq += 1;
                    inner.heap.push(QueuedTask {
                        priority: task.priority,
                        seq,
                        task,
                    });
                    drop(inner);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }
            match policy {
                EnqueuePolicy::Reject => return Err(CodeGraphError::QueueFull.into()),
                EnqueuePolicy::Block => self.not_full.notified().await,
            }
        }
    }

    /// Take the next runnable task, waiting while the queue is empty.
    /// Cancelled and deadline-expired tasks are discarded here. Returns
    /// `None` after `close()` once the queue drains.
    pub async fn dequeue(&self) -> Option<Task> {
        loop {
            {
                let mut inner = self.inner.lock();
                while let Some(queued) = inner.heap.pop() {
                    self.not_full.notify_one();
                    if queued.task.cancel.is_cancelled() || queued.task.is_expired() {
                        record(Counter::TasksCancelled);
                        continue;
                    }
                    return Some(queued.task);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.not_empty.notified().await;
        }
    }

    /// Stop accepting work and wake every waiter.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn parse_task(priority: i32, name: &str) -> Task {
        Task::new(
            TaskKind::ParseBatch,
            priority,
            TaskPayload::ParseBatch {
                files: vec![PathBuf::from(name)],
                incremental: false,
            },
        )
    }

    fn task_file(task: &Task) -> String {
        match &task.payload {
            TaskPayload::ParseBatch { files, .. } => files[0].display().to_string(),
            TaskPayload::RemoveFiles { files } => files[0].display().to_string(),
        }
    }

    #[tokio::test]
    async fn dequeues_by_priority_then_fifo() -> Result<()> {
        let queue = TaskQueue::new(10);
        queue
            .enqueue(parse_task(priority::BACKGROUND, "low"), EnqueuePolicy::Reject)
            .await?;
        queue
            .enqueue(parse_task(priority::INDEXING, "mid-1"), EnqueuePolicy::Reject)
            .await?;
        queue
            .enqueue(parse_task(priority::INDEXING, "mid-2"), EnqueuePolicy::Reject)
            .await?;
        queue
            .enqueue(
                parse_task(priority::INTERACTIVE, "high"),
                EnqueuePolicy::Reject,
            )
            .await?;

        let order: Vec<String> = [
            queue.dequeue().await.expect("task"),
            queue.dequeue().await.expect("task"),
            queue.dequeue().await.expect("task"),
            queue.dequeue().await.expect("task"),
        ]
        .iter()
        .map(task_file)
        .collect();
        assert_eq!(order, vec!["high", "mid-1", "mid-2", "low"]);
        Ok(())
    }

    #[tokio::test]
    async fn reject_policy_fails_when_full() -> Result<()> {
        let queue = TaskQueue::new(1);
        queue
            .enqueue(parse_task(1, "a"), EnqueuePolicy::Reject)
            .await?;
        let err = queue
            .enqueue(parse_task(1, "b"), EnqueuePolicy::Reject)
            .await
            .unwrap_err();
        assert_eq!(
            crate::errors::as_codegraph_error(&err).map(|e| e.code()),
            Some("QUEUE_FULL")
        );
        Ok(())
    }

    #[tokio::test]
    async fn block_policy_waits_for_space() -> Result<()> {
        let queue = Arc::new(TaskQueue::new(1));
        queue
            .enqueue(parse_task(1, "first"), EnqueuePolicy::Reject)
            .await?;

        let blocked = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .enqueue(parse_task(1, "second"), EnqueuePolicy::Block)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!blocked.is_finished());

        assert_eq!(task_file(&queue.dequeue().await.expect("task")), "first");
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("unblocked")
            .expect("join")?;
        assert_eq!(queue.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_tasks_are_discarded() -> Result<()> {
        let queue = TaskQueue::new(10);
        let cancelled = parse_task(5, "cancelled");
        cancelled.cancel.cancel();
        queue.enqueue(cancelled, EnqueuePolicy::Reject).await?;
        queue
            .enqueue(parse_task(1, "live"), EnqueuePolicy::Reject)
            .await?;

        let task = queue.dequeue().await.expect("live task");
        assert_eq!(task_file(&task), "live");
        Ok(())
    }

    #[tokio::test]
    async fn expired_tasks_are_discarded() -> Result<()> {
        let queue = TaskQueue::new(10);
        let expired =
            parse_task(5, "expired").with_deadline(Instant::now() - Duration::from_secs(1));
        queue.enqueue(expired, EnqueuePolicy::Reject).await?;
        queue
            .enqueue(parse_task(1, "live"), EnqueuePolicy::Reject)
            .await?;
        assert_eq!(task_file(&queue.dequeue().await.expect("task")), "live");
        Ok(())
    }

    #[tokio::test]
    async fn close_unblocks_dequeue() {
        let queue = Arc::new(TaskQueue::new(10));
        let receiver = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        queue.close();
        let result = tokio::time::timeout(Duration::from_secs(1), receiver)
            .await
            .expect("timely")
            .expect("join");
        assert!(result.is_none());
    }
}

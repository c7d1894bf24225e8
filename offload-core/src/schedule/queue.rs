use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use tokio::sync::Notify;

use super::CopyTask;

/// A queued task with its computed priority and enqueue sequence.
#[derive(Debug)]
pub struct PrioritizedTask {
    pub priority: u8,
    pub seq: u64,
    pub task: CopyTask,
}

impl PartialEq for PrioritizedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for PrioritizedTask {}

impl PartialOrd for PrioritizedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PrioritizedTask {
    /// Max-heap order: higher priority first, earlier enqueue first on ties.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Bounded concurrent priority queue: non-blocking `offer`, awaitable `take`.
pub struct PriorityQueue {
    heap: Mutex<BinaryHeap<PrioritizedTask>>,
    notify: Notify,
    capacity: usize,
    seq: AtomicU64,
}

impl PriorityQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            seq: AtomicU64::new(0),
        }
    }

    /// Enqueue, or hand the task back when the queue is full.
    pub fn offer(&self, task: CopyTask, priority: u8) -> Result<(), CopyTask> {
        {
            let mut heap = self.heap.lock().expect("queue lock poisoned");
            if heap.len() >= self.capacity {
                return Err(task);
            }
            heap.push(PrioritizedTask {
                priority,
                seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
                task,
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the highest-priority task.
    pub async fn take(&self) -> PrioritizedTask {
        loop {
            if let Some(task) = self.try_take() {
                return task;
            }
            self.notify.notified().await;
        }
    }

    /// Pop without waiting.
    pub fn try_take(&self) -> Option<PrioritizedTask> {
        self.heap.lock().expect("queue lock poisoned").pop()
    }

    /// Remove everything pending (shutdown path).
    pub fn drain(&self) -> Vec<PrioritizedTask> {
        let mut heap = self.heap.lock().expect("queue lock poisoned");
        std::mem::take(&mut *heap).into_sorted_vec()
    }

    pub fn len(&self) -> usize {
        self.heap.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl fmt::Debug for PriorityQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::device::DeviceSerial;

    fn task(name: &str) -> CopyTask {
        CopyTask::new(
            PathBuf::from(name),
            DeviceSerial::new("SER-1").unwrap(),
            PathBuf::from("/mnt/a"),
            "A".into(),
            None,
        )
    }

    #[tokio::test]
    async fn higher_priority_comes_out_first() {
        let queue = PriorityQueue::new(16);
        queue.offer(task("low"), 2).unwrap();
        queue.offer(task("high"), 9).unwrap();
        queue.offer(task("mid"), 5).unwrap();

        assert_eq!(queue.take().await.task.source, PathBuf::from("high"));
        assert_eq!(queue.take().await.task.source, PathBuf::from("mid"));
        assert_eq!(queue.take().await.task.source, PathBuf::from("low"));
    }

    #[tokio::test]
    async fn equal_priority_is_fifo() {
        let queue = PriorityQueue::new(16);
        for name in ["first", "second", "third"] {
            queue.offer(task(name), 5).unwrap();
        }
        assert_eq!(queue.take().await.task.source, PathBuf::from("first"));
        assert_eq!(queue.take().await.task.source, PathBuf::from("second"));
        assert_eq!(queue.take().await.task.source, PathBuf::from("third"));
    }

    #[test]
    fn offer_fails_when_full() {
        let queue = PriorityQueue::new(2);
        queue.offer(task("a"), 5).unwrap();
        queue.offer(task("b"), 5).unwrap();
        let rejected = queue.offer(task("c"), 5).unwrap_err();
        assert_eq!(rejected.source, PathBuf::from("c"));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn take_wakes_on_offer() {
        let queue = std::sync::Arc::new(PriorityQueue::new(4));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.take().await.task.source })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.offer(task("late"), 1).unwrap();
        assert_eq!(waiter.await.unwrap(), PathBuf::from("late"));
    }

    #[test]
    fn drain_empties_the_queue_in_priority_order() {
        let queue = PriorityQueue::new(16);
        queue.offer(task("a"), 1).unwrap();
        queue.offer(task("b"), 9).unwrap();

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
        // into_sorted_vec is ascending; the tail is the highest priority.
        assert_eq!(drained.last().unwrap().task.source, PathBuf::from("b"));
    }
}

//! Shared piece work queue
//!
//! Hands each pending piece to exactly one worker at a time. Pieces move
//! `Pending -> InFlight -> Verified`, or back to `Pending` when a worker
//! gives them up.

use std::collections::{BTreeMap, VecDeque};

use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace, warn};

use super::piece::PieceTask;

/// Scheduling status of a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PieceStatus {
    /// Waiting for a worker
    #[default]
    Pending,
    /// Held by exactly one worker
    InFlight,
    /// Downloaded, verified and stored
    Verified,
}

#[derive(Debug)]
struct QueueState {
    pending: VecDeque<PieceTask>,
    status: BTreeMap<u32, PieceStatus>,
    outstanding: usize,
    closed: bool,
}

/// Work queue shared by all peer workers
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    /// Create a queue holding every task as `Pending`, in the given order
    pub fn new(tasks: Vec<PieceTask>) -> Self {
        let status = tasks.iter().map(|t| (t.index, PieceStatus::Pending)).collect();
        let outstanding = tasks.len();
        Self {
            state: Mutex::new(QueueState {
                pending: tasks.into(),
                status,
                outstanding,
                closed: outstanding == 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Take the next pending piece.
    ///
    /// Waits while every unfinished piece is in flight elsewhere, since any
    /// of them may still be requeued. Returns `None` once all pieces are
    /// verified or the queue has been closed.
    pub async fn next(&self) -> Option<PieceTask> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return None;
                }
                if let Some(task) = state.pending.pop_front() {
                    state.status.insert(task.index, PieceStatus::InFlight);
                    trace!("Dequeued piece {} ({} still pending)", task.index, state.pending.len());
                    return Some(task);
                }
            }

            notified.await;
        }
    }

    /// Return a piece to the queue after a failed attempt
    pub async fn requeue(&self, task: PieceTask) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }

        match state.status.get(&task.index).copied() {
            Some(PieceStatus::InFlight) => {
                debug!("Requeueing piece {}", task.index);
                state.status.insert(task.index, PieceStatus::Pending);
                state.pending.push_back(task);
                drop(state);
                self.notify.notify_waiters();
            }
            other => warn!("Ignoring requeue of piece {} in state {:?}", task.index, other),
        }
    }

    /// Mark a piece verified. Returns false if it was not in flight.
    pub async fn complete(&self, index: u32) -> bool {
        let mut state = self.state.lock().await;
        if state.status.get(&index) != Some(&PieceStatus::InFlight) {
            warn!("Piece {} completed while not in flight", index);
            return false;
        }

        state.status.insert(index, PieceStatus::Verified);
        state.outstanding -= 1;
        if state.outstanding == 0 {
            debug!("All pieces verified, closing work queue");
            state.closed = true;
            drop(state);
            self.notify.notify_waiters();
        }
        true
    }

    /// Stop handing out work; waiting workers return `None`
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Pieces not yet verified
    pub async fn remaining(&self) -> usize {
        self.state.lock().await.outstanding
    }

    pub async fn status(&self, index: u32) -> Option<PieceStatus> {
        self.state.lock().await.status.get(&index).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn tasks(count: u32) -> Vec<PieceTask> {
        (0..count).map(|index| PieceTask { index, hash: [0; 20], size: 1 }).collect()
    }

    #[tokio::test]
    async fn test_hands_out_in_order() {
        let queue = WorkQueue::new(tasks(3));
        assert_eq!(queue.next().await.unwrap().index, 0);
        assert_eq!(queue.next().await.unwrap().index, 1);
        assert_eq!(queue.status(1).await, Some(PieceStatus::InFlight));
        assert_eq!(queue.status(2).await, Some(PieceStatus::Pending));
    }

    #[tokio::test]
    async fn test_closes_when_all_verified() {
        let queue = WorkQueue::new(tasks(2));
        let a = queue.next().await.unwrap();
        let b = queue.next().await.unwrap();

        assert!(queue.complete(a.index).await);
        assert!(!queue.is_closed().await);
        assert!(queue.complete(b.index).await);
        assert!(queue.is_closed().await);
        assert_eq!(queue.remaining().await, 0);
        assert!(queue.next().await.is_none());
    }

    #[tokio::test]
    async fn test_complete_twice_is_rejected() {
        let queue = WorkQueue::new(tasks(2));
        let task = queue.next().await.unwrap();
        assert!(queue.complete(task.index).await);
        assert!(!queue.complete(task.index).await);
        assert!(!queue.complete(1).await);
        assert_eq!(queue.status(task.index).await, Some(PieceStatus::Verified));
    }

    #[tokio::test]
    async fn test_requeue_goes_to_back() {
        let queue = WorkQueue::new(tasks(2));
        let first = queue.next().await.unwrap();
        queue.requeue(first).await;
        assert_eq!(queue.status(0).await, Some(PieceStatus::Pending));

        assert_eq!(queue.next().await.unwrap().index, 1);
        assert_eq!(queue.next().await.unwrap().index, 0);
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_requeue() {
        let queue = Arc::new(WorkQueue::new(tasks(1)));
        let task = queue.next().await.unwrap();

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.requeue(task).await;
        let again = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(again.map(|t| t.index), Some(0));
    }

    #[tokio::test]
    async fn test_waiter_released_on_close() {
        let queue = Arc::new(WorkQueue::new(tasks(1)));
        let _held = queue.next().await.unwrap();

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close().await;
        let result = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_empty_queue_is_closed() {
        let queue = WorkQueue::new(Vec::new());
        assert!(queue.next().await.is_none());
    }
}

use crate::message::{NamespaceReply, NamespaceRequest, ResponsePayload};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

/// FIFO of pending requests owned by exactly one worker. Producers push
/// through `try_push` (fast-fail on capacity); the single consumer drains
/// through `pop`. The queue is scanned in place during idempotent folding,
/// which is why this is a mutex-guarded deque rather than a channel.
pub(crate) struct WorkerQueue {
    items: Mutex<VecDeque<NamespaceRequest>>,
    notify: Notify,
    /// 0 means unbounded.
    capacity: usize,
}

impl WorkerQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Returns the request to the caller when the queue is at capacity.
    pub fn try_push(&self, request: NamespaceRequest) -> Result<(), NamespaceRequest> {
        {
            let mut items = self.lock();
            if self.capacity > 0 && items.len() >= self.capacity {
                return Err(request);
            }
            items.push_back(request);
        }
        self.notify.notify_one();
        Ok(())
    }

    pub async fn pop(&self) -> NamespaceRequest {
        loop {
            let notified = self.notify.notified();
            if let Some(request) = self.lock().pop_front() {
                return request;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Folding pass after `completed` finished successfully: walk the queue
    /// front to back, answering every pending duplicate with the completed
    /// payload. The walk stops at the first message that invalidates the
    /// completed one; an intervening write must never be skipped over.
    pub fn fold(&self, completed: &NamespaceRequest, payload: &ResponsePayload) -> usize {
        let folded = {
            let mut items = self.lock();
            let mut folded = Vec::new();
            let mut i = 0;
            while i < items.len() {
                if items[i].invalidates(completed) {
                    break;
                }
                if items[i].subsumed_by(completed) {
                    if let Some(request) = items.remove(i) {
                        folded.push(request);
                    }
                } else {
                    i += 1;
                }
            }
            folded
        };

        let count = folded.len();
        for request in folded {
            request.send_reply(NamespaceReply::ok(payload.clone()));
        }
        count
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<NamespaceRequest>> {
        match self.items.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::NamespaceOp;
    use cluster_lib::{EntryId, Subject};
    use std::time::Duration;

    fn request(op: NamespaceOp, id: u128) -> NamespaceRequest {
        let (req, _rx) = NamespaceRequest::new(op, Subject::root(), Duration::from_secs(30));
        req.with_id(EntryId::new(0, id))
    }

    #[test]
    fn test_capacity_fast_fail() {
        let queue = WorkerQueue::new(2);
        assert!(queue.try_push(request(NamespaceOp::GetAttributes, 1)).is_ok());
        assert!(queue.try_push(request(NamespaceOp::GetAttributes, 2)).is_ok());
        assert!(queue.try_push(request(NamespaceOp::GetAttributes, 3)).is_err());
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = WorkerQueue::new(0);
        queue.try_push(request(NamespaceOp::GetAttributes, 1)).unwrap();
        queue.try_push(request(NamespaceOp::DeleteEntry, 2)).unwrap();
        assert_eq!(queue.pop().await.id, Some(EntryId::new(0, 1)));
        assert_eq!(queue.pop().await.id, Some(EntryId::new(0, 2)));
    }

    #[test]
    fn test_fold_stops_at_invalidating_write() {
        let queue = WorkerQueue::new(0);
        let completed = request(NamespaceOp::GetAttributes, 7);
        // Read, write, read - all on the completed target.
        queue.try_push(request(NamespaceOp::GetAttributes, 7)).unwrap();
        queue.try_push(request(NamespaceOp::DeleteEntry, 7)).unwrap();
        queue.try_push(request(NamespaceOp::GetAttributes, 7)).unwrap();

        let folded = queue.fold(&completed, &ResponsePayload::Empty);
        // Only the read ahead of the write may fold.
        assert_eq!(folded, 1);
        assert_eq!(queue.len(), 2);
    }
}

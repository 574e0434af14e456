//! Ordered queue of pending requests.
//!
//! The connection manager and the partitioner each own one of these. They
//! must stay element-for-element identical at every point where wire data is
//! matched, so every mutation applied to one is mirrored on the other through
//! an explicit control message.

use crate::error::ClientError;
use crate::request::Request;
use std::collections::VecDeque;

/// FIFO of requests with head re-insertion for requeues.
#[derive(Debug, Default)]
pub struct PendingQueue {
    items: VecDeque<Request>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, request: Request) {
        self.items.push_back(request);
    }

    pub fn extend(&mut self, requests: impl IntoIterator<Item = Request>) {
        self.items.extend(requests);
    }

    pub fn pop_front(&mut self) -> Option<Request> {
        self.items.pop_front()
    }

    pub fn push_front(&mut self, request: Request) {
        self.items.push_front(request);
    }

    /// Puts a previously drained batch back at the head, preserving its order.
    pub fn requeue_front(&mut self, batch: Vec<Request>) {
        for request in batch.into_iter().rev() {
            self.items.push_front(request);
        }
    }

    /// Pops up to `n` requests from the head.
    pub fn pop_n(&mut self, n: usize) -> Vec<Request> {
        let n = n.min(self.items.len());
        self.items.drain(..n).collect()
    }

    pub fn front(&self) -> Option<&Request> {
        self.items.front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Fails every request and empties the queue. Returns how many were removed.
    pub fn fail_all(&mut self, error: &ClientError) -> usize {
        let count = self.items.len();
        for request in self.items.drain(..) {
            request.fail(error.clone());
        }
        count
    }

    /// Request ids in queue order.
    pub fn ids(&self) -> Vec<u64> {
        self.items.iter().map(Request::id).collect()
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Arrival-ordered queue of received messages.
//!
//! The transport's receiver thread appends; the monitor's main thread
//! removes, either unconditionally or filtered by a predicate. The
//! predicate-filtered forms exist because a requester mid-transaction must
//! be able to pull its own acknowledgment out of the queue while leaving
//! (or servicing) unrelated traffic.

use crate::message::Message;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use std::time::Instant;

/// A thread-safe FIFO of [`Message`]s.
#[derive(Default)]
pub struct MessageQueue {
    inner: Mutex<VecDeque<Message>>,
    cond: Condvar,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `msg` and wakes all blocked waiters. Never fails.
    pub fn add(&self, msg: Message) {
        self.inner.lock().push_back(msg);
        self.cond.notify_all();
    }

    /// Removes the head message, blocking until one exists.
    pub fn remove(&self) -> Message {
        let mut inner = self.inner.lock();
        loop {
            if let Some(msg) = inner.pop_front() {
                return msg;
            }
            self.cond.wait(&mut inner);
        }
    }

    /// Removes the head message if the queue is non-empty.
    pub fn try_remove(&self) -> Option<Message> {
        self.inner.lock().pop_front()
    }

    /// Removes the first message satisfying `pred`, blocking until one
    /// exists. Non-matching messages are skipped, not reordered.
    pub fn remove_if(&self, mut pred: impl FnMut(&Message) -> bool) -> Message {
        let mut inner = self.inner.lock();
        loop {
            if let Some(pos) = inner.iter().position(&mut pred) {
                // Scan position is valid: the lock has been held since.
                if let Some(msg) = inner.remove(pos) {
                    return msg;
                }
            }
            self.cond.wait(&mut inner);
        }
    }

    /// Removes the first message satisfying `pred`, if any.
    pub fn try_remove_if(&self, mut pred: impl FnMut(&Message) -> bool) -> Option<Message> {
        let mut inner = self.inner.lock();
        let pos = inner.iter().position(&mut pred)?;
        inner.remove(pos)
    }

    /// Blocks until a message satisfying `pred` exists or `timeout` elapses,
    /// without removing it. Returns whether such a message exists.
    pub fn wait_for(&self, mut pred: impl FnMut(&Message) -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if inner.iter().any(&mut pred) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if self.cond.wait_for(&mut inner, deadline - now).timed_out() {
                return inner.iter().any(&mut pred);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Clones the queued messages in arrival order, for snapshotting.
    pub fn snapshot(&self) -> Vec<Message> {
        self.inner.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::MessageQueue;
    use crate::message::AccessKind;
    use crate::message::Message;
    use crate::protocol::MessageKind;
    use node_topology::NodeId;
    use std::sync::Arc;
    use std::time::Duration;

    fn request(page_no: u32) -> Message {
        Message::fetch_request(page_no, AccessKind::Read, NodeId(0))
    }

    fn page_of(msg: &Message) -> u32 {
        match msg.payload().unwrap() {
            crate::message::Payload::FetchRequest { page_no, .. } => page_no,
            _ => panic!("not a fetch request"),
        }
    }

    #[test]
    fn fifo_order() {
        let queue = MessageQueue::new();
        for page in 0..4 {
            queue.add(request(page));
        }
        for page in 0..4 {
            assert_eq!(page_of(&queue.remove()), page);
        }
        assert!(queue.try_remove().is_none());
    }

    #[test]
    fn predicate_removal_skips_without_reordering() {
        let queue = MessageQueue::new();
        for page in 0..4 {
            queue.add(request(page));
        }
        let msg = queue.try_remove_if(|m| page_of(m) == 2).unwrap();
        assert_eq!(page_of(&msg), 2);
        assert!(queue.try_remove_if(|m| page_of(m) == 2).is_none());
        let rest: Vec<_> = std::iter::from_fn(|| queue.try_remove().map(|m| page_of(&m))).collect();
        assert_eq!(rest, [0, 1, 3]);
    }

    #[test]
    fn blocking_remove_wakes_on_add() {
        let queue = Arc::new(MessageQueue::new());
        let waiter = {
            let queue = queue.clone();
            std::thread::spawn(move || page_of(&queue.remove_if(|m| page_of(m) == 1)))
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.add(request(0));
        queue.add(request(1));
        assert_eq!(waiter.join().unwrap(), 1);
        // The non-matching message is still queued.
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn wait_for_does_not_remove() {
        let queue = MessageQueue::new();
        assert!(!queue.wait_for(|m| m.kind == MessageKind::FETCH_REQUEST, Duration::from_millis(10)));
        queue.add(request(5));
        assert!(queue.wait_for(|m| m.kind == MessageKind::FETCH_REQUEST, Duration::from_millis(10)));
        assert_eq!(queue.len(), 1);
    }
}

//! Time-ordered holding area for messages awaiting their next attempt.
//!
//! A delay queue keeps messages invisible until their due time has passed.
//! The actor uses it to park messages between retry attempts, but messages
//! can also be enqueued manually to schedule one-off work.
//!
//! [`InMemoryDelayQueue`] is the default implementation: a mutex-guarded,
//! array-backed binary min-heap keyed by due time. The queue is purely
//! in-memory and does not survive a process restart.

use std::sync::{Mutex, PoisonError};

use futures::future::BoxFuture;
use tokio::time::Instant;

use crate::{
    error::{BoxError, ReadError},
    message::Message,
};

/// Callback invoked with a single message popped from a queue or source.
///
/// The returned result acts as the acknowledgment: `Ok` confirms the
/// message was handled and may be dropped by the owner, `Err` is a negative
/// acknowledgment asking the owner to make the message visible again.
pub type Visit<'a> = Box<dyn FnOnce(Message) -> BoxFuture<'a, Result<(), BoxError>> + Send + 'a>;

/// A concurrent priority structure releasing messages once they are due.
///
/// Implementations must be safe to call from every worker in the pool
/// concurrently.
pub trait DelayQueue: Send + Sync {
    /// Inserts a message, prioritized by its due time. An unset
    /// `scheduled_at` is normalized to the current time.
    fn enqueue(&self, msg: Message) -> Result<(), BoxError>;

    /// Pops the earliest-due message and hands it to `visit`.
    ///
    /// Returns `Err(ReadError::Exhausted)` when the queue is empty and
    /// `Err(ReadError::NoMessage)` when the earliest message is not yet
    /// due. If `visit` reports failure the message is pushed back
    /// unchanged; callback errors are handled internally and never
    /// propagate out of `dequeue`.
    fn dequeue<'a>(&'a self, visit: Visit<'a>) -> BoxFuture<'a, Result<(), ReadError>>;

    /// Releases any resources held by the queue. Called best-effort after
    /// all workers have exited.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Sharing a queue keeps a handle for manual enqueueing while the actor
/// owns its half.
impl<Q> DelayQueue for std::sync::Arc<Q>
where
    Q: DelayQueue + ?Sized,
{
    fn enqueue(&self, msg: Message) -> Result<(), BoxError> {
        (**self).enqueue(msg)
    }

    fn dequeue<'a>(&'a self, visit: Visit<'a>) -> BoxFuture<'a, Result<(), ReadError>> {
        (**self).dequeue(visit)
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        (**self).close()
    }
}

/// In-memory [`DelayQueue`] backed by a mutex-guarded binary min-heap.
///
/// Growth is unbounded; enqueueing never fails. The heap lock is held only
/// for mutations, never across the visit callback.
#[derive(Debug, Default)]
pub struct InMemoryDelayQueue {
    heap: Mutex<MessageHeap>,
}

impl InMemoryDelayQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        InMemoryDelayQueue::default()
    }

    /// Number of messages currently held, due or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the queue currently holds no messages.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MessageHeap> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DelayQueue for InMemoryDelayQueue {
    fn enqueue(&self, mut msg: Message) -> Result<(), BoxError> {
        let due = *msg.scheduled_at.get_or_insert_with(Instant::now);
        self.lock().push(Entry { due, msg });
        Ok(())
    }

    fn dequeue<'a>(&'a self, visit: Visit<'a>) -> BoxFuture<'a, Result<(), ReadError>> {
        Box::pin(async move {
            let entry = {
                let mut heap = self.lock();
                let due = match heap.peek_due() {
                    Some(due) => due,
                    None => return Err(ReadError::Exhausted),
                };
                if due >= Instant::now() {
                    return Err(ReadError::NoMessage);
                }
                match heap.pop() {
                    Some(entry) => entry,
                    None => return Err(ReadError::NoMessage),
                }
            };

            if visit(entry.msg.clone()).await.is_err() {
                // nACK: put it back, unchanged.
                self.lock().push(entry);
            }
            Ok(())
        })
    }
}

#[derive(Debug)]
struct Entry {
    due: Instant,
    msg: Message,
}

/// Array-backed binary min-heap ordered by due time.
#[derive(Debug, Default)]
struct MessageHeap {
    items: Vec<Entry>,
}

impl MessageHeap {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn peek_due(&self) -> Option<Instant> {
        self.items.first().map(|entry| entry.due)
    }

    fn push(&mut self, entry: Entry) {
        self.items.push(entry);
        self.sift_up(self.items.len() - 1);
    }

    fn pop(&mut self) -> Option<Entry> {
        if self.items.is_empty() {
            return None;
        }
        let entry = self.items.swap_remove(0);
        if !self.items.is_empty() {
            self.sift_down(0);
        }
        Some(entry)
    }

    fn sift_up(&mut self, mut at: usize) {
        while at > 0 {
            let parent = (at - 1) / 2;
            if self.items[at].due >= self.items[parent].due {
                break;
            }
            self.items.swap(at, parent);
            at = parent;
        }
    }

    fn sift_down(&mut self, mut at: usize) {
        loop {
            let left = 2 * at + 1;
            let right = 2 * at + 2;
            let mut smallest = at;
            if left < self.items.len() && self.items[left].due < self.items[smallest].due {
                smallest = left;
            }
            if right < self.items.len() && self.items[right].due < self.items[smallest].due {
                smallest = right;
            }
            if smallest == at {
                return;
            }
            self.items.swap(at, smallest);
            at = smallest;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::time::{advance, Instant};

    use super::*;

    async fn drain(queue: &InMemoryDelayQueue) -> Vec<Message> {
        let popped = Arc::new(Mutex::new(Vec::new()));
        loop {
            let popped = Arc::clone(&popped);
            let result = queue
                .dequeue(Box::new(move |msg| {
                    Box::pin(async move {
                        popped.lock().unwrap().push(msg);
                        Ok(())
                    })
                }))
                .await;
            match result {
                Ok(()) => continue,
                Err(ReadError::Exhausted) => break,
                Err(err) => panic!("unexpected dequeue error: {err}"),
            }
        }
        Arc::try_unwrap(popped).unwrap().into_inner().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn dequeues_in_due_time_order() {
        let queue = InMemoryDelayQueue::new();
        let base = Instant::now();

        for offset in [40u64, 10, 30, 0, 20] {
            let msg = Message::new(offset.to_string(), "")
                .with_scheduled_at(base + Duration::from_millis(offset));
            queue.enqueue(msg).unwrap();
        }
        assert_eq!(queue.len(), 5);

        advance(Duration::from_millis(50)).await;

        let popped = drain(&queue).await;
        let keys: Vec<&[u8]> = popped.iter().map(|m| m.key.as_slice()).collect();
        assert_eq!(keys, [b"0".as_slice(), b"10", b"20", b"30", b"40"]);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_queue_is_exhausted() {
        let queue = InMemoryDelayQueue::new();
        let result = queue
            .dequeue(Box::new(|_| Box::pin(async { Ok(()) })))
            .await;
        assert!(matches!(result, Err(ReadError::Exhausted)));
    }

    #[tokio::test(start_paused = true)]
    async fn not_yet_due_is_no_message() {
        let queue = InMemoryDelayQueue::new();
        let msg = Message::new("k", "v").with_scheduled_at(Instant::now() + Duration::from_secs(60));
        queue.enqueue(msg).unwrap();

        let result = queue
            .dequeue(Box::new(|_| Box::pin(async { Ok(()) })))
            .await;
        assert!(matches!(result, Err(ReadError::NoMessage)));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unset_due_time_defaults_to_now() {
        let queue = InMemoryDelayQueue::new();
        queue.enqueue(Message::new("k", "v")).unwrap();

        // Strictly-due check: at the same instant the message is not ready.
        let result = queue
            .dequeue(Box::new(|_| Box::pin(async { Ok(()) })))
            .await;
        assert!(matches!(result, Err(ReadError::NoMessage)));

        advance(Duration::from_millis(1)).await;
        let popped = drain(&queue).await;
        assert_eq!(popped.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn nack_pushes_the_message_back_unchanged() {
        let queue = InMemoryDelayQueue::new();
        let mut msg = Message::new("k", "v");
        msg.attempts = 3;
        queue.enqueue(msg).unwrap();
        advance(Duration::from_millis(1)).await;

        let result = queue
            .dequeue(Box::new(|_| Box::pin(async { Err("visit failed".into()) })))
            .await;
        assert!(result.is_ok(), "callback errors must not surface");
        assert_eq!(queue.len(), 1);

        let popped = drain(&queue).await;
        assert_eq!(popped.len(), 1);
        assert_eq!(popped[0].key, b"k");
        assert_eq!(popped[0].attempts, 3);
    }
}

//! The unit of work moved between sources, workers and the delay queue.

use tokio::time::Instant;

/// A message flowing through the worker pool.
///
/// The key and value are opaque byte sequences; they are carried through the
/// system untouched and only interpreted by the [`Processor`] the user
/// supplies. The remaining fields are bookkeeping managed by the actor and
/// the delay queue.
///
/// [`Processor`]: crate::Processor
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    /// Identifying bytes for the message. Not interpreted by redrive.
    pub key: Vec<u8>,

    /// The message payload. Not interpreted by redrive.
    pub value: Vec<u8>,

    /// The earliest instant at which the message is eligible for
    /// processing. `None` means "unset"; the delay queue normalizes it to
    /// the current time on enqueue. Managed by the actor when scheduling
    /// retries.
    pub scheduled_at: Option<Instant>,

    /// Number of processing attempts made so far. Incremented by the actor
    /// immediately before every processor invocation, so the first try is
    /// attempt 1. Never reset by requeueing.
    pub attempts: u32,
}

impl Message {
    /// Creates a message with the given key and value, no due time, and
    /// zero attempts.
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Message {
            key: key.into(),
            value: value.into(),
            scheduled_at: None,
            attempts: 0,
        }
    }

    /// Sets the due time, returning the modified message.
    pub fn with_scheduled_at(mut self, at: Instant) -> Self {
        self.scheduled_at = Some(at);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_starts_unscheduled() {
        let msg = Message::new("k", "v");
        assert_eq!(msg.key, b"k");
        assert_eq!(msg.value, b"v");
        assert_eq!(msg.scheduled_at, None);
        assert_eq!(msg.attempts, 0);
    }
}

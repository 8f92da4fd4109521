//! User-supplied business logic applied to each message.

use futures::future::BoxFuture;

use crate::{error::ProcessError, message::Message};

/// Business logic invoked by the actor for every message it picks up.
///
/// The disposition returned drives the retry state machine: `Ok` is a
/// terminal success, [`ProcessError::Skip`] ignores the message,
/// [`ProcessError::Fail`] escalates it to the failure handler immediately,
/// and [`ProcessError::Retry`] schedules it for another attempt.
///
/// Implementations are shared by every worker and must be safe for
/// concurrent invocation. Async closures implement this trait directly:
///
/// ```
/// use redrive::{Message, ProcessError, Processor};
///
/// let processor = |msg: Message| async move {
///     if msg.value.is_empty() {
///         return Err(ProcessError::Skip);
///     }
///     Ok(())
/// };
/// # fn assert_processor(_: &impl Processor) {}
/// # assert_processor(&processor);
/// ```
pub trait Processor: Send + Sync {
    /// Processes a single message.
    fn process(&self, msg: Message) -> BoxFuture<'static, Result<(), ProcessError>>;
}

impl<F, Fut> Processor for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), ProcessError>> + Send + 'static,
{
    fn process(&self, msg: Message) -> BoxFuture<'static, Result<(), ProcessError>> {
        Box::pin(self(msg))
    }
}

/// Default processor used when none is configured: skips every message.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopProcessor;

impl Processor for NoopProcessor {
    fn process(&self, _msg: Message) -> BoxFuture<'static, Result<(), ProcessError>> {
        Box::pin(async { Err(ProcessError::Skip) })
    }
}

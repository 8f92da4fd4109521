//! The actor: a pool of workers interleaving source reads with delay-queue
//! drains.
//!
//! Each worker repeatedly tries the delay queue first, then the source, and
//! runs the configured [`Processor`] on whatever message it wins. A
//! transient processing failure sends the message back into the delay queue
//! with its next due time pushed out by the [`Backoff`] policy; once the
//! retry budget is exhausted (or a failure is unconditional) the message is
//! handed to the failure handler instead. Workers idle on a poll interval
//! when nothing is ready and exit once the source and the queue are both
//! exhausted, or when the cancellation token fires.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::delay_queue::{DelayQueue, InMemoryDelayQueue, Visit};
use crate::error::{BoxError, ProcessError, ReadError, RunError};
use crate::message::Message;
use crate::processor::{NoopProcessor, Processor};
use crate::source::Source;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Handler invoked with the final message and the last error once retries
/// are exhausted or a failure is unconditional. Its own error is logged,
/// never escalated.
pub type FailureHandler = Box<dyn Fn(Message, BoxError) -> Result<(), BoxError> + Send + Sync>;

/// A stream-processing actor: consumes messages from a [`Source`], applies
/// a [`Processor`], and guarantees at-least-once handling through
/// time-ordered retries.
///
/// Configure with [`Actor::builder`], then call [`Actor::run`].
pub struct Actor {
    source: Option<Box<dyn Source>>,
    queue: Option<Box<dyn DelayQueue>>,
    processor: Box<dyn Processor>,
    backoff: Option<Box<dyn Backoff>>,
    on_failure: FailureHandler,
    workers: usize,
    max_retries: u32,
    poll_interval: Duration,
}

impl Actor {
    /// Starts building an actor.
    pub fn builder() -> ActorBuilder {
        ActorBuilder::new()
    }

    /// Spawns the configured number of workers and blocks until all of
    /// them exit, either because `cancel` fired or because the source and
    /// the delay queue both reported exhaustion. The source and queue are
    /// closed best-effort before returning.
    ///
    /// Normal shutdown returns `Ok(())`. Errors are returned only when no
    /// source is attached, or when a worker stopped on an unrecoverable
    /// source error.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), RunError> {
        let source = self.source.ok_or(RunError::MissingSource)?;
        let shared = Arc::new(Shared {
            source,
            queue: self.queue,
            processor: self.processor,
            backoff: self.backoff,
            on_failure: self.on_failure,
            max_retries: self.max_retries,
            poll_interval: self.poll_interval,
            source_exhausted: AtomicBool::new(false),
        });

        debug!(workers = self.workers, "spawning workers");
        let handles: Vec<_> = (0..self.workers)
            .map(|id| {
                let shared = Arc::clone(&shared);
                let cancel = cancel.clone();
                tokio::spawn(async move { shared.worker(id, &cancel).await })
            })
            .collect();

        let mut first_err = None;
        for (id, joined) in join_all(handles).await.into_iter().enumerate() {
            match joined {
                Ok(Ok(())) => info!(worker = id, "worker finished"),
                Ok(Err(err)) => {
                    error!(worker = id, error = %err, "worker exited with error");
                    first_err.get_or_insert(err);
                }
                Err(err) => error!(worker = id, error = %err, "worker task failed"),
            }
        }

        shared.close_all().await;
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Actor")
            .field("workers", &self.workers)
            .field("max_retries", &self.max_retries)
            .field("poll_interval", &self.poll_interval)
            .field("retries_enabled", &self.backoff.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Actor`].
///
/// Defaults: 1 worker, retries disabled (no backoff policy), 300ms poll
/// interval, a processor that skips every message, and a failure handler
/// that logs and drops. When a backoff policy is set without an explicit
/// delay queue, an [`InMemoryDelayQueue`] is used.
pub struct ActorBuilder {
    source: Option<Box<dyn Source>>,
    queue: Option<Box<dyn DelayQueue>>,
    processor: Option<Box<dyn Processor>>,
    backoff: Option<Box<dyn Backoff>>,
    on_failure: Option<FailureHandler>,
    workers: usize,
    max_retries: u32,
    poll_interval: Duration,
}

impl ActorBuilder {
    fn new() -> Self {
        ActorBuilder {
            source: None,
            queue: None,
            processor: None,
            backoff: None,
            on_failure: None,
            workers: 1,
            max_retries: 0,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Sets the message source. Required; [`Actor::run`] fails without one.
    pub fn source(mut self, source: impl Source + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Sets the delay queue used to park messages between retries.
    pub fn delay_queue(mut self, queue: impl DelayQueue + 'static) -> Self {
        self.queue = Some(Box::new(queue));
        self
    }

    /// Sets the processor applied to every message.
    pub fn processor(mut self, processor: impl Processor + 'static) -> Self {
        self.processor = Some(Box::new(processor));
        self
    }

    /// Enables retries with the given backoff policy.
    pub fn backoff(mut self, backoff: impl Backoff + 'static) -> Self {
        self.backoff = Some(Box::new(backoff));
        self
    }

    /// Sets the number of workers. Values below 1 are treated as 1.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets how many retries a message gets before it is escalated to the
    /// failure handler. Has no effect unless a backoff policy is set.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets how long an idle worker waits before polling again.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Sets the handler invoked when a message fails terminally.
    pub fn on_failure(
        mut self,
        on_failure: impl Fn(Message, BoxError) -> Result<(), BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.on_failure = Some(Box::new(on_failure));
        self
    }

    /// Finalizes the configuration.
    pub fn build(self) -> Actor {
        let queue = match (self.queue, self.backoff.is_some()) {
            (None, true) => Some(Box::new(InMemoryDelayQueue::new()) as Box<dyn DelayQueue>),
            (queue, _) => queue,
        };
        Actor {
            source: self.source,
            queue,
            processor: self
                .processor
                .unwrap_or_else(|| Box::new(NoopProcessor)),
            backoff: self.backoff,
            on_failure: self.on_failure.unwrap_or_else(default_failure_handler),
            workers: self.workers.max(1),
            max_retries: self.max_retries,
            poll_interval: self.poll_interval,
        }
    }
}

impl fmt::Debug for ActorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorBuilder")
            .field("workers", &self.workers)
            .field("max_retries", &self.max_retries)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

fn default_failure_handler() -> FailureHandler {
    Box::new(|msg, err| {
        warn!(
            key = ?msg.key,
            attempts = msg.attempts,
            error = %err,
            "message failed terminally, dropping"
        );
        Ok(())
    })
}

struct Shared {
    source: Box<dyn Source>,
    queue: Option<Box<dyn DelayQueue>>,
    processor: Box<dyn Processor>,
    backoff: Option<Box<dyn Backoff>>,
    on_failure: FailureHandler,
    max_retries: u32,
    poll_interval: Duration,
    source_exhausted: AtomicBool,
}

impl Shared {
    async fn worker(&self, id: usize, cancel: &CancellationToken) -> Result<(), RunError> {
        while !cancel.is_cancelled() {
            match self.read_once(cancel).await {
                Ok(()) => {}
                Err(ReadError::Exhausted) => {
                    warn!(worker = id, "end of stream reached, worker exiting");
                    return Ok(());
                }
                Err(ReadError::NoMessage) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(ReadError::Other(err)) => return Err(RunError::Source(err)),
            }
        }
        Ok(())
    }

    /// One read attempt: delay queue first, then the source. `NoMessage`
    /// sends the worker into its poll wait; `Exhausted` means neither the
    /// queue nor the source will ever yield again.
    async fn read_once(&self, cancel: &CancellationToken) -> Result<(), ReadError> {
        let queue_state = match &self.queue {
            Some(queue) => match queue.dequeue(self.visit()).await {
                Ok(()) => return Ok(()),
                Err(state @ (ReadError::NoMessage | ReadError::Exhausted)) => state,
                Err(ReadError::Other(err)) => {
                    error!(error = %err, "queue returned unknown error");
                    return Ok(());
                }
            },
            None => ReadError::Exhausted,
        };

        if self.source_exhausted.load(Ordering::Relaxed) {
            // The queue is the sole remaining source; once it is fully
            // drained the worker can stop.
            return Err(queue_state);
        }

        match self.source.read(cancel.clone(), self.visit()).await {
            Err(ReadError::Exhausted) => {
                self.source_exhausted.store(true, Ordering::Relaxed);
                Ok(())
            }
            other => other,
        }
    }

    fn visit(&self) -> Visit<'_> {
        Box::new(move |msg| Box::pin(self.deliver(msg)))
    }

    /// Runs the processor on one message and resolves its disposition.
    /// The returned result is the ack/nack reported to whichever queue or
    /// source handed the message over.
    async fn deliver(&self, mut msg: Message) -> Result<(), BoxError> {
        msg.attempts += 1;
        debug!(key = ?msg.key, attempts = msg.attempts, "processing message");

        let result = match std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.processor.process(msg.clone())
        })) {
            Ok(fut) => match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(recovered_panic(payload)),
            },
            Err(payload) => Err(recovered_panic(payload)),
        };

        match result {
            Ok(()) | Err(ProcessError::Skip) => Ok(()),
            Err(ProcessError::Fail(err)) => {
                self.fail(msg, err);
                Ok(())
            }
            Err(ProcessError::Retry(err)) => self.queue_for_retry(msg, err),
        }
    }

    /// Schedules a retry, or escalates to the failure handler when retries
    /// are disabled or exhausted. Only an enqueue error nacks the read, so
    /// the upstream owner may redeliver.
    fn queue_for_retry(&self, mut msg: Message, cause: BoxError) -> Result<(), BoxError> {
        let (backoff, queue) = match (&self.backoff, &self.queue) {
            (Some(backoff), Some(queue)) => (backoff, queue),
            _ => {
                self.fail(msg, cause);
                return Ok(());
            }
        };

        let retries_done = msg.attempts.saturating_sub(1);
        if retries_done >= self.max_retries {
            self.fail(msg, cause);
            return Ok(());
        }

        let wait = backoff.retry_after(msg.attempts);
        let scheduled_at = msg.scheduled_at.unwrap_or_else(Instant::now);
        msg.scheduled_at = Some(scheduled_at + wait);
        queue.enqueue(msg)
    }

    fn fail(&self, msg: Message, cause: BoxError) {
        if let Err(err) = (self.on_failure)(msg, cause) {
            error!(error = %err, "failure handler failed");
        }
    }

    async fn close_all(&self) {
        self.source.close().await;
        if let Some(queue) = &self.queue {
            queue.close().await;
        }
    }
}

/// Converts a panic payload into a transient processing failure, so a
/// panicking message still participates in the retry/exhaustion path.
fn recovered_panic(payload: Box<dyn Any + Send>) -> ProcessError {
    let text = payload
        .downcast_ref::<&'static str>()
        .copied()
        .map(str::to_owned)
        .or_else(|| payload.downcast_ref::<String>().cloned());
    let message = match text {
        Some(text) => format!("panicked: {text}"),
        None => "panicked".to_owned(),
    };
    error!(error = %message, "recovered a panic");
    ProcessError::Retry(message.into())
}

//! Sources supply the primary stream of incoming messages.
//!
//! The actor only depends on the [`Source`] trait; anything that can hand
//! over one message at a time can feed a worker pool. Two adapters are
//! provided: [`LineSource`] turns any buffered async reader into a stream
//! of line messages, and [`StreamSource`] adapts an arbitrary
//! [`Stream`](tokio_stream::Stream) of messages.

use std::collections::VecDeque;

use futures::future::BoxFuture;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::Mutex;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::{
    delay_queue::Visit,
    error::ReadError,
    message::Message,
};

/// The source of messages for an actor.
///
/// `read` hands at most one message to `visit`; the callback's result is
/// the acknowledgment: `Ok` acks, `Err` nacks, and a nacked message may be
/// redelivered by a later `read`. Implementations must return
/// [`ReadError::NoMessage`] when nothing is available rather than blocking
/// indefinitely, and [`ReadError::Exhausted`] once permanently empty.
///
/// Every worker in the pool calls `read` on the same instance, so
/// implementations must be safe for concurrent invocation and must hand
/// any given message to at most one caller at a time.
pub trait Source: Send + Sync {
    /// Reads the next message and passes it to `visit`.
    ///
    /// Long waits inside `read` are expected to honor `cancel`.
    fn read<'a>(
        &'a self,
        cancel: CancellationToken,
        visit: Visit<'a>,
    ) -> BoxFuture<'a, Result<(), ReadError>>;

    /// Releases any resources held by the source. Called best-effort after
    /// all workers have exited.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

impl<S> Source for std::sync::Arc<S>
where
    S: Source + ?Sized,
{
    fn read<'a>(
        &'a self,
        cancel: CancellationToken,
        visit: Visit<'a>,
    ) -> BoxFuture<'a, Result<(), ReadError>> {
        (**self).read(cancel, visit)
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        (**self).close()
    }
}

/// A [`Source`] that scans a buffered reader line by line.
///
/// Each line becomes one message: the key is the 0-based line number as
/// 8 little-endian bytes and the value is the line text without its
/// terminator. Nacked messages are buffered and redelivered before any new
/// line is read.
#[derive(Debug)]
pub struct LineSource<R> {
    offset: u64,
    limit: Option<u64>,
    state: Mutex<LineState<R>>,
}

#[derive(Debug)]
struct LineState<R> {
    lines: tokio::io::Lines<R>,
    skipped: bool,
    count: u64,
    redeliver: VecDeque<Message>,
}

impl<R> LineSource<R>
where
    R: AsyncBufRead + Send + Unpin,
{
    /// Creates a line source over the given reader.
    pub fn new(reader: R) -> Self {
        LineSource {
            offset: 0,
            limit: None,
            state: Mutex::new(LineState {
                lines: reader.lines(),
                skipped: false,
                count: 0,
                redeliver: VecDeque::new(),
            }),
        }
    }

    /// Skips the first `offset` lines before streaming.
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Stops after streaming `limit` lines; further reads report
    /// exhaustion.
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    async fn next_message(&self, cancel: &CancellationToken) -> Result<Message, ReadError> {
        let mut state = self.state.lock().await;

        if let Some(msg) = state.redeliver.pop_front() {
            return Ok(msg);
        }

        if !state.skipped {
            state.skipped = true;
            for _ in 0..self.offset {
                match state.lines.next_line().await {
                    Ok(Some(_)) => {}
                    Ok(None) => return Err(ReadError::Exhausted),
                    Err(err) => return Err(ReadError::other(err)),
                }
            }
        }

        if self.limit.is_some_and(|limit| state.count >= limit) {
            return Err(ReadError::Exhausted);
        }

        let line = tokio::select! {
            _ = cancel.cancelled() => return Err(ReadError::NoMessage),
            line = state.lines.next_line() => line.map_err(ReadError::other)?,
        };
        match line {
            Some(text) => {
                let number = self.offset + state.count;
                state.count += 1;
                Ok(Message::new(number.to_le_bytes(), text))
            }
            None => Err(ReadError::Exhausted),
        }
    }
}

impl<R> Source for LineSource<R>
where
    R: AsyncBufRead + Send + Unpin,
{
    fn read<'a>(
        &'a self,
        cancel: CancellationToken,
        visit: Visit<'a>,
    ) -> BoxFuture<'a, Result<(), ReadError>> {
        Box::pin(async move {
            let msg = self.next_message(&cancel).await?;
            if visit(msg.clone()).await.is_err() {
                self.state.lock().await.redeliver.push_back(msg);
            }
            Ok(())
        })
    }
}

/// A [`Source`] adapting any stream of messages.
///
/// The end of the stream maps to [`ReadError::Exhausted`]. Nacked messages
/// are buffered and redelivered before the stream is polled again.
#[derive(Debug)]
pub struct StreamSource<S> {
    state: Mutex<StreamState<S>>,
}

#[derive(Debug)]
struct StreamState<S> {
    stream: S,
    done: bool,
    redeliver: VecDeque<Message>,
}

impl<S> StreamSource<S>
where
    S: Stream<Item = Message> + Send + Unpin,
{
    /// Creates a source over the given stream.
    pub fn new(stream: S) -> Self {
        StreamSource {
            state: Mutex::new(StreamState {
                stream,
                done: false,
                redeliver: VecDeque::new(),
            }),
        }
    }
}

impl<S> Source for StreamSource<S>
where
    S: Stream<Item = Message> + Send + Unpin,
{
    fn read<'a>(
        &'a self,
        cancel: CancellationToken,
        visit: Visit<'a>,
    ) -> BoxFuture<'a, Result<(), ReadError>> {
        Box::pin(async move {
            let msg = {
                let mut state = self.state.lock().await;
                match state.redeliver.pop_front() {
                    Some(msg) => msg,
                    None if state.done => return Err(ReadError::Exhausted),
                    None => {
                        let next = tokio::select! {
                            _ = cancel.cancelled() => return Err(ReadError::NoMessage),
                            next = state.stream.next() => next,
                        };
                        match next {
                            Some(msg) => msg,
                            None => {
                                state.done = true;
                                return Err(ReadError::Exhausted);
                            }
                        }
                    }
                }
            };

            if visit(msg.clone()).await.is_err() {
                self.state.lock().await.redeliver.push_back(msg);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_one(source: &impl Source) -> Result<Message, ReadError> {
        use std::sync::{Arc, Mutex};

        let slot = Arc::new(Mutex::new(None));
        let captured = Arc::clone(&slot);
        source
            .read(
                CancellationToken::new(),
                Box::new(move |msg| {
                    Box::pin(async move {
                        *captured.lock().unwrap() = Some(msg);
                        Ok(())
                    })
                }),
            )
            .await?;
        let captured = slot.lock().unwrap().take().expect("visit was not invoked");
        Ok(captured)
    }

    #[tokio::test]
    async fn line_source_numbers_lines() {
        let source = LineSource::new(&b"alpha\nbeta\ngamma\n"[..]);

        for (number, text) in [(0u64, "alpha"), (1, "beta"), (2, "gamma")] {
            let msg = read_one(&source).await.unwrap();
            assert_eq!(msg.key, number.to_le_bytes());
            assert_eq!(msg.value, text.as_bytes());
        }
        assert!(matches!(
            read_one(&source).await,
            Err(ReadError::Exhausted)
        ));
    }

    #[tokio::test]
    async fn line_source_honors_offset_and_limit() {
        let source = LineSource::new(&b"a\nb\nc\nd\ne\n"[..]).offset(1).limit(2);

        let first = read_one(&source).await.unwrap();
        assert_eq!(first.key, 1u64.to_le_bytes());
        assert_eq!(first.value, b"b");

        let second = read_one(&source).await.unwrap();
        assert_eq!(second.key, 2u64.to_le_bytes());
        assert_eq!(second.value, b"c");

        assert!(matches!(
            read_one(&source).await,
            Err(ReadError::Exhausted)
        ));
    }

    #[tokio::test]
    async fn line_source_redelivers_nacked_lines() {
        let source = LineSource::new(&b"a\nb\n"[..]);

        source
            .read(
                CancellationToken::new(),
                Box::new(|_| Box::pin(async { Err("handler failed".into()) })),
            )
            .await
            .unwrap();

        // The nacked line comes back before the next fresh line.
        let msg = read_one(&source).await.unwrap();
        assert_eq!(msg.value, b"a");
        let msg = read_one(&source).await.unwrap();
        assert_eq!(msg.value, b"b");
    }

    #[tokio::test]
    async fn stream_source_ends_with_exhausted() {
        let source = StreamSource::new(tokio_stream::iter(vec![
            Message::new("1", "one"),
            Message::new("2", "two"),
        ]));

        assert_eq!(read_one(&source).await.unwrap().value, b"one");
        assert_eq!(read_one(&source).await.unwrap().value, b"two");
        assert!(matches!(
            read_one(&source).await,
            Err(ReadError::Exhausted)
        ));
        // Exhaustion is sticky.
        assert!(matches!(
            read_one(&source).await,
            Err(ReadError::Exhausted)
        ));
    }
}
